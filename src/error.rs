//! Main Crate Error

use crate::Id;

#[derive(thiserror::Error, Debug)]
/// Authdht crate error enum.
pub enum Error {
    /// Id bytes were not exactly [crate::ID_SIZE] long.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// Id string was not 40 hex characters.
    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    /// A message decoded fine as bencode but violates the protocol.
    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),

    /// Public keys or signatures of the wrong length or shape.
    #[error("Invalid key material: {0}")]
    InvalidKey(&'static str),

    /// Content was rejected before anything was sent.
    #[error("Content of {size} bytes exceeds the maximum of {max} bytes")]
    ContentTooLarge { size: usize, max: usize },

    /// A persisted snapshot from an unknown format version.
    #[error("Unsupported snapshot version {0}")]
    UnsupportedSnapshotVersion(i64),

    /// Rejected [crate::Config] value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Bootstrap list signature did not verify against the issuer key.
    #[error("Bootstrap list is not signed by the issuer")]
    UntrustedBootstrapList,
}

/// Failure delivered through an [crate::AsyncResult].
///
/// Unlike [Error] this is `Clone`, since every observer of a result gets its own copy.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// No reply within the per-call timeout.
    #[error("Request timed out")]
    Timeout,

    /// The caller cancelled the result.
    #[error("Task was cancelled")]
    Cancelled,

    /// An [Id] could not be resolved to an address through the routing table.
    #[error("No contact known for {0}")]
    UnknownContact(Id),

    /// The peer replied with a payload that does not match the request.
    #[error("Unexpected response payload")]
    UnexpectedResponse,

    /// The datagram could not be sent.
    #[error("Failed to send: {0}")]
    Send(String),

    /// A worker thread could not be spawned.
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    /// The node shut down before the task could finish.
    #[error("Node is shut down")]
    Shutdown,

    /// The completing side was dropped without producing a value.
    #[error("Task was abandoned")]
    Abandoned,
}

/// Crate result, defaulting to [Error].
pub type Result<T, E = Error> = std::result::Result<T, E>;
