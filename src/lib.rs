#![doc = include_str!("../README.md")]

// Public modules
mod async_result;
mod common;
mod error;
mod identity;
mod maintenance;
mod node;
mod query;
pub mod rpc;
pub mod security;
mod snapshot;
pub mod storage;

pub use crate::common::{
    messages, BitIndex, Contact, FindValueResponse, Id, Liveness, SelectMode, ID_BITS, ID_SIZE,
};
pub use async_result::{AsyncResult, Completer};
pub use bytes::Bytes;
pub use error::{Error, Result, TaskError};
pub use identity::{random_signing_key, BootstrapList, IdentityToken, Issuer};
pub use node::{Addressee, Node, NodeBuilder, DEFAULT_TOKEN_VALIDITY};
pub use query::ClosestNodes;
pub use rpc::{Config, Info};
pub use snapshot::{Snapshot, SNAPSHOT_VERSION};
pub use storage::{BatchItem, ContentFilter, MemoryStorage, Storage, StorageEntry};

pub use ed25519_dalek::SigningKey;
