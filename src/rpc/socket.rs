//! UDP socket layer and the session id dispatcher routing datagrams to sessions.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::{mapref::entry::Entry, DashMap};
use flume::{Receiver, Sender};
use rand::Rng;
use tracing::trace;

use crate::common::Message;

use super::config::MAX_DATAGRAM_SIZE;

/// How long a blocking receive waits before the listener rechecks for shutdown.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// A UdpSocket wrapper that encodes, decodes and counts session messages.
#[derive(Debug)]
pub struct DhtSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
    sent: AtomicU64,
    received: AtomicU64,
}

impl DhtSocket {
    pub(crate) fn bind(address: SocketAddr) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(address)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        Ok(DhtSocket {
            local_addr: socket.local_addr()?,
            socket,
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
        })
    }

    // === Getters ===

    /// Returns the address the socket is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Datagrams sent so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Valid messages received so far.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    // === Public Methods ===

    /// Encodes and sends one message.
    pub fn send(&self, to: SocketAddr, message: &Message) -> Result<(), SendMessageError> {
        let bytes = message.to_bytes()?;

        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(SendMessageError::TooLarge(bytes.len()));
        }

        self.socket.send_to(&bytes, to)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        trace!(context = "socket_message_sending", ?message, ?to);

        Ok(())
    }

    /// Receives a single message, blocking for at most [READ_TIMEOUT].
    /// On success, returns the message and its origin.
    pub fn recv_from(&self, buf: &mut [u8]) -> Option<(Message, SocketAddr)> {
        match self.socket.recv_from(buf) {
            Ok((amt, from)) => {
                let bytes = &buf[..amt];

                if from.port() == 0 {
                    trace!(context = "socket_validation", "Message from port 0");
                    return None;
                }

                match Message::from_bytes(bytes) {
                    Ok(message) => {
                        self.received.fetch_add(1, Ordering::Relaxed);
                        trace!(context = "socket_message_receiving", ?message, ?from);

                        Some((message, from))
                    }
                    Err(error) => {
                        trace!(
                            context = "socket_error",
                            ?error,
                            ?from,
                            message = ?String::from_utf8_lossy(bytes),
                            "Received invalid message."
                        );
                        None
                    }
                }
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                None
            }
            Err(e) => {
                trace!(context = "socket_error", ?e, "recv_from failed unexpectedly");
                None
            }
        }
    }
}

#[derive(thiserror::Error, Debug)]
/// Failure to put a message on the wire.
pub enum SendMessageError {
    /// Errors related to encoding messages.
    #[error("Failed to encode message: {0}")]
    Encode(#[from] crate::Error),

    /// Encoded message does not fit in one datagram.
    #[error("Message of {0} bytes does not fit in a datagram")]
    TooLarge(usize),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}

/// A received message and its origin.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub message: Message,
    pub from: SocketAddr,
}

/// Session id → pending session map shared by the listener and every session.
#[derive(Debug, Default)]
pub struct Dispatcher {
    sessions: DashMap<i64, Sender<Inbound>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Registers a client session under a fresh random id.
    pub fn register(&self) -> (i64, Receiver<Inbound>) {
        let mut rng = rand::thread_rng();

        loop {
            let session_id: i64 = rng.gen();

            if let Some(inbox) = self.register_with(session_id) {
                return (session_id, inbox);
            }
        }
    }

    /// Registers a session under an id chosen by the peer, None if it is taken.
    pub fn register_with(&self, session_id: i64) -> Option<Receiver<Inbound>> {
        match self.sessions.entry(session_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let (sender, receiver) = flume::unbounded();
                entry.insert(sender);
                Some(receiver)
            }
        }
    }

    pub fn deregister(&self, session_id: i64) {
        self.sessions.remove(&session_id);
    }

    /// Hands a message to its session, or returns it if no session claims it.
    pub fn dispatch(&self, inbound: Inbound) -> Option<Inbound> {
        let session_id = inbound.message.session_id();

        match self.sessions.get(&session_id) {
            Some(session) => {
                if session.send(inbound).is_err() {
                    trace!(context = "dispatcher", session_id, "Session already closed");
                }
                None
            }
            None => Some(inbound),
        }
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use bytes::Bytes;

    use crate::common::{random_nonce, Id, NonceMessage, RequestPayload, RpcBody, RpcMessage};
    use crate::identity::Issuer;
    use crate::security::Authenticator;

    use super::*;

    fn nonce_message(session_id: i64) -> Message {
        Message::Nonce(NonceMessage {
            is_response: false,
            session_id,
            sender: Id::random(),
            nonce: random_nonce(),
        })
    }

    fn localhost() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[test]
    fn send_and_receive() {
        let server = DhtSocket::bind(localhost()).unwrap();
        let client = DhtSocket::bind(localhost()).unwrap();

        let server_address = server.local_addr();
        let client_address = client.local_addr();
        let message = nonce_message(120);
        let expected = message.clone();

        let server_thread = thread::spawn(move || {
            let mut buf = vec![0; MAX_DATAGRAM_SIZE];
            loop {
                if let Some((message, from)) = server.recv_from(&mut buf) {
                    assert_eq!(from.port(), client_address.port());
                    assert_eq!(message, expected);
                    assert_eq!(server.received(), 1);
                    break;
                }
            }
        });

        client.send(server_address, &message).unwrap();
        assert_eq!(client.sent(), 1);

        server_thread.join().unwrap();
    }

    #[test]
    fn oversized_messages_are_not_sent() {
        let client = DhtSocket::bind(localhost()).unwrap();
        let issuer = Issuer::random();

        let message = Message::Rpc(RpcMessage {
            session_id: 7,
            identity: issuer.issue("alice", [1; 32], Duration::from_secs(60)),
            authenticator: Authenticator {
                addressee: Id::random(),
                nonce: random_nonce(),
                payload_hash: [0; 20],
                signature: [0; 64],
            },
            rpc: RpcBody::Request(RequestPayload::Ping),
            encoded_rpc: Bytes::from(vec![0; MAX_DATAGRAM_SIZE]),
        });

        assert!(matches!(
            client.send(localhost(), &message),
            Err(SendMessageError::TooLarge(size)) if size > MAX_DATAGRAM_SIZE
        ));
        assert_eq!(client.sent(), 0);
    }

    #[test]
    fn garbage_is_not_counted() {
        let server = DhtSocket::bind(localhost()).unwrap();
        let raw = UdpSocket::bind(localhost()).unwrap();

        raw.send_to(b"d1:xi1ee", server.local_addr()).unwrap();

        let mut buf = vec![0; MAX_DATAGRAM_SIZE];
        assert!(server.recv_from(&mut buf).is_none());
        assert_eq!(server.received(), 0);
    }

    #[test]
    fn dispatch_to_registered_session() {
        let dispatcher = Dispatcher::new();
        let (session_id, inbox) = dispatcher.register();

        let claimed = dispatcher.dispatch(Inbound {
            message: nonce_message(session_id),
            from: localhost(),
        });
        assert!(claimed.is_none());
        assert_eq!(inbox.try_recv().unwrap().message.session_id(), session_id);

        dispatcher.deregister(session_id);
        assert!(dispatcher.is_empty());

        let unclaimed = dispatcher.dispatch(Inbound {
            message: nonce_message(session_id),
            from: localhost(),
        });
        assert!(unclaimed.is_some());
    }

    #[test]
    fn peer_chosen_ids_are_unique() {
        let dispatcher = Dispatcher::new();

        assert!(dispatcher.register_with(7).is_some());
        assert!(dispatcher.register_with(7).is_none());
        assert_eq!(dispatcher.len(), 1);
    }
}
