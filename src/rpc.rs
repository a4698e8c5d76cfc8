//! Session based RPC layer: one shared context per node, the datagram listener,
//! and single request/response exchanges with remote nodes.

pub mod config;
mod info;
mod server;
mod session;
mod socket;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use dashmap::DashSet;
use tracing::{debug, info, trace, warn};

use bytes::Bytes;

use crate::common::{
    Contact, FailureOutcome, FindValueRequest, FindValueResponse, Id, Insertion, Message,
    RequestPayload, ResponsePayload, RoutingTable, RpcBody, RpcMessage, StoreRequest, NONCE_SIZE,
};
use crate::identity::IdentityToken;
use crate::security::{Authenticator, Security};
use crate::storage::Storage;
use crate::{Result, TaskError};

pub use config::{Config, DEFAULT_MAX_CONTENT_SIZE, DEFAULT_REQUEST_TIMEOUT, MAX_DATAGRAM_SIZE};
pub use info::Info;
pub use socket::SendMessageError;

use socket::{DhtSocket, Dispatcher, Inbound};

/// Everything one node shares between its listener, sessions and queries.
#[derive(Debug)]
pub(crate) struct Rpc {
    id: Id,
    config: Config,
    security: Box<dyn Security>,
    storage: Arc<dyn Storage>,
    routing_table: Mutex<RoutingTable>,
    socket: DhtSocket,
    dispatcher: Dispatcher,
    blacklist: DashSet<String>,
    shutdown: AtomicBool,
    payload_budget: usize,
}

impl Rpc {
    /// Binds the socket and builds the routing table. The listener is not started yet.
    pub fn new(
        config: Config,
        security: Box<dyn Security>,
        storage: Arc<dyn Storage>,
        address: SocketAddr,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let socket = DhtSocket::bind(address)?;
        let id = security.identity().node_id;
        let local = Contact::new(id, socket.local_addr());
        let payload_budget = payload_budget(security.identity())?;

        Ok(Arc::new(Rpc {
            id,
            routing_table: Mutex::new(RoutingTable::new(local, &config)),
            config,
            security,
            storage,
            socket,
            dispatcher: Dispatcher::new(),
            blacklist: DashSet::new(),
            shutdown: AtomicBool::new(false),
            payload_budget,
        }))
    }

    /// Spawns the datagram listener thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let rpc = self.clone();

        thread::Builder::new()
            .name(format!("authdht-listener-{}", self.socket.local_addr().port()))
            .spawn(move || listen(rpc))?;

        Ok(())
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn local_contact(&self) -> Contact {
        Contact::new(self.id, self.local_addr())
    }

    pub fn security(&self) -> &dyn Security {
        self.security.as_ref()
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Locks the routing table, recovering it if a holder panicked.
    pub fn routing_table(&self) -> MutexGuard<'_, RoutingTable> {
        self.routing_table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Largest encoded [RpcBody] this node can send in one datagram.
    pub fn payload_budget(&self) -> usize {
        self.payload_budget
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn is_blacklisted(&self, user_id: &str) -> bool {
        self.blacklist.contains(user_id)
    }

    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Public Methods ===

    pub fn blacklist(&self, user_id: &str) {
        self.blacklist.insert(user_id.to_string());
    }

    pub fn unblacklist(&self, user_id: &str) -> bool {
        self.blacklist.remove(user_id).is_some()
    }

    /// Stops the listener; open sessions run into their timeouts.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            info!(id = ?self.id, "Shutting down node");
        }
    }

    /// Resolves an id to a contact through the routing table.
    pub fn resolve(&self, id: &Id) -> Result<Contact, TaskError> {
        self.routing_table()
            .get(id)
            .ok_or(TaskError::UnknownContact(*id))
    }

    /// Runs one session with `to`, blocking until the reply or the timeout.
    pub fn request(
        self: &Arc<Self>,
        to: &Contact,
        request: RequestPayload,
    ) -> Result<ResponsePayload, TaskError> {
        session::call(self, to, request)
    }

    pub fn ping(self: &Arc<Self>, to: &Contact) -> Result<(), TaskError> {
        match self.request(to, RequestPayload::Ping)? {
            ResponsePayload::Ping => Ok(()),
            _ => Err(TaskError::UnexpectedResponse),
        }
    }

    pub fn find_node(self: &Arc<Self>, to: &Contact, target: Id) -> Result<Vec<Contact>, TaskError> {
        match self.request(to, RequestPayload::FindNode { target })? {
            ResponsePayload::FindNode { contacts } => Ok(contacts),
            _ => Err(TaskError::UnexpectedResponse),
        }
    }

    pub fn find_value(
        self: &Arc<Self>,
        to: &Contact,
        request: FindValueRequest,
    ) -> Result<FindValueResponse, TaskError> {
        match self.request(to, RequestPayload::FindValue(request))? {
            ResponsePayload::FindValue(response) => Ok(response),
            _ => Err(TaskError::UnexpectedResponse),
        }
    }

    pub fn store(self: &Arc<Self>, to: &Contact, request: StoreRequest) -> Result<bool, TaskError> {
        match self.request(to, RequestPayload::Store(request))? {
            ResponsePayload::Store { stored } => Ok(stored),
            _ => Err(TaskError::UnexpectedResponse),
        }
    }

    // === Private Methods ===

    /// Adds a contact that just proved to be alive.
    ///
    /// When its bucket is full, the least recently seen contact is pinged in
    /// the background so a dead one gets replaced.
    fn record_success(self: &Arc<Self>, contact: Contact) {
        let insertion = self.routing_table().add(contact);

        if let Insertion::Cached { probe: Some(probe) } = insertion {
            let rpc = self.clone();
            let spawned = thread::Builder::new()
                .name("authdht-probe".to_string())
                .spawn(move || {
                    let _ = rpc.ping(&probe);
                });

            if let Err(error) = spawned {
                debug!(?error, "Failed to spawn liveness probe");
            }
        }
    }

    /// Records an unanswered session with `id`.
    fn record_failure(&self, id: &Id) {
        let outcome = self.routing_table().handle_failure(id);
        trace!(?id, ?outcome, "Recorded failure");

        if outcome == FailureOutcome::Disconnected {
            warn!(
                id = ?self.id,
                max_consecutive_failures = self.config.max_consecutive_failures,
                "Too many consecutive failures, considering the node disconnected"
            );
            self.shutdown();
        }
    }
}

/// Room left for the encoded [RpcBody] once the envelope of an RPC message
/// signed with `identity` is accounted for.
fn payload_budget(identity: &IdentityToken) -> Result<usize> {
    let envelope = Message::Rpc(RpcMessage {
        session_id: i64::MIN,
        identity: identity.clone(),
        authenticator: Authenticator {
            addressee: Id::MIN,
            nonce: [0; NONCE_SIZE],
            payload_hash: [0; 20],
            signature: [0; 64],
        },
        rpc: RpcBody::Request(RequestPayload::Ping),
        encoded_rpc: Bytes::new(),
    });

    // The payload's length prefix grows from "0:" to at most "65507:".
    let overhead = envelope.to_bytes()?.len() + 4;

    Ok(MAX_DATAGRAM_SIZE.saturating_sub(overhead))
}

/// Listener loop: routes datagrams to their sessions and starts a server
/// session for every unclaimed nonce request.
fn listen(rpc: Arc<Rpc>) {
    let mut buf = vec![0_u8; MAX_DATAGRAM_SIZE];

    while !rpc.is_shutdown() {
        let Some((message, from)) = rpc.socket.recv_from(&mut buf) else {
            continue;
        };

        let Some(unclaimed) = rpc.dispatcher.dispatch(Inbound { message, from }) else {
            continue;
        };

        match unclaimed.message {
            Message::Nonce(nonce) if !nonce.is_response => {
                let Some(inbox) = rpc.dispatcher.register_with(nonce.session_id) else {
                    continue;
                };

                let session_rpc = rpc.clone();
                let session_id = nonce.session_id;
                let spawned = thread::Builder::new()
                    .name("authdht-session".to_string())
                    .spawn(move || session::serve(&session_rpc, nonce, from, inbox));

                if let Err(error) = spawned {
                    debug!(?error, "Failed to spawn server session");
                    rpc.dispatcher.deregister(session_id);
                }
            }
            message => {
                trace!(
                    context = "dispatcher",
                    session_id = message.session_id(),
                    ?from,
                    "Dropped message of unknown session"
                );
            }
        }
    }

    debug!(address = ?rpc.local_addr(), "Listener stopped");
}
