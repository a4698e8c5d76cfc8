use std::net::SocketAddr;

use crate::Id;

use super::Rpc;

/// Information and statistics about this node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addr: SocketAddr,
    user_id: String,
    routing_table_size: usize,
    stored_entries: usize,
    datagrams_sent: u64,
    datagrams_received: u64,
    open_sessions: usize,
    shutdown: bool,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }
    /// Local UDP socket address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    /// User id bound to this node by its identity token.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
    /// Remote contacts in the routing table's active buckets.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }
    /// Live entries in this node's storage.
    pub fn stored_entries(&self) -> usize {
        self.stored_entries
    }
    pub fn datagrams_sent(&self) -> u64 {
        self.datagrams_sent
    }
    /// Valid messages received; undecodable datagrams are not counted.
    pub fn datagrams_received(&self) -> u64 {
        self.datagrams_received
    }
    /// Sessions waiting for a reply, client and server side.
    pub fn open_sessions(&self) -> usize {
        self.open_sessions
    }
    /// Returns `true` once the node stopped, explicitly or after too many
    /// consecutive failures.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }
}

impl From<&Rpc> for Info {
    fn from(rpc: &Rpc) -> Self {
        Self {
            id: *rpc.id(),
            local_addr: rpc.local_addr(),
            user_id: rpc.security().identity().user_id.clone(),
            routing_table_size: rpc.routing_table().size(),
            stored_entries: rpc.storage().len(),
            datagrams_sent: rpc.socket.sent(),
            datagrams_received: rpc.socket.received(),
            open_sessions: rpc.dispatcher.len(),
            shutdown: rpc.is_shutdown(),
        }
    }
}
