//! Routing record of a remote peer.
use std::{
    net::SocketAddr,
    time::Instant,
};

use crate::common::Id;

/// Whether a [Contact] is considered reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
}

#[derive(Debug, Clone)]
/// Contact entry in the routing table.
pub struct Contact {
    id: Id,
    address: SocketAddr,
    liveness: Liveness,
    failures: u32,
    last_seen: Instant,
}

impl Contact {
    /// Creates a new, alive contact seen just now.
    pub fn new(id: Id, address: SocketAddr) -> Contact {
        Contact {
            id,
            address,
            liveness: Liveness::Alive,
            failures: 0,
            last_seen: Instant::now(),
        }
    }

    /// Creates a contact with a random id, useful for testing.
    pub fn random() -> Contact {
        Contact::new(Id::random(), SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    pub fn with_id(mut self, id: Id) -> Self {
        self.id = id;
        self
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    pub fn is_alive(&self) -> bool {
        self.liveness == Liveness::Alive
    }

    /// Consecutive failed exchanges since the last success.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    // === Public Methods ===

    /// Record a successful exchange.
    pub fn refresh(&mut self) {
        self.failures = 0;
        self.liveness = Liveness::Alive;
        self.last_seen = Instant::now();
    }

    pub(crate) fn set_address(&mut self, address: SocketAddr) {
        self.address = address;
    }

    /// Record a failed exchange, marking the contact dead once `threshold` is reached.
    pub fn handle_failure(&mut self, threshold: u32) {
        self.failures = self.failures.saturating_add(1);

        if self.failures >= threshold {
            self.liveness = Liveness::Dead;
        }
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.address == other.address
    }
}

impl Eq for Contact {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn liveness_state_machine() {
        let mut contact = Contact::random();
        assert!(contact.is_alive());

        contact.handle_failure(3);
        contact.handle_failure(3);
        assert!(contact.is_alive());
        assert_eq!(contact.failures(), 2);

        contact.handle_failure(3);
        assert_eq!(contact.liveness(), Liveness::Dead);

        contact.refresh();
        assert!(contact.is_alive());
        assert_eq!(contact.failures(), 0);
    }
}
