//! Struct and implementation of the Contact entry in the Kademlia routing table
use std::{
    fmt::{self, Debug, Formatter},
    net::SocketAddr,
    time::Instant,
};

use crate::common::Id;

/// Consecutive failed probes after which a contact can be evicted.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

#[derive(Clone)]
/// Contact entry in Kademlia routing table
pub struct Contact {
    id: Id,
    address: SocketAddr,
    first_seen: Instant,
    last_seen: Instant,
    failed_probes: u32,
}

impl Contact {
    /// Creates a new Contact from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> Contact {
        let now = Instant::now();

        Contact {
            id,
            address,
            first_seen: now,
            last_seen: now,
            failed_probes: 0,
        }
    }

    /// Creates a contact with a random Id and an unspecified address.
    pub fn random() -> Contact {
        Contact::new(Id::random(), SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn first_seen(&self) -> Instant {
        self.first_seen
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn failed_probes(&self) -> u32 {
        self.failed_probes
    }

    /// Returns true if this contact failed `threshold` probes in a row.
    pub fn is_stale(&self, threshold: u32) -> bool {
        self.failed_probes >= threshold
    }

    // === Public Methods ===

    /// Record a successful exchange with this contact.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.failed_probes = 0;
    }

    /// Record a failed probe, returns the consecutive failure count.
    pub fn mark_failed(&mut self) -> u32 {
        self.failed_probes = self.failed_probes.saturating_add(1);
        self.failed_probes
    }

    /// Take the newer address of the same peer, keeping its history.
    pub(crate) fn refresh_from(&mut self, other: &Contact) {
        self.address = other.address;
        self.touch();
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.address == other.address
    }
}

impl Eq for Contact {}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contact")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("failed_probes", &self.failed_probes)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn touch_resets_failures() {
        let mut contact = Contact::random();
        let before = contact.last_seen();

        assert_eq!(contact.mark_failed(), 1);
        assert_eq!(contact.mark_failed(), 2);

        contact.touch();

        assert_eq!(contact.failed_probes(), 0);
        assert!(contact.last_seen() >= before);
        assert_eq!(contact.first_seen(), before);
    }

    #[test]
    fn stale_after_threshold() {
        let mut contact = Contact::random();

        for _ in 0..DEFAULT_FAILURE_THRESHOLD - 1 {
            contact.mark_failed();
        }
        assert!(!contact.is_stale(DEFAULT_FAILURE_THRESHOLD));

        contact.mark_failed();
        assert!(contact.is_stale(DEFAULT_FAILURE_THRESHOLD));
    }
}
