//! Struct and implementation of the Contact entry in the Kademlia routing table
use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::time::Instant;

use crate::common::Kuid;

/// Liveness of a [Contact] as far as the local node knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContactState {
    /// Responded to a request recently.
    Alive,
    /// Learned from a third party, or reset after a stale routing table purge.
    Unknown,
    /// Failed to respond too many times.
    Dead,
}

#[derive(Clone)]
/// A remote (or the local) participant of the DHT.
pub struct Contact {
    id: Kuid,
    address: SocketAddr,
    state: ContactState,
    last_seen: Option<Instant>,
    failures: u32,
    firewalled: bool,
}

impl Contact {
    /// Creates a new Contact we have only heard about.
    pub fn new(id: Kuid, address: SocketAddr) -> Contact {
        Contact {
            id,
            address,
            state: ContactState::Unknown,
            last_seen: None,
            failures: 0,
            firewalled: false,
        }
    }

    /// Creates a Contact that just talked to us.
    pub fn alive(id: Kuid, address: SocketAddr) -> Contact {
        Contact::new(id, address).with_state(ContactState::Alive)
    }

    pub fn with_state(mut self, state: ContactState) -> Self {
        self.state = state;
        if state == ContactState::Alive {
            self.last_seen = Some(Instant::now());
            self.failures = 0;
        }
        self
    }

    pub fn with_firewalled(mut self, firewalled: bool) -> Self {
        self.firewalled = firewalled;
        self
    }

    // === Getters ===

    pub fn id(&self) -> &Kuid {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn state(&self) -> ContactState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.state == ContactState::Alive
    }

    pub fn is_dead(&self) -> bool {
        self.state == ContactState::Dead
    }

    pub fn is_firewalled(&self) -> bool {
        self.firewalled
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    /// Same node id and same contact address.
    pub fn same_endpoint(&self, other: &Contact) -> bool {
        self.id == other.id && self.address == other.address
    }

    // === Public Methods ===

    pub(crate) fn set_id(&mut self, id: Kuid) {
        self.id = id;
    }

    pub(crate) fn set_state(&mut self, state: ContactState) {
        self.state = state;
    }

    /// Record a failed request, returns the new failure count.
    pub(crate) fn record_failure(&mut self) -> u32 {
        self.failures += 1;
        self.failures
    }

    /// Merge what we just learned about the same node into this entry.
    pub(crate) fn update_from(&mut self, other: &Contact) {
        self.address = other.address;
        self.firewalled = other.firewalled;

        if other.is_alive() {
            self.state = ContactState::Alive;
            self.last_seen = other.last_seen.or_else(|| Some(Instant::now()));
            self.failures = 0;
        }
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.same_endpoint(other)
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.address.hash(state);
    }
}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contact")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state)
            .field("failures", &self.failures)
            .finish()
    }
}

#[cfg(test)]
impl Contact {
    /// Creates a random contact for testing purposes.
    pub(crate) fn random() -> Contact {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        Contact::new(
            Kuid::random(),
            SocketAddr::from(([rng.gen(), rng.gen(), rng.gen(), rng.gen()], rng.gen())),
        )
    }
}
