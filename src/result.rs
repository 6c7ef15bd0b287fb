//! Results of the DHT operations.

use std::net::SocketAddr;
use std::time::Duration;

use crate::common::{Contact, DhtValueEntity, EntityKey, Kuid, SecurityToken};

#[derive(Debug, Clone)]
pub struct PingResult {
    /// The contact that responded.
    pub contact: Contact,
    /// Our address as seen by the responding contact.
    pub external_address: SocketAddr,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
/// Outcome of an iterative FIND_NODE lookup.
pub struct FindNodeResult {
    pub target: Kuid,
    /// Up to K closest responders to the target, closest first, with the
    /// security token each one handed out. Includes the local contact.
    pub path: Vec<(Contact, Option<SecurityToken>)>,
    /// Live remote nodes claiming the local node id.
    pub collisions: Vec<Contact>,
    /// Contacts from the routing table that failed to respond.
    pub route_table_failures: usize,
    /// Responders that were not in the routing table before.
    pub new_contacts: usize,
    pub elapsed: Duration,
}

impl FindNodeResult {
    /// The path without the local contact.
    pub fn remote_contacts<'a>(
        &'a self,
        local: &'a Contact,
    ) -> impl Iterator<Item = &'a (Contact, Option<SecurityToken>)> + 'a {
        self.path
            .iter()
            .filter(move |(contact, _)| contact.id() != local.id())
    }
}

#[derive(Debug, Clone)]
/// Outcome of an iterative FIND_VALUE lookup.
pub struct FindValueResult {
    pub key: EntityKey,
    /// Values found, empty if none of the nodes close to the key had any.
    pub entities: Vec<DhtValueEntity>,
    /// Nodes that were asked, closest first.
    pub path: Vec<(Contact, Option<SecurityToken>)>,
    pub route_table_failures: usize,
    pub elapsed: Duration,
}

impl FindValueResult {
    pub fn is_success(&self) -> bool {
        !self.entities.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct StoreResult {
    pub entities: Vec<DhtValueEntity>,
    /// Nodes that accepted every entity.
    pub stored_at: Vec<Contact>,
    /// Nodes that rejected some entity or failed to respond.
    pub failed: Vec<Contact>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapResultType {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct BootstrapResult {
    /// The contact the bootstrap started from.
    pub contact: Contact,
    pub elapsed: Duration,
    pub result_type: BootstrapResultType,
}

impl BootstrapResult {
    pub fn is_success(&self) -> bool {
        self.result_type == BootstrapResultType::Succeeded
    }
}
