use std::net::SocketAddr;
use std::sync::Arc;

use crate::common::Contact;
use crate::concurrent::{DhtFuture, DhtTask};
use crate::context::Context;
use crate::handler::{PingResponseHandler, PingTargets};
use crate::manager::FutureMap;
use crate::result::PingResult;

#[derive(Debug)]
/// Pings remote nodes, concurrent pings of the same address share one request.
pub struct PingManager {
    context: Arc<Context>,
    futures: FutureMap<SocketAddr, PingResult>,
}

impl PingManager {
    pub(crate) fn new(context: Arc<Context>) -> Self {
        PingManager {
            context,
            futures: FutureMap::new(),
        }
    }

    /// Ping an address.
    pub fn ping(&self, address: SocketAddr) -> DhtFuture<PingResult> {
        self.futures
            .get_or_start(address, || self.start(PingTargets::Addresses(vec![address])))
    }

    /// Ping a known contact.
    pub fn ping_contact(&self, contact: &Contact) -> DhtFuture<PingResult> {
        let targets = PingTargets::Contacts(vec![contact.clone()]);

        self.futures
            .get_or_start(contact.address(), || self.start(targets))
    }

    /// Ping all addresses at once, the first pong completes the future.
    pub fn ping_any(&self, addresses: Vec<SocketAddr>) -> DhtFuture<PingResult> {
        self.start(PingTargets::Addresses(addresses))
    }

    /// Ping remote nodes that claim the local node id.
    pub fn collision_ping(&self, contacts: Vec<Contact>) -> DhtFuture<PingResult> {
        self.start(PingTargets::Collision(contacts))
    }

    pub(crate) fn cancel_all(&self) {
        self.futures.cancel_all();
    }

    fn start(&self, targets: PingTargets) -> DhtFuture<PingResult> {
        let handler = Arc::new(PingResponseHandler::new(self.context.clone(), targets));
        let future = DhtFuture::new(handler.wait_on_lock());

        self.context.executor.execute(handler, future.clone());

        future
    }
}
