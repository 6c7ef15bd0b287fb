//! Dht node.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, MutexGuard};

use tracing::{debug, info};

use crate::common::{Contact, DhtValueEntity, EntityKey, Kuid, RoutingTable, SecurityToken};
use crate::concurrent::{DhtFuture, TaskExecutor};
use crate::context::Context;
use crate::dispatcher::MessageDispatcher;
use crate::manager::{
    BootstrapManager, BootstrapSeed, FindNodeManager, FindValueManager, PingManager, StoreManager,
};
use crate::result::{BootstrapResult, FindNodeResult, FindValueResult, PingResult, StoreResult};
use crate::{Config, Error, Result};

#[derive(Debug)]
/// A Kademlia DHT node on top of a [MessageDispatcher].
pub struct Dht {
    context: Arc<Context>,
    ping: Arc<PingManager>,
    find_node: Arc<FindNodeManager>,
    find_value: FindValueManager,
    store: StoreManager,
    bootstrap: BootstrapManager,
}

impl Dht {
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    // === Getters ===

    pub fn local_contact(&self) -> Contact {
        self.context.local_contact()
    }

    pub fn local_id(&self) -> Kuid {
        self.context.local_id()
    }

    pub fn config(&self) -> &Config {
        &self.context.config
    }

    /// Returns `true` once a bootstrap succeeded.
    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrap.is_bootstrapped()
    }

    /// Locks the routing table, hold the guard briefly since every running
    /// task needs it.
    pub fn routing_table(&self) -> MutexGuard<'_, RoutingTable> {
        self.context.routing_table()
    }

    // === Public Methods ===

    /// Add a known contact to the routing table, returns `true` if it was new.
    pub fn add_contact(&self, contact: Contact) -> bool {
        self.routing_table().add(contact)
    }

    pub fn ping(&self, address: SocketAddr) -> DhtFuture<PingResult> {
        self.ping.ping(address)
    }

    pub fn ping_contact(&self, contact: &Contact) -> DhtFuture<PingResult> {
        self.ping.ping_contact(contact)
    }

    /// Find the K closest nodes to `target`.
    pub fn find_node(&self, target: Kuid) -> DhtFuture<FindNodeResult> {
        self.find_node.lookup(target)
    }

    /// Find the values matching `key`.
    pub fn find_value(&self, key: EntityKey) -> DhtFuture<FindValueResult> {
        self.find_value.get(key)
    }

    /// Store `entities` at the K closest nodes to their shared primary key.
    ///
    /// Fails right away if `entities` is empty or the primary keys differ.
    pub fn store(&self, entities: Vec<DhtValueEntity>) -> Result<DhtFuture<StoreResult>> {
        self.store.store(entities)
    }

    /// Store `entities` at `contact`, fetching its security token first
    /// when `token` is `None` and tokens are required.
    pub fn store_at(
        &self,
        contact: Contact,
        token: Option<SecurityToken>,
        entities: Vec<DhtValueEntity>,
    ) -> Result<DhtFuture<StoreResult>> {
        self.store.store_at(contact, token, entities)
    }

    /// Bootstrap from a known contact.
    pub fn bootstrap(&self, contact: Contact) -> DhtFuture<BootstrapResult> {
        self.bootstrap.bootstrap(BootstrapSeed::Contact(contact))
    }

    /// Bootstrap from the first of `addresses` answering a ping.
    pub fn bootstrap_from_addresses(
        &self,
        addresses: Vec<SocketAddr>,
    ) -> DhtFuture<BootstrapResult> {
        self.bootstrap.bootstrap(BootstrapSeed::Addresses(addresses))
    }

    /// Cancel every running operation.
    pub fn shutdown(&self) {
        info!(id = ?self.local_id(), "Shutting down");

        self.bootstrap.cancel();
        self.store.cancel_all();
        self.find_value.cancel_all();
        self.find_node.cancel_all();
        self.ping.cancel_all();
    }
}

#[derive(Debug, Default)]
/// Configures and builds a [Dht].
pub struct DhtBuilder {
    config: Config,
    dispatcher: Option<Arc<dyn MessageDispatcher>>,
    address: Option<SocketAddr>,
    id: Option<Kuid>,
    executor: Option<Arc<TaskExecutor>>,
    dedicated_executor: bool,
}

impl DhtBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Required. Carries every request of the node.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn MessageDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Address advertised in the local contact.
    ///
    /// Defaults to `0.0.0.0:0`.
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Local node id, random if not set.
    pub fn id(mut self, id: Kuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Run tasks on `executor` instead of [TaskExecutor::shared].
    pub fn executor(mut self, executor: Arc<TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Run tasks on a pool of [crate::ExecutorSettings::pool_size] threads
    /// owned by this node.
    pub fn dedicated_executor(mut self) -> Self {
        self.dedicated_executor = true;
        self
    }

    pub fn build(self) -> Result<Dht> {
        let dispatcher = self
            .dispatcher
            .ok_or(Error::InvalidArgument("A message dispatcher is required"))?;

        let executor = match self.executor {
            Some(executor) => executor,
            None if self.dedicated_executor => {
                Arc::new(TaskExecutor::new(self.config.executor.pool_size)?)
            }
            None => TaskExecutor::shared(),
        };

        let address = self
            .address
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        let local = Contact::alive(self.id.unwrap_or_else(Kuid::random), address);

        debug!(id = ?local.id(), ?address, "Starting Dht node");

        let context = Arc::new(Context::new(local, dispatcher, executor, self.config));

        let ping = Arc::new(PingManager::new(context.clone()));
        let find_node = Arc::new(FindNodeManager::new(context.clone()));

        Ok(Dht {
            find_value: FindValueManager::new(context.clone()),
            store: StoreManager::new(context.clone()),
            bootstrap: BootstrapManager::new(context.clone(), ping.clone(), find_node.clone()),
            context,
            ping,
            find_node,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{random_address, SimNetwork};

    #[test]
    fn requires_dispatcher() {
        assert!(matches!(
            Dht::builder().build(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn builds_with_id_and_address() {
        let id = Kuid::random();
        let address = random_address();

        let dht = Dht::builder()
            .dispatcher(SimNetwork::new())
            .id(id)
            .address(address)
            .build()
            .unwrap();

        assert_eq!(dht.local_id(), id);
        assert_eq!(dht.local_contact().address(), address);
        assert!(!dht.is_bootstrapped());
        assert!(dht.routing_table().is_empty());
    }

    #[test]
    fn add_contact() {
        let dht = Dht::builder()
            .dispatcher(SimNetwork::new())
            .build()
            .unwrap();

        let contact = Contact::alive(Kuid::random(), random_address());

        assert!(dht.add_contact(contact.clone()));
        assert!(!dht.add_contact(contact));
        assert_eq!(dht.routing_table().size(), 1);
    }
}
