//! State shared by every manager and task of one DHT node.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::common::{
    Contact, ContactState, Kuid, RequestSpecific, RequestTypeSpecific, RoutingTable,
};
use crate::concurrent::TaskExecutor;
use crate::dispatcher::MessageDispatcher;
use crate::Config;

#[derive(Debug)]
pub(crate) struct Context {
    routing_table: Mutex<RoutingTable>,
    pub(crate) dispatcher: Arc<dyn MessageDispatcher>,
    pub(crate) executor: Arc<TaskExecutor>,
    pub(crate) config: Config,
    bootstrapped: AtomicBool,
}

impl Context {
    pub fn new(
        local: Contact,
        dispatcher: Arc<dyn MessageDispatcher>,
        executor: Arc<TaskExecutor>,
        config: Config,
    ) -> Self {
        Context {
            routing_table: Mutex::new(RoutingTable::new(local)),
            dispatcher,
            executor,
            config,
            bootstrapped: AtomicBool::new(false),
        }
    }

    // === Getters ===

    pub fn routing_table(&self) -> MutexGuard<'_, RoutingTable> {
        self.routing_table.lock().expect("mutex")
    }

    pub fn local_contact(&self) -> Contact {
        self.routing_table().local_contact().clone()
    }

    pub fn local_id(&self) -> Kuid {
        *self.routing_table().id()
    }

    pub fn is_local(&self, contact: &Contact) -> bool {
        self.routing_table().is_local(contact)
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::SeqCst)
    }

    // === Public Methods ===

    pub fn set_bootstrapped(&self, bootstrapped: bool) {
        self.bootstrapped.store(bootstrapped, Ordering::SeqCst);
    }

    /// Request from the local contact.
    pub fn request(&self, request_type: RequestTypeSpecific) -> RequestSpecific {
        RequestSpecific::new(self.local_contact(), request_type)
    }

    /// A remote contact responded to us.
    pub fn handle_alive(&self, contact: &Contact) -> bool {
        let alive = contact.clone().with_state(ContactState::Alive);
        let added = self.routing_table().add(alive);

        if added {
            trace!(?contact, "Added responding contact");
        }

        added
    }

    /// A request to a remote contact failed, returns `true` if the contact
    /// is in the routing table.
    pub fn handle_failure(&self, node_id: Option<Kuid>, address: SocketAddr) -> bool {
        let Some(id) = node_id else {
            return false;
        };

        let mut table = self.routing_table();
        let known = table.get(&id).is_some();
        table.handle_failure(&id, address);

        known
    }

    /// Pick a new random local node id and re-key the routing table.
    pub fn change_local_id(&self) -> Kuid {
        let id = Kuid::random();
        self.routing_table().change_local_id(id);

        debug!(?id, "Changed local node id");

        id
    }
}
