use std::sync::Arc;

use crate::common::{Contact, Kuid};
use crate::concurrent::{DhtFuture, DhtTask};
use crate::context::Context;
use crate::handler::{LookupKind, LookupResponseHandler, LookupResult};
use crate::manager::FutureMap;
use crate::result::FindNodeResult;

#[derive(Debug)]
/// Iterative FIND_NODE lookups, one in flight per target.
pub struct FindNodeManager {
    context: Arc<Context>,
    futures: FutureMap<Kuid, FindNodeResult>,
}

impl FindNodeManager {
    pub(crate) fn new(context: Arc<Context>) -> Self {
        FindNodeManager {
            context,
            futures: FutureMap::new(),
        }
    }

    /// Find the K closest nodes to `target`.
    pub fn lookup(&self, target: Kuid) -> DhtFuture<FindNodeResult> {
        self.futures.get_or_start(target, || {
            let handler =
                LookupResponseHandler::new(self.context.clone(), LookupKind::FindNode(target));
            self.start(handler)
        })
    }

    /// Find the K closest nodes to `target` starting from `contact` rather
    /// than the routing table. Never joins an in-flight lookup.
    pub fn lookup_from(&self, target: Kuid, contact: Contact) -> DhtFuture<FindNodeResult> {
        let handler = LookupResponseHandler::with_forced_contacts(
            self.context.clone(),
            LookupKind::FindNode(target),
            vec![contact],
        );

        self.start(handler)
    }

    pub(crate) fn cancel_all(&self) {
        self.futures.cancel_all();
    }

    fn start(&self, handler: Arc<LookupResponseHandler>) -> DhtFuture<FindNodeResult> {
        let future = DhtFuture::new(handler.wait_on_lock());
        self.context.executor.execute(handler, future.clone());

        future.map_result(LookupResult::into_find_node)
    }
}
