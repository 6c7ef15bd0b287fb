use std::sync::Arc;

use crate::common::EntityKey;
use crate::concurrent::{DhtFuture, DhtTask};
use crate::context::Context;
use crate::handler::{LookupKind, LookupResponseHandler, LookupResult};
use crate::manager::FutureMap;
use crate::result::FindValueResult;

#[derive(Debug)]
/// Iterative FIND_VALUE lookups, one in flight per entity key.
pub struct FindValueManager {
    context: Arc<Context>,
    futures: FutureMap<EntityKey, FindValueResult>,
}

impl FindValueManager {
    pub(crate) fn new(context: Arc<Context>) -> Self {
        FindValueManager {
            context,
            futures: FutureMap::new(),
        }
    }

    pub fn get(&self, key: EntityKey) -> DhtFuture<FindValueResult> {
        self.futures.get_or_start(key.clone(), || {
            let handler =
                LookupResponseHandler::new(self.context.clone(), LookupKind::FindValue(key));

            let future = DhtFuture::new(handler.wait_on_lock());
            self.context.executor.execute(handler, future.clone());

            future.map_result(LookupResult::into_find_value)
        })
    }

    pub(crate) fn cancel_all(&self) {
        self.futures.cancel_all();
    }
}
