//! Storing values along the K closest nodes to their primary key, or at a
//! single known node.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::common::{primary_key_of, Contact, DhtValueEntity, EntityKey, Kuid, SecurityToken};
use crate::concurrent::{DhtFuture, DhtTask, FutureEvent};
use crate::context::Context;
use crate::handler::{
    LookupKind, LookupResponseHandler, LookupResult, SecurityTokenHandler, StoreResponseHandler,
};
use crate::manager::FutureMap;
use crate::result::StoreResult;
use crate::{Error, Result};

/// Where a [StoreProcess] stores its values.
#[derive(Debug, Clone)]
pub enum StorePath {
    /// Look up the K closest nodes to the primary key first.
    Lookup,
    /// Fetch the contact's security token first.
    FetchToken(Contact),
    /// Store at the contact right away.
    Direct(Contact, Option<SecurityToken>),
}

#[derive(Debug)]
enum SubTask {
    Lookup(DhtFuture<LookupResult>),
    Token(DhtFuture<SecurityToken>),
    Store(DhtFuture<StoreResult>),
}

impl SubTask {
    fn cancel(&self) {
        match self {
            SubTask::Lookup(future) => future.cancel(),
            SubTask::Token(future) => future.cancel(),
            SubTask::Store(future) => future.cancel(),
        };
    }
}

#[derive(Debug)]
/// Stores a set of values sharing one primary key.
pub struct StoreProcess {
    context: Arc<Context>,
    entities: Vec<DhtValueEntity>,
    primary_key: Kuid,
    path: StorePath,
    current: Mutex<Option<SubTask>>,
    future: OnceLock<DhtFuture<StoreResult>>,
}

impl StoreProcess {
    /// Fails if `entities` is empty or the entities don't share a primary key.
    pub(crate) fn new(
        context: Arc<Context>,
        entities: Vec<DhtValueEntity>,
        contact: Option<(Contact, Option<SecurityToken>)>,
    ) -> Result<Self> {
        if entities.is_empty() {
            return Err(Error::InvalidArgument("No values to store"));
        }

        let primary_key = primary_key_of(&entities).ok_or(Error::InvalidArgument(
            "All values must have the same primary key",
        ))?;

        let path = match contact {
            None => StorePath::Lookup,
            Some((contact, None)) if context.config.store.store_requires_security_token => {
                StorePath::FetchToken(contact)
            }
            Some((contact, token)) => StorePath::Direct(contact, token),
        };

        Ok(StoreProcess {
            context,
            entities,
            primary_key,
            path,
            current: Mutex::new(None),
            future: OnceLock::new(),
        })
    }

    pub fn path(&self) -> &StorePath {
        &self.path
    }

    // === Private Methods ===

    fn lookup(self: &Arc<Self>) {
        let kind = if self.context.config.store.find_node_for_store {
            LookupKind::FindNode(self.primary_key)
        } else {
            let value_type = self.entities[0].value_type;
            LookupKind::FindValue(EntityKey::lookup(self.primary_key, value_type))
        };

        let handler = LookupResponseHandler::new(self.context.clone(), kind);
        let future = DhtFuture::new(handler.wait_on_lock());

        if !self.track(SubTask::Lookup(future.clone())) {
            return;
        }
        self.context.executor.execute(handler, future.clone());

        let this = self.clone();
        future.add_listener(move |event| match event {
            FutureEvent::Success(LookupResult::FindNode(result)) => this.store(result.path),
            FutureEvent::Success(LookupResult::FindValue(result)) => this.store(result.path),
            FutureEvent::Exception(error) => this.fail(error),
            FutureEvent::Cancelled => this.cancel(),
        });
    }

    fn fetch_token(self: &Arc<Self>, contact: Contact) {
        let key = self.entities[0].key();
        let handler = Arc::new(SecurityTokenHandler::new(
            self.context.clone(),
            contact.clone(),
            key,
        ));
        let future = DhtFuture::new(handler.wait_on_lock());

        if !self.track(SubTask::Token(future.clone())) {
            return;
        }
        self.context.executor.execute(handler, future.clone());

        let this = self.clone();
        future.add_listener(move |event| match event {
            FutureEvent::Success(token) => this.store(vec![(contact, Some(token))]),
            FutureEvent::Exception(error) => this.fail(error),
            FutureEvent::Cancelled => this.cancel(),
        });
    }

    fn store(self: &Arc<Self>, path: Vec<(Contact, Option<SecurityToken>)>) {
        debug!(key = ?self.primary_key, nodes = path.len(), "Storing values");

        let handler = Arc::new(StoreResponseHandler::new(
            self.context.clone(),
            path,
            self.entities.clone(),
        ));
        let future = DhtFuture::new(handler.wait_on_lock());

        if !self.track(SubTask::Store(future.clone())) {
            return;
        }
        self.context.executor.execute(handler, future.clone());

        let this = self.clone();
        future.add_listener(move |event| match event {
            FutureEvent::Success(result) => {
                if let Some(future) = this.future.get() {
                    future.set_value(result);
                }
            }
            FutureEvent::Exception(error) => this.fail(error),
            FutureEvent::Cancelled => this.cancel(),
        });
    }

    /// Make `task` the current sub-task, returns `false` if the process is
    /// already done.
    fn track(&self, task: SubTask) -> bool {
        if self.future.get().map_or(true, |future| future.is_done()) {
            task.cancel();
            return false;
        }

        *self.current.lock().expect("mutex") = Some(task);
        true
    }

    fn fail(&self, error: Error) {
        if let Some(future) = self.future.get() {
            future.set_exception(error);
        }
    }
}

impl DhtTask<StoreResult> for StoreProcess {
    fn wait_on_lock(&self) -> Duration {
        self.context.config.store.wait_on_lock
    }

    fn start(self: Arc<Self>, future: DhtFuture<StoreResult>) {
        if self.future.set(future).is_err() {
            return;
        }

        match self.path.clone() {
            StorePath::Lookup => self.lookup(),
            StorePath::FetchToken(contact) => self.fetch_token(contact),
            StorePath::Direct(contact, token) => self.store(vec![(contact, token)]),
        }
    }

    fn cancel(&self) {
        let current = self.current.lock().expect("mutex").take();
        if let Some(task) = current {
            task.cancel();
        }

        if let Some(future) = self.future.get() {
            future.cancel();
        }
    }
}

/// Single-flight key of a store: the stored entities, their values and
/// where to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct StoreKey {
    entities: Vec<(EntityKey, Bytes)>,
    target: Option<SocketAddr>,
}

#[derive(Debug)]
/// Starts [StoreProcess]es, concurrent stores of the same entities to the
/// same place share one process.
pub struct StoreManager {
    context: Arc<Context>,
    futures: FutureMap<StoreKey, StoreResult>,
}

impl StoreManager {
    pub(crate) fn new(context: Arc<Context>) -> Self {
        StoreManager {
            context,
            futures: FutureMap::new(),
        }
    }

    /// Store along the K closest nodes to the entities' primary key.
    pub fn store(&self, entities: Vec<DhtValueEntity>) -> Result<DhtFuture<StoreResult>> {
        self.start(entities, None)
    }

    /// Store at a single contact, fetching its security token first if needed.
    pub fn store_at(
        &self,
        contact: Contact,
        token: Option<SecurityToken>,
        entities: Vec<DhtValueEntity>,
    ) -> Result<DhtFuture<StoreResult>> {
        self.start(entities, Some((contact, token)))
    }

    pub(crate) fn cancel_all(&self) {
        self.futures.cancel_all();
    }

    fn start(
        &self,
        entities: Vec<DhtValueEntity>,
        contact: Option<(Contact, Option<SecurityToken>)>,
    ) -> Result<DhtFuture<StoreResult>> {
        let mut keyed: Vec<(EntityKey, Bytes)> = entities
            .iter()
            .map(|entity| (entity.key(), entity.value.clone()))
            .collect();
        keyed.sort();

        let key = StoreKey {
            entities: keyed,
            target: contact.as_ref().map(|(contact, _)| contact.address()),
        };

        let process = Arc::new(StoreProcess::new(self.context.clone(), entities, contact)?);

        Ok(self.futures.get_or_start(key, || {
            let future = DhtFuture::new(process.wait_on_lock());
            self.context.executor.execute(process, future.clone());
            future
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::DhtValueType;
    use crate::concurrent::TaskExecutor;
    use crate::dispatcher::sim::{random_address, SimNetwork};
    use crate::Config;

    fn context(config: Config) -> Arc<Context> {
        Arc::new(Context::new(
            Contact::alive(Kuid::random(), random_address()),
            SimNetwork::new(),
            TaskExecutor::shared(),
            config,
        ))
    }

    fn entity(primary_key: Kuid) -> DhtValueEntity {
        DhtValueEntity::new(primary_key, Kuid::random(), DhtValueType::Text, "value")
    }

    #[test]
    fn rejects_empty_and_mixed_keys() {
        let context = context(Config::default());

        assert!(matches!(
            StoreProcess::new(context.clone(), vec![], None),
            Err(Error::InvalidArgument(_))
        ));

        let mixed = vec![entity(Kuid::random()), entity(Kuid::random())];
        assert!(matches!(
            StoreProcess::new(context, mixed, None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn selects_store_path() {
        let key = Kuid::random();
        let contact = Contact::alive(Kuid::random(), random_address());

        let process =
            StoreProcess::new(context(Config::default()), vec![entity(key)], None).unwrap();
        assert!(matches!(process.path(), StorePath::Lookup));

        let process = StoreProcess::new(
            context(Config::default()),
            vec![entity(key)],
            Some((contact.clone(), None)),
        )
        .unwrap();
        assert!(matches!(process.path(), StorePath::FetchToken(_)));

        let mut config = Config::default();
        config.store.store_requires_security_token = false;
        let process = StoreProcess::new(context(config), vec![entity(key)], Some((contact, None)))
            .unwrap();
        assert!(matches!(process.path(), StorePath::Direct(_, None)));
    }
}
