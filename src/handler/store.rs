use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tracing::{debug, trace};

use crate::common::{
    Contact, DhtValueEntity, Kuid, RequestTypeSpecific, ResponseSpecific, ResponseTypeSpecific,
    SecurityToken, StoreRequestArguments, StoreStatus,
};
use crate::concurrent::{DhtFuture, DhtTask};
use crate::context::Context;
use crate::dispatcher::ResponseHandler;
use crate::handler::send;
use crate::result::StoreResult;
use crate::Error;

#[derive(Debug)]
struct StoreState {
    pending: usize,
    stored_at: Vec<Contact>,
    failed: Vec<Contact>,
}

#[derive(Debug)]
/// Stores the entities at every remote contact of a path, completes once
/// every contact answered or failed.
pub struct StoreResponseHandler {
    context: Arc<Context>,
    path: Vec<(Contact, Option<SecurityToken>)>,
    entities: Vec<DhtValueEntity>,
    state: Mutex<StoreState>,
    future: OnceLock<DhtFuture<StoreResult>>,
}

impl StoreResponseHandler {
    pub(crate) fn new(
        context: Arc<Context>,
        path: Vec<(Contact, Option<SecurityToken>)>,
        entities: Vec<DhtValueEntity>,
    ) -> Self {
        let local = context.local_contact();
        let path: Vec<_> = path
            .into_iter()
            .filter(|(contact, _)| contact.id() != local.id())
            .collect();

        StoreResponseHandler {
            context,
            state: Mutex::new(StoreState {
                pending: path.len(),
                stored_at: vec![],
                failed: vec![],
            }),
            path,
            entities,
            future: OnceLock::new(),
        }
    }

    fn contact_for(&self, node_id: Option<Kuid>, address: SocketAddr) -> Contact {
        self.path
            .iter()
            .map(|(contact, _)| contact)
            .find(|contact| contact.address() == address)
            .cloned()
            .unwrap_or_else(|| match node_id {
                Some(id) => Contact::new(id, address),
                None => Contact::new(Kuid::MIN, address),
            })
    }

    fn done(&self, contact: Contact, stored: bool) {
        let result = {
            let mut state = self.state.lock().expect("mutex");

            if stored {
                state.stored_at.push(contact);
            } else {
                state.failed.push(contact);
            }

            state.pending = state.pending.saturating_sub(1);

            (state.pending == 0).then(|| StoreResult {
                entities: self.entities.clone(),
                stored_at: state.stored_at.clone(),
                failed: state.failed.clone(),
            })
        };

        if let (Some(result), Some(future)) = (result, self.future.get()) {
            debug!(
                stored_at = result.stored_at.len(),
                failed = result.failed.len(),
                "Store done"
            );
            future.set_value(result);
        }
    }
}

impl DhtTask<StoreResult> for StoreResponseHandler {
    fn wait_on_lock(&self) -> Duration {
        self.context.config.store.wait_on_lock
    }

    fn start(self: Arc<Self>, future: DhtFuture<StoreResult>) {
        if self.path.is_empty() {
            future.set_value(StoreResult {
                entities: self.entities.clone(),
                stored_at: vec![],
                failed: vec![],
            });
            return;
        }

        if self.future.set(future).is_err() {
            return;
        }

        for (contact, token) in self.path.iter() {
            trace!(?contact, "Store request");

            let request = self
                .context
                .request(RequestTypeSpecific::Store(StoreRequestArguments {
                    token: token.clone(),
                    entities: self.entities.clone(),
                }));

            send(
                &self.context,
                Some(*contact.id()),
                contact.address(),
                request,
                self.clone(),
            );
        }
    }

    fn cancel(&self) {
        if let Some(future) = self.future.get() {
            future.cancel();
        }
    }
}

impl ResponseHandler for StoreResponseHandler {
    fn response(&self, response: ResponseSpecific) {
        self.context.handle_alive(&response.responder);

        let stored = match &response.response_type {
            ResponseTypeSpecific::Store(args) => {
                !args.statuses.is_empty()
                    && args
                        .statuses
                        .iter()
                        .all(|(_, status)| *status == StoreStatus::Success)
            }
            _ => false,
        };

        let responder = response.responder;
        self.done(self.contact_for(Some(*responder.id()), responder.address()), stored);
    }

    fn timeout(&self, node_id: Option<Kuid>, address: SocketAddr, _elapsed: Duration) {
        self.context.handle_failure(node_id, address);
        self.done(self.contact_for(node_id, address), false);
    }

    fn error(&self, node_id: Option<Kuid>, address: SocketAddr, error: Error) {
        debug!(?address, ?error, "Store request failed");

        self.context.handle_failure(node_id, address);
        self.done(self.contact_for(node_id, address), false);
    }
}
