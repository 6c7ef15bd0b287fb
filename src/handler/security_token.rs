use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::debug;

use crate::common::{
    Contact, EntityKey, FindNodeRequestArguments, FindValueRequestArguments, Kuid,
    RequestTypeSpecific, ResponseSpecific, SecurityToken,
};
use crate::concurrent::{DhtFuture, DhtTask};
use crate::context::Context;
use crate::dispatcher::ResponseHandler;
use crate::handler::send;
use crate::Error;

#[derive(Debug)]
/// Asks a single contact for its security token with one FIND_NODE, or
/// FIND_VALUE, request.
pub struct SecurityTokenHandler {
    context: Arc<Context>,
    contact: Contact,
    key: EntityKey,
    future: OnceLock<DhtFuture<SecurityToken>>,
}

impl SecurityTokenHandler {
    pub(crate) fn new(context: Arc<Context>, contact: Contact, key: EntityKey) -> Self {
        SecurityTokenHandler {
            context,
            contact,
            key,
            future: OnceLock::new(),
        }
    }

    fn fail(&self, error: Error) {
        if let Some(future) = self.future.get() {
            future.set_exception(error);
        }
    }
}

impl DhtTask<SecurityToken> for SecurityTokenHandler {
    fn wait_on_lock(&self) -> Duration {
        self.context.config.kademlia.request_timeout
    }

    fn start(self: Arc<Self>, future: DhtFuture<SecurityToken>) {
        if self.future.set(future).is_err() {
            return;
        }

        let request_type = if self.context.config.lookup.find_node_for_security_token {
            RequestTypeSpecific::FindNode(FindNodeRequestArguments {
                target: *self.contact.id(),
            })
        } else {
            RequestTypeSpecific::FindValue(FindValueRequestArguments {
                key: self.key.clone(),
            })
        };

        let request = self.context.request(request_type);
        send(
            &self.context,
            Some(*self.contact.id()),
            self.contact.address(),
            request,
            self.clone(),
        );
    }

    fn cancel(&self) {
        if let Some(future) = self.future.get() {
            future.cancel();
        }
    }
}

impl ResponseHandler for SecurityTokenHandler {
    fn response(&self, response: ResponseSpecific) {
        self.context.handle_alive(&response.responder);

        match response.token() {
            Some(token) => {
                if let Some(future) = self.future.get() {
                    future.set_value(token.clone());
                }
            }
            None => {
                debug!(contact = ?response.responder, "Response without a security token");

                self.fail(Error::Backend {
                    address: response.responder.address(),
                    reason: "no security token".to_string(),
                });
            }
        }
    }

    fn timeout(&self, node_id: Option<Kuid>, address: SocketAddr, elapsed: Duration) {
        self.context.handle_failure(node_id, address);
        self.fail(Error::RequestTimeout {
            node_id,
            address,
            elapsed,
        });
    }

    fn error(&self, node_id: Option<Kuid>, address: SocketAddr, error: Error) {
        self.context.handle_failure(node_id, address);
        self.fail(error);
    }
}
