use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::common::{
    Contact, Kuid, RequestSpecific, RequestTypeSpecific, ResponseSpecific, ResponseTypeSpecific,
};
use crate::concurrent::{DhtFuture, DhtTask};
use crate::context::Context;
use crate::dispatcher::ResponseHandler;
use crate::handler::send;
use crate::result::PingResult;
use crate::Error;

/// Who a [PingResponseHandler] pings.
#[derive(Debug, Clone)]
pub enum PingTargets {
    /// Addresses of nodes we know nothing else about.
    Addresses(Vec<SocketAddr>),
    Contacts(Vec<Contact>),
    /// Remote nodes that seem to use the local node id.
    ///
    /// Collision pings are sent from a firewalled contact with the inverted local id,
    /// so the remote nodes don't mistake it for the node they already know.
    Collision(Vec<Contact>),
}

impl PingTargets {
    fn len(&self) -> usize {
        match self {
            PingTargets::Addresses(addresses) => addresses.len(),
            PingTargets::Contacts(contacts) | PingTargets::Collision(contacts) => contacts.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The sender of collision pings for a local contact.
pub fn collision_ping_sender(local: &Contact) -> Contact {
    Contact::new(local.id().invert(), local.address()).with_firewalled(true)
}

#[derive(Debug)]
struct PingState {
    pending: usize,
    last_error: Option<Error>,
}

#[derive(Debug)]
/// Pings every target in parallel, the first pong completes the task.
///
/// Fails with the last error once every target failed.
pub struct PingResponseHandler {
    context: Arc<Context>,
    targets: PingTargets,
    state: Mutex<PingState>,
    future: OnceLock<DhtFuture<PingResult>>,
    started: Instant,
}

impl PingResponseHandler {
    pub(crate) fn new(context: Arc<Context>, targets: PingTargets) -> Self {
        PingResponseHandler {
            context,
            state: Mutex::new(PingState {
                pending: targets.len(),
                last_error: None,
            }),
            targets,
            future: OnceLock::new(),
            started: Instant::now(),
        }
    }

    fn is_collision_ping(&self) -> bool {
        matches!(self.targets, PingTargets::Collision(_))
    }

    fn handle_failure(&self, node_id: Option<Kuid>, address: SocketAddr, error: Error) {
        if !self.is_collision_ping() {
            self.context.handle_failure(node_id, address);
        }

        let exhausted = {
            let mut state = self.state.lock().expect("mutex");
            state.pending = state.pending.saturating_sub(1);
            state.last_error = Some(error);

            if state.pending == 0 {
                state.last_error.take()
            } else {
                None
            }
        };

        if let (Some(error), Some(future)) = (exhausted, self.future.get()) {
            trace!(?error, "Every ping target failed");
            future.set_exception(error);
        }
    }
}

impl DhtTask<PingResult> for PingResponseHandler {
    fn wait_on_lock(&self) -> Duration {
        self.context.config.kademlia.request_timeout * self.targets.len().max(1) as u32
    }

    fn start(self: Arc<Self>, future: DhtFuture<PingResult>) {
        if self.targets.is_empty() {
            future.set_exception(Error::InvalidArgument("Nothing to ping"));
            return;
        }

        if self.future.set(future).is_err() {
            return;
        }

        let local = self.context.local_contact();
        let requester = if self.is_collision_ping() {
            collision_ping_sender(&local)
        } else {
            local
        };

        let targets: Vec<(Option<Kuid>, SocketAddr)> = match &self.targets {
            PingTargets::Addresses(addresses) => {
                addresses.iter().map(|address| (None, *address)).collect()
            }
            PingTargets::Contacts(contacts) | PingTargets::Collision(contacts) => contacts
                .iter()
                .map(|contact| (Some(*contact.id()), contact.address()))
                .collect(),
        };

        for (node_id, address) in targets {
            let request = RequestSpecific::new(requester.clone(), RequestTypeSpecific::Ping);
            send(&self.context, node_id, address, request, self.clone());
        }
    }

    fn cancel(&self) {
        if let Some(future) = self.future.get() {
            future.cancel();
        }
    }
}

impl ResponseHandler for PingResponseHandler {
    fn response(&self, response: ResponseSpecific) {
        let ResponseTypeSpecific::Pong(pong) = response.response_type else {
            debug!(responder = ?response.responder, "Unexpected response to a ping");
            self.handle_failure(
                Some(*response.responder.id()),
                response.responder.address(),
                Error::Backend {
                    address: response.responder.address(),
                    reason: "unexpected response to a ping".to_string(),
                },
            );
            return;
        };

        if self.is_collision_ping() {
            warn!(contact = ?response.responder, "Collision ping answered");
        } else {
            self.context.handle_alive(&response.responder);
        }

        if let Some(future) = self.future.get() {
            future.set_value(PingResult {
                contact: response.responder,
                external_address: pong.external_address,
                elapsed: self.started.elapsed(),
            });
        }
    }

    fn timeout(&self, node_id: Option<Kuid>, address: SocketAddr, elapsed: Duration) {
        self.handle_failure(
            node_id,
            address,
            Error::RequestTimeout {
                node_id,
                address,
                elapsed,
            },
        );
    }

    fn error(&self, node_id: Option<Kuid>, address: SocketAddr, error: Error) {
        self.handle_failure(node_id, address, error);
    }
}
