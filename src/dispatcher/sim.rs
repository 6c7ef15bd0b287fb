//! In-memory network of scripted DHT nodes.
//!
//! Responses are computed when a request is sent and delivered in order on a
//! single delivery thread, so handlers never run on the caller's stack.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use flume::Sender;
use rand::Rng;
use tracing::trace;

use crate::common::{
    Contact, DhtValueEntity, FindNodeResponseArguments, FindValueResponseArguments, Kuid,
    PongResponseArguments, RequestKind, RequestSpecific, RequestTypeSpecific, ResponseSpecific,
    ResponseTypeSpecific, SecurityToken, StoreResponseArguments, StoreStatus, MAX_BUCKET_SIZE_K,
};
use crate::dispatcher::{MessageDispatcher, ResponseHandler};
use crate::{Error, Result};

/// Elapsed time reported with simulated timeouts.
pub const SIM_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

type Delivery = Box<dyn FnOnce() + Send>;

/// Decides which requests get lost on the way to their destination.
struct LossFilter(Box<dyn Fn(SocketAddr, &RequestSpecific) -> bool + Send + Sync>);

impl Debug for LossFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("LossFilter")
    }
}

/// How a simulated node reacts to requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimBehavior {
    Online,
    /// Never responds, every request times out.
    Offline,
    /// Every request fails with an error.
    Failing,
}

#[derive(Debug, Clone)]
/// A scripted remote node.
pub struct SimNode {
    contact: Contact,
    behavior: SimBehavior,
    /// Contacts returned by FIND_NODE, closest to the target first.
    contacts: Vec<Contact>,
    /// Required with store requests if set, and handed out with lookups.
    token: Option<SecurityToken>,
    values: Vec<DhtValueEntity>,
}

impl SimNode {
    pub fn new(id: Kuid, address: SocketAddr) -> Self {
        SimNode {
            contact: Contact::alive(id, address),
            behavior: SimBehavior::Online,
            contacts: vec![],
            token: None,
            values: vec![],
        }
    }

    pub fn random() -> Self {
        Self::new(Kuid::random(), random_address())
    }

    pub fn with_contacts(mut self, contacts: Vec<Contact>) -> Self {
        self.contacts = contacts;
        self
    }

    pub fn with_token(mut self, token: impl Into<Bytes>) -> Self {
        self.token = Some(SecurityToken(token.into()));
        self
    }

    pub fn with_values(mut self, values: Vec<DhtValueEntity>) -> Self {
        self.values = values;
        self
    }

    pub fn with_behavior(mut self, behavior: SimBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    fn respond(&mut self, request: &RequestSpecific) -> ResponseTypeSpecific {
        match &request.request_type {
            RequestTypeSpecific::Ping => ResponseTypeSpecific::Pong(PongResponseArguments {
                external_address: request.requester.address(),
            }),
            RequestTypeSpecific::FindNode(args) => self.find_node(&args.target),
            RequestTypeSpecific::FindValue(args) => {
                let entities: Vec<DhtValueEntity> = self
                    .values
                    .iter()
                    .filter(|entity| args.key.matches(entity))
                    .cloned()
                    .collect();

                if entities.is_empty() {
                    self.find_node(&args.key.primary_key)
                } else {
                    ResponseTypeSpecific::FindValue(FindValueResponseArguments {
                        token: self.token.clone(),
                        entities,
                    })
                }
            }
            RequestTypeSpecific::Store(args) => {
                let accepted = self.token.is_none() || self.token == args.token;

                let statuses = args
                    .entities
                    .iter()
                    .map(|entity| {
                        if accepted {
                            self.values.retain(|stored| stored.key() != entity.key());
                            self.values.push(entity.clone());
                            (entity.key(), StoreStatus::Success)
                        } else {
                            (entity.key(), StoreStatus::Failure)
                        }
                    })
                    .collect();

                ResponseTypeSpecific::Store(StoreResponseArguments { statuses })
            }
        }
    }

    fn find_node(&self, target: &Kuid) -> ResponseTypeSpecific {
        let mut nodes = self.contacts.clone();
        nodes.sort_by_key(|contact| contact.id().xor(target));
        nodes.truncate(MAX_BUCKET_SIZE_K);

        ResponseTypeSpecific::FindNode(FindNodeResponseArguments {
            token: self.token.clone(),
            nodes,
        })
    }
}

#[derive(Debug)]
/// A [MessageDispatcher] backed by [SimNode]s, requests to unknown addresses
/// time out.
pub struct SimNetwork {
    nodes: Mutex<HashMap<SocketAddr, SimNode>>,
    requests: Mutex<HashMap<RequestKind, usize>>,
    loss: Mutex<Option<LossFilter>>,
    sender: Sender<Delivery>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = flume::unbounded::<Delivery>();

        thread::Builder::new()
            .name("mojito-sim-network".to_string())
            .spawn(move || {
                while let Ok(delivery) = receiver.recv() {
                    delivery();
                }
            })
            .expect("spawn sim network thread");

        Arc::new(SimNetwork {
            nodes: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            loss: Mutex::new(None),
            sender,
        })
    }

    /// Create `size` online nodes that all know each other.
    pub fn spawn_mesh(&self, size: usize) -> Vec<Contact> {
        let nodes: Vec<SimNode> = (0..size).map(|_| SimNode::random()).collect();
        let contacts: Vec<Contact> = nodes.iter().map(|node| node.contact().clone()).collect();

        for node in nodes {
            let others = contacts
                .iter()
                .filter(|contact| contact.id() != node.contact().id())
                .cloned()
                .collect();

            self.add(node.with_contacts(others));
        }

        contacts
    }

    pub fn add(&self, node: SimNode) {
        self.lock_nodes().insert(node.contact().address(), node);
    }

    pub fn set_behavior(&self, address: SocketAddr, behavior: SimBehavior) {
        if let Some(node) = self.lock_nodes().get_mut(&address) {
            node.behavior = behavior;
        }
    }

    /// Values stored at the node listening on `address`.
    pub fn values(&self, address: SocketAddr) -> Vec<DhtValueEntity> {
        self.lock_nodes()
            .get(&address)
            .map(|node| node.values.clone())
            .unwrap_or_default()
    }

    /// Requests for which `filter` returns `true` time out, whatever the
    /// behavior of their destination.
    pub fn lose_requests(
        &self,
        filter: impl Fn(SocketAddr, &RequestSpecific) -> bool + Send + Sync + 'static,
    ) {
        *self.loss.lock().expect("mutex") = Some(LossFilter(Box::new(filter)));
    }

    /// Number of requests of `kind` sent through this network so far.
    pub fn requests(&self, kind: RequestKind) -> usize {
        self.requests
            .lock()
            .expect("mutex")
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    fn lock_nodes(&self) -> MutexGuard<'_, HashMap<SocketAddr, SimNode>> {
        self.nodes.lock().expect("mutex")
    }
}

impl MessageDispatcher for SimNetwork {
    fn send(
        &self,
        node_id: Option<Kuid>,
        destination: SocketAddr,
        request: RequestSpecific,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<()> {
        *self
            .requests
            .lock()
            .expect("mutex")
            .entry(request.kind())
            .or_default() += 1;

        let lost = self
            .loss
            .lock()
            .expect("mutex")
            .as_ref()
            .is_some_and(|loss| (loss.0)(destination, &request));

        let delivery: Delivery = {
            let mut nodes = self.lock_nodes();

            match nodes.get_mut(&destination) {
                Some(node) if !lost && node.behavior == SimBehavior::Online => {
                    let response = ResponseSpecific {
                        responder: node.contact.clone(),
                        response_type: node.respond(&request),
                    };

                    trace!(?destination, kind = ?request.kind(), "Sim response");

                    Box::new(move || handler.response(response))
                }
                Some(node) if !lost && node.behavior == SimBehavior::Failing => Box::new(move || {
                    handler.error(
                        node_id,
                        destination,
                        Error::Backend {
                            address: destination,
                            reason: "simulated failure".to_string(),
                        },
                    )
                }),
                _ => Box::new(move || handler.timeout(node_id, destination, SIM_REQUEST_TIMEOUT)),
            }
        };

        self.sender.send(delivery).map_err(|_| Error::Shutdown)
    }
}

/// A random public looking address.
pub fn random_address() -> SocketAddr {
    let mut rng = rand::thread_rng();

    SocketAddr::from((
        Ipv4Addr::new(rng.gen_range(1..224), rng.gen(), rng.gen(), rng.gen_range(1..255)),
        rng.gen_range(1024..u16::MAX),
    ))
}
