//! Iterative FIND_NODE and FIND_VALUE lookups.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::common::{
    Contact, DhtValueEntity, EntityKey, FindNodeRequestArguments, FindValueRequestArguments,
    Kuid, RequestTypeSpecific, ResponseSpecific, ResponseTypeSpecific, SecurityToken,
    SelectMode,
};
use crate::concurrent::{DhtFuture, DhtTask};
use crate::context::Context;
use crate::dispatcher::ResponseHandler;
use crate::handler::send;
use crate::result::{FindNodeResult, FindValueResult};
use crate::{Error, Result};

/// What a [LookupResponseHandler] is looking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupKind {
    FindNode(Kuid),
    FindValue(EntityKey),
}

impl LookupKind {
    pub fn target(&self) -> Kuid {
        match self {
            LookupKind::FindNode(target) => *target,
            LookupKind::FindValue(key) => key.primary_key,
        }
    }

    fn request(&self) -> RequestTypeSpecific {
        match self {
            LookupKind::FindNode(target) => {
                RequestTypeSpecific::FindNode(FindNodeRequestArguments { target: *target })
            }
            LookupKind::FindValue(key) => {
                RequestTypeSpecific::FindValue(FindValueRequestArguments { key: key.clone() })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum LookupResult {
    FindNode(FindNodeResult),
    FindValue(FindValueResult),
}

impl LookupResult {
    pub fn into_find_node(self) -> Result<FindNodeResult> {
        match self {
            LookupResult::FindNode(result) => Ok(result),
            LookupResult::FindValue(_) => Err(Error::InvalidArgument("Not a FIND_NODE lookup")),
        }
    }

    pub fn into_find_value(self) -> Result<FindValueResult> {
        match self {
            LookupResult::FindValue(result) => Ok(result),
            LookupResult::FindNode(_) => Err(Error::InvalidArgument("Not a FIND_VALUE lookup")),
        }
    }
}

/// Contacts of a FIND_NODE response after dropping the local node.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Scrubbed {
    pub valid: bool,
    pub contacts: Vec<Contact>,
    /// Remote nodes claiming the local id from another address.
    pub collisions: Vec<Contact>,
}

/// Drop the local contact from a response and detect id collisions.
///
/// A response is valid if the share of usable contacts reaches
/// `required_ratio` and something usable is left.
pub(crate) fn scrub(
    local: &Contact,
    nodes: &[Contact],
    required_ratio: f32,
    accept_empty: bool,
) -> Scrubbed {
    if nodes.is_empty() {
        return Scrubbed {
            valid: accept_empty,
            ..Default::default()
        };
    }

    let mut scrubbed = Scrubbed::default();

    for contact in nodes {
        if contact.id() == local.id() {
            if contact.address() != local.address() {
                scrubbed.collisions.push(contact.clone());
            }
            continue;
        }

        if contact.address() == local.address() {
            continue;
        }

        scrubbed.contacts.push(contact.clone());
    }

    let ratio = scrubbed.contacts.len() as f32 / nodes.len() as f32;

    scrubbed.valid = ratio >= required_ratio
        && (!scrubbed.contacts.is_empty() || !scrubbed.collisions.is_empty());

    scrubbed
}

#[derive(Debug)]
struct LookupState {
    local: Contact,
    /// Ids and addresses already asked.
    queried: HashSet<Kuid>,
    queried_addresses: HashSet<SocketAddr>,
    /// Candidates keyed by their xor distance to the target.
    to_query: BTreeMap<Kuid, Contact>,
    active: usize,
    /// Responders keyed by their xor distance to the target.
    path: BTreeMap<Kuid, (Contact, Option<SecurityToken>)>,
    collisions: Vec<Contact>,
    entities: Vec<DhtValueEntity>,
    route_table_failures: usize,
    new_contacts: usize,
    finished: bool,
}

#[derive(Debug)]
/// Alpha parallel iterative lookup for the K closest nodes to a target, or
/// for the values stored under a key.
///
/// FIND_NODE lookups include the local node in their response path, FIND_VALUE
/// lookups complete as soon as a node returns values.
pub struct LookupResponseHandler {
    context: Arc<Context>,
    kind: LookupKind,
    target: Kuid,
    /// Contacts to start from instead of the routing table.
    forced: Option<Vec<Contact>>,
    state: Mutex<LookupState>,
    future: OnceLock<DhtFuture<LookupResult>>,
    started: Instant,
    this: Weak<LookupResponseHandler>,
}

impl LookupResponseHandler {
    pub(crate) fn new(context: Arc<Context>, kind: LookupKind) -> Arc<Self> {
        Self::build(context, kind, None)
    }

    /// A lookup starting from these contacts instead of the routing table.
    pub(crate) fn with_forced_contacts(
        context: Arc<Context>,
        kind: LookupKind,
        contacts: Vec<Contact>,
    ) -> Arc<Self> {
        Self::build(context, kind, Some(contacts))
    }

    fn build(context: Arc<Context>, kind: LookupKind, forced: Option<Vec<Contact>>) -> Arc<Self> {
        let target = kind.target();
        let local = context.local_contact();

        Arc::new_cyclic(|this| LookupResponseHandler {
            context,
            kind,
            target,
            forced,
            state: Mutex::new(LookupState {
                local,
                queried: HashSet::new(),
                queried_addresses: HashSet::new(),
                to_query: BTreeMap::new(),
                active: 0,
                path: BTreeMap::new(),
                collisions: vec![],
                entities: vec![],
                route_table_failures: 0,
                new_contacts: 0,
                finished: false,
            }),
            future: OnceLock::new(),
            started: Instant::now(),
            this: this.clone(),
        })
    }

    pub fn kind(&self) -> &LookupKind {
        &self.kind
    }

    // === Private Methods ===

    fn arc(&self) -> Option<Arc<Self>> {
        self.this.upgrade()
    }

    fn k(&self) -> usize {
        self.context.config.kademlia.k.max(1)
    }

    /// Send as many requests as alpha allows, completes the lookup once
    /// there is nothing left to wait for.
    fn next_round(self: &Arc<Self>) {
        let alpha = self.context.config.kademlia.alpha.max(1);
        let k = self.k();

        let (sends, result) = {
            let mut state = self.state.lock().expect("mutex");
            if state.finished {
                return;
            }

            let mut sends = vec![];

            if self.started.elapsed() >= self.context.config.kademlia.lookup_timeout {
                debug!(lookup = ?self.target, "Lookup timed out");
                state.to_query.clear();
            }

            while state.active < alpha {
                let Some((distance, contact)) = state.to_query.pop_first() else {
                    break;
                };

                // Nothing closer than the furthest of a full path is left.
                if state.path.len() >= k
                    && state
                        .path
                        .last_key_value()
                        .is_some_and(|(furthest, _)| distance > *furthest)
                {
                    state.to_query.clear();
                    break;
                }

                state.queried.insert(*contact.id());
                state.queried_addresses.insert(contact.address());
                state.active += 1;
                sends.push(contact);
            }

            if state.active == 0 && sends.is_empty() {
                state.finished = true;
                (sends, Some(self.result(&state)))
            } else {
                (sends, None)
            }
        };

        if let Some(result) = result {
            self.complete(result);
            return;
        }

        for contact in sends {
            trace!(lookup = ?self.target, ?contact, "Lookup request");

            let request = self.context.request(self.kind.request());
            send(
                &self.context,
                Some(*contact.id()),
                contact.address(),
                request,
                self.clone(),
            );
        }
    }

    fn result(&self, state: &LookupState) -> LookupResult {
        let path: Vec<(Contact, Option<SecurityToken>)> = state.path.values().cloned().collect();
        let elapsed = self.started.elapsed();

        match &self.kind {
            LookupKind::FindNode(target) => LookupResult::FindNode(FindNodeResult {
                target: *target,
                path,
                collisions: state.collisions.clone(),
                route_table_failures: state.route_table_failures,
                new_contacts: state.new_contacts,
                elapsed,
            }),
            LookupKind::FindValue(key) => LookupResult::FindValue(FindValueResult {
                key: key.clone(),
                entities: state.entities.clone(),
                path,
                route_table_failures: state.route_table_failures,
                elapsed,
            }),
        }
    }

    fn complete(&self, result: LookupResult) {
        if let Some(future) = self.future.get() {
            future.set_value(result);
        }
    }

    fn add_candidates(&self, state: &mut LookupState, contacts: Vec<Contact>) {
        for contact in contacts {
            if state.queried.contains(contact.id())
                || state.queried_addresses.contains(&contact.address())
            {
                continue;
            }

            state
                .to_query
                .entry(contact.id().xor(&self.target))
                .or_insert(contact);
        }
    }

    fn add_to_path(&self, state: &mut LookupState, contact: Contact, token: Option<SecurityToken>) {
        state
            .path
            .insert(contact.id().xor(&self.target), (contact, token));

        // Keep only the K closest.
        while state.path.len() > self.k() {
            state.path.pop_last();
        }
    }

    fn handle_failure(self: &Arc<Self>, node_id: Option<Kuid>, address: SocketAddr) {
        let known = self.context.handle_failure(node_id, address);

        {
            let mut state = self.state.lock().expect("mutex");
            if state.finished {
                return;
            }

            state.active = state.active.saturating_sub(1);
            if known {
                state.route_table_failures += 1;
            }
        }

        self.next_round();
    }

    fn handle_response(self: &Arc<Self>, response: ResponseSpecific) {
        let token = response.token().cloned();
        let responder = response.responder;
        let new_contact = self.context.handle_alive(&responder);

        let result = {
            let mut state = self.state.lock().expect("mutex");
            if state.finished {
                return;
            }

            state.active = state.active.saturating_sub(1);
            if new_contact {
                state.new_contacts += 1;
            }

            match (response.response_type, &self.kind) {
                (ResponseTypeSpecific::FindNode(args), _) => {
                    let scrubbed = scrub(
                        &state.local,
                        &args.nodes,
                        self.context.config.lookup.contacts_scrubber_required_ratio,
                        self.context.config.lookup.accept_empty_find_node_responses,
                    );

                    if !scrubbed.collisions.is_empty() {
                        warn!(collisions = ?scrubbed.collisions, "Node id collision");

                        for collision in scrubbed.collisions {
                            if !state
                                .collisions
                                .iter()
                                .any(|c| c.address() == collision.address())
                            {
                                state.collisions.push(collision);
                            }
                        }
                    }

                    if scrubbed.valid {
                        self.add_to_path(&mut state, responder, token);
                        self.add_candidates(&mut state, scrubbed.contacts);
                    } else {
                        debug!(?responder, "Invalid FIND_NODE response");
                    }

                    None
                }
                (ResponseTypeSpecific::FindValue(args), LookupKind::FindValue(key)) => {
                    let entities: Vec<DhtValueEntity> = args
                        .entities
                        .into_iter()
                        .filter(|entity| key.matches(entity))
                        .collect();

                    if entities.is_empty() {
                        None
                    } else {
                        debug!(?responder, count = entities.len(), "Found values");

                        state.entities.extend(entities);
                        self.add_to_path(&mut state, responder, token);
                        state.finished = true;

                        Some(self.result(&state))
                    }
                }
                (_, _) => {
                    debug!(?responder, "Unexpected response to a lookup");
                    None
                }
            }
        };

        match result {
            Some(result) => self.complete(result),
            None => self.next_round(),
        }
    }
}

impl DhtTask<LookupResult> for LookupResponseHandler {
    fn wait_on_lock(&self) -> Duration {
        self.context.config.kademlia.lookup_timeout
    }

    fn start(self: Arc<Self>, future: DhtFuture<LookupResult>) {
        if self.future.set(future).is_err() {
            return;
        }

        let seeds = match &self.forced {
            Some(forced) => forced.clone(),
            None => self
                .context
                .routing_table()
                .select(&self.target, self.k(), SelectMode::All),
        };

        {
            let mut state = self.state.lock().expect("mutex");

            if let LookupKind::FindNode(_) = self.kind {
                let local = state.local.clone();
                self.add_to_path(&mut state, local, None);
            }

            let local = state.local.clone();
            let seeds = seeds
                .into_iter()
                .filter(|contact| {
                    contact.id() != local.id() && contact.address() != local.address()
                })
                .collect();
            self.add_candidates(&mut state, seeds);

            debug!(lookup = ?self.target, seeds = state.to_query.len(), "Starting lookup");
        }

        self.next_round();
    }

    fn cancel(&self) {
        self.state.lock().expect("mutex").finished = true;

        if let Some(future) = self.future.get() {
            future.cancel();
        }
    }
}

impl ResponseHandler for LookupResponseHandler {
    fn response(&self, response: ResponseSpecific) {
        if let Some(this) = self.arc() {
            this.handle_response(response);
        }
    }

    fn timeout(&self, node_id: Option<Kuid>, address: SocketAddr, elapsed: Duration) {
        trace!(?node_id, ?address, ?elapsed, "Lookup request timed out");

        if let Some(this) = self.arc() {
            this.handle_failure(node_id, address);
        }
    }

    fn error(&self, node_id: Option<Kuid>, address: SocketAddr, error: Error) {
        debug!(?node_id, ?address, ?error, "Lookup request failed");

        if let Some(this) = self.arc() {
            this.handle_failure(node_id, address);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn local() -> Contact {
        Contact::alive(Kuid::random(), SocketAddr::from(([127, 0, 0, 1], 6346)))
    }

    #[test]
    fn scrub_drops_local() {
        let local = local();

        let scrubbed = scrub(&local, &[local.clone()], 0.0, false);
        assert!(!scrubbed.valid);
        assert!(scrubbed.contacts.is_empty());
        assert!(scrubbed.collisions.is_empty());
    }

    #[test]
    fn scrub_detects_collisions() {
        let local = local();
        let collider = Contact::new(*local.id(), SocketAddr::from(([10, 0, 0, 1], 6346)));

        let scrubbed = scrub(&local, &[collider.clone()], 0.0, false);
        assert!(scrubbed.valid);
        assert_eq!(scrubbed.collisions, vec![collider]);
    }

    #[test]
    fn scrub_required_ratio() {
        let local = local();
        let nodes = vec![local.clone(), Contact::random()];

        assert!(scrub(&local, &nodes, 0.5, false).valid);
        assert!(!scrub(&local, &nodes, 0.75, false).valid);
    }

    #[test]
    fn scrub_empty_response() {
        let local = local();

        assert!(!scrub(&local, &[], 0.0, false).valid);
        assert!(scrub(&local, &[], 0.0, true).valid);
    }
}
