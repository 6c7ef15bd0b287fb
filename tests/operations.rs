//! Lookups and stores against a simulated network.

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mojito::common::{RequestKind, RequestSpecific, RequestTypeSpecific, SecurityToken};
use mojito::dispatcher::{MessageDispatcher, ResponseHandler};
use mojito::sim::{random_address, SimBehavior, SimNetwork, SimNode};
use mojito::{Bytes, Config, Dht, DhtValueEntity, DhtValueType, EntityKey, Error, Kuid};

const TIMEOUT: Duration = Duration::from_secs(30);

fn dht(network: &Arc<SimNetwork>) -> Dht {
    Dht::builder()
        .dispatcher(network.clone())
        .address(random_address())
        .build()
        .unwrap()
}

fn entity(key: Kuid, value: &'static str) -> DhtValueEntity {
    DhtValueEntity::new(key, Kuid::random(), DhtValueType::Text, value)
}

/// Accepts every request and never answers.
#[derive(Debug)]
struct Blackhole;

impl MessageDispatcher for Blackhole {
    fn send(
        &self,
        _node_id: Option<Kuid>,
        _destination: SocketAddr,
        _request: RequestSpecific,
        _handler: Arc<dyn ResponseHandler>,
    ) -> mojito::Result<()> {
        Ok(())
    }
}

/// Records the values of store requests and never answers.
#[derive(Debug, Default)]
struct StoreRecorder(Mutex<Vec<Bytes>>);

impl StoreRecorder {
    /// Values sent so far, once `count` of them arrived or after a second.
    fn values(&self, count: usize) -> Vec<Bytes> {
        let deadline = Instant::now() + Duration::from_secs(1);

        loop {
            let values = self.0.lock().unwrap().clone();
            if values.len() >= count || Instant::now() >= deadline {
                return values;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl MessageDispatcher for StoreRecorder {
    fn send(
        &self,
        _node_id: Option<Kuid>,
        _destination: SocketAddr,
        request: RequestSpecific,
        _handler: Arc<dyn ResponseHandler>,
    ) -> mojito::Result<()> {
        if let RequestTypeSpecific::Store(args) = request.request_type {
            let mut values = self.0.lock().unwrap();
            values.extend(args.entities.into_iter().map(|entity| entity.value));
        }

        Ok(())
    }
}

type Pending = (Option<Kuid>, SocketAddr, Arc<dyn ResponseHandler>);

/// Keeps every request pending until the test times it out.
#[derive(Default)]
struct Held(Mutex<Vec<Pending>>);

impl Held {
    /// Pending requests, once `count` of them were sent or after a second.
    fn pending(&self, count: usize) -> Vec<Pending> {
        let deadline = Instant::now() + Duration::from_secs(1);

        loop {
            let pending = self.0.lock().unwrap().clone();
            if pending.len() >= count || Instant::now() >= deadline {
                return pending;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Debug for Held {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Held")
            .field(&self.0.lock().unwrap().len())
            .finish()
    }
}

impl MessageDispatcher for Held {
    fn send(
        &self,
        node_id: Option<Kuid>,
        destination: SocketAddr,
        _request: RequestSpecific,
        handler: Arc<dyn ResponseHandler>,
    ) -> mojito::Result<()> {
        self.0.lock().unwrap().push((node_id, destination, handler));
        Ok(())
    }
}

#[test]
fn ping() {
    let network = SimNetwork::new();
    let node = SimNode::random();
    let contact = node.contact().clone();
    network.add(node);

    let dht = dht(&network);
    let pong = dht.ping(contact.address()).get_timeout(TIMEOUT).unwrap();

    assert_eq!(pong.contact.id(), contact.id());
    assert_eq!(pong.external_address, dht.local_contact().address());
}

#[test]
fn ping_offline_node() {
    let network = SimNetwork::new();
    let node = SimNode::random().with_behavior(SimBehavior::Offline);
    let contact = node.contact().clone();
    network.add(node);

    let dht = dht(&network);
    let error = dht.ping_contact(&contact).get_timeout(TIMEOUT).unwrap_err();

    assert!(error.is_timeout());
}

#[test]
fn store_then_find_value() {
    let network = SimNetwork::new();
    let mesh = network.spawn_mesh(20);
    let dht = dht(&network);
    dht.bootstrap(mesh[0].clone()).get_timeout(TIMEOUT).unwrap();

    let key = Kuid::from_content(b"key");
    let value = entity(key, "value");

    let stored = dht
        .store(vec![value.clone()])
        .unwrap()
        .get_timeout(TIMEOUT)
        .unwrap();

    assert!(!stored.stored_at.is_empty());
    assert!(stored.failed.is_empty());
    for contact in &stored.stored_at {
        assert!(network.values(contact.address()).contains(&value));
    }

    let found = dht
        .find_value(EntityKey::lookup(key, DhtValueType::Any))
        .get_timeout(TIMEOUT)
        .unwrap();

    assert!(found.is_success());
    assert_eq!(found.entities, vec![value]);
}

#[test]
fn store_rejects_mixed_primary_keys() {
    let network = SimNetwork::new();
    let dht = dht(&network);

    let entities = vec![
        entity(Kuid::from_content(b"a"), "a"),
        entity(Kuid::from_content(b"b"), "b"),
    ];

    assert!(matches!(dht.store(entities), Err(Error::InvalidArgument(_))));
    assert!(matches!(dht.store(vec![]), Err(Error::InvalidArgument(_))));
    assert_eq!(network.requests(RequestKind::Store), 0);
}

#[test]
fn store_at_fetches_token() {
    let network = SimNetwork::new();
    let node = SimNode::random().with_token(Bytes::from_static(b"secret"));
    let contact = node.contact().clone();
    network.add(node);

    let dht = dht(&network);
    let value = entity(Kuid::from_content(b"key"), "value");

    let stored = dht
        .store_at(contact.clone(), None, vec![value.clone()])
        .unwrap()
        .get_timeout(TIMEOUT)
        .unwrap();

    assert_eq!(stored.stored_at, vec![contact.clone()]);
    assert_eq!(network.values(contact.address()), vec![value]);
}

#[test]
fn store_at_with_wrong_token() {
    let network = SimNetwork::new();
    let node = SimNode::random().with_token(Bytes::from_static(b"secret"));
    let contact = node.contact().clone();
    network.add(node);

    let dht = dht(&network);
    let token = SecurityToken(Bytes::from_static(b"guess"));

    let stored = dht
        .store_at(
            contact.clone(),
            Some(token),
            vec![entity(Kuid::from_content(b"key"), "value")],
        )
        .unwrap()
        .get_timeout(TIMEOUT)
        .unwrap();

    assert!(stored.stored_at.is_empty());
    assert_eq!(stored.failed, vec![contact.clone()]);
    assert!(network.values(contact.address()).is_empty());
    assert_eq!(network.requests(RequestKind::FindNode), 0);
}

#[test]
fn concurrent_stores_of_different_values() {
    let recorder = Arc::new(StoreRecorder::default());
    let dht = Dht::builder().dispatcher(recorder.clone()).build().unwrap();

    let contact = SimNode::random().contact().clone();
    let token = SecurityToken(Bytes::from_static(b"token"));
    let key = Kuid::from_content(b"key");
    let creator = Kuid::random();
    let old = DhtValueEntity::new(key, creator, DhtValueType::Text, "old");
    let new = DhtValueEntity::new(key, creator, DhtValueType::Text, "new");

    let first = dht
        .store_at(contact.clone(), Some(token.clone()), vec![old.clone()])
        .unwrap();
    let second = dht
        .store_at(contact.clone(), Some(token.clone()), vec![new])
        .unwrap();
    // Same value to the same place joins the store in flight.
    let again = dht.store_at(contact, Some(token), vec![old]).unwrap();

    assert!(!first.ptr_eq(&second));
    assert!(first.ptr_eq(&again));

    let mut values = recorder.values(2);
    values.sort();
    assert_eq!(values, vec![Bytes::from("new"), Bytes::from("old")]);

    dht.shutdown();
}

#[test]
fn find_value_from_holder() {
    let network = SimNetwork::new();
    let key = Kuid::from_content(b"file");
    let text = entity(key, "text");
    let binary = DhtValueEntity::new(key, Kuid::random(), DhtValueType::Binary, "binary");

    let holder = SimNode::random().with_values(vec![text.clone(), binary.clone()]);
    let contact = holder.contact().clone();
    network.add(holder);

    let dht = dht(&network);
    assert!(dht.add_contact(contact));

    let found = dht
        .find_value(EntityKey::lookup(key, DhtValueType::Text))
        .get_timeout(TIMEOUT)
        .unwrap();

    assert_eq!(found.entities, vec![text]);

    let found = dht
        .find_value(EntityKey::lookup(key, DhtValueType::Any))
        .get_timeout(TIMEOUT)
        .unwrap();

    assert_eq!(found.entities.len(), 2);
    assert!(found.entities.contains(&binary));
}

#[test]
fn find_missing_value() {
    let network = SimNetwork::new();
    let mesh = network.spawn_mesh(10);
    let dht = dht(&network);
    dht.bootstrap(mesh[0].clone()).get_timeout(TIMEOUT).unwrap();

    let found = dht
        .find_value(EntityKey::lookup(Kuid::random(), DhtValueType::Any))
        .get_timeout(TIMEOUT)
        .unwrap();

    assert!(!found.is_success());
    assert!(found.entities.is_empty());
}

#[test]
fn lookup_past_deadline_stops_on_timeout() {
    let held = Arc::new(Held::default());

    let mut config = Config::default();
    config.kademlia.alpha = 1;
    config.kademlia.lookup_timeout = Duration::from_millis(50);

    let dht = Dht::builder()
        .config(config)
        .dispatcher(held.clone())
        .build()
        .unwrap();
    for _ in 0..3 {
        dht.add_contact(SimNode::random().contact().clone());
    }

    let lookup = dht.find_node(Kuid::random());

    let pending = held.pending(1);
    assert_eq!(pending.len(), 1);

    thread::sleep(Duration::from_millis(60));
    let (node_id, address, handler) = pending[0].clone();
    handler.timeout(node_id, address, Duration::from_millis(60));

    // No other contact is queried once the lookup ran out of time.
    let result = lookup.get_timeout(TIMEOUT).unwrap();
    assert_eq!(held.pending(2).len(), 1);
    assert!(result.route_table_failures >= 1);

    dht.shutdown();
}

#[test]
fn concurrent_lookups_share_one_future() {
    let dht = Dht::builder().dispatcher(Arc::new(Blackhole)).build().unwrap();
    dht.add_contact(SimNode::random().contact().clone());

    let target = Kuid::random();
    let first = dht.find_node(target);
    let second = dht.find_node(target);

    assert!(first.ptr_eq(&second));
    assert!(!first.ptr_eq(&dht.find_node(Kuid::random())));

    first.cancel();
    assert!(second.is_cancelled());

    let third = dht.find_node(target);
    assert!(!third.ptr_eq(&first));
    assert!(!third.is_done());

    dht.shutdown();
    assert!(third.is_cancelled());
}

#[test]
fn shutdown_cancels_in_flight_operations() {
    let dht = Dht::builder().dispatcher(Arc::new(Blackhole)).build().unwrap();
    let contact = SimNode::random().contact().clone();
    dht.add_contact(contact.clone());

    let key = Kuid::random();
    let ping = dht.ping_contact(&contact);
    let lookup = dht.find_value(EntityKey::lookup(key, DhtValueType::Any));
    let store = dht.store(vec![entity(key, "value")]).unwrap();

    dht.shutdown();

    assert!(matches!(ping.get_timeout(TIMEOUT), Err(Error::Cancelled)));
    assert!(matches!(lookup.get_timeout(TIMEOUT), Err(Error::Cancelled)));
    assert!(matches!(store.get_timeout(TIMEOUT), Err(Error::Cancelled)));
}
