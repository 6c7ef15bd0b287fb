//! Simplified Kademlia routing table

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::trace;

use crate::common::{Contact, ContactState, Kuid, MAX_DISTANCE};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;
/// Maximum number of replacement candidates remembered per bucket.
pub const MAX_CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(5) {
    Some(size) => size,
    None => panic!("cache size must be non zero"),
};
/// Number of failed requests after which a contact is considered dead.
pub const MAX_FAILURES: u32 = 2;
/// Buckets with no contact seen for this long are refreshed outside of bootstrapping.
pub const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Which contacts [RoutingTable::select] may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Every contact that isn't dead.
    All,
    /// Only contacts that responded to us.
    Alive,
    /// Alive contacts plus the local contact.
    AliveWithLocal,
}

/// Compaction steps applied by [RoutingTable::purge].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeMode {
    /// Forget all replacement candidates.
    DropCache,
    /// Remove dead contacts.
    PurgeContacts,
    /// Remove buckets left empty.
    MergeBuckets,
    /// Reset every remaining contact to [ContactState::Unknown].
    StateToUnknown,
}

#[derive(Debug)]
/// Simplified Kademlia routing table, buckets are indexed by their distance
/// to the local node id.
pub struct RoutingTable {
    local: Contact,
    buckets: BTreeMap<u8, KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] for a given local contact.
    pub fn new(local: Contact) -> Self {
        RoutingTable {
            local,
            buckets: BTreeMap::new(),
        }
    }

    /// Returns the [Kuid] of this node, where the distance is measured from.
    pub fn id(&self) -> &Kuid {
        self.local.id()
    }

    pub fn local_contact(&self) -> &Contact {
        &self.local
    }

    /// Returns `true` if the contact shares the local node id or address.
    pub fn is_local(&self, contact: &Contact) -> bool {
        contact.id() == self.local.id() || contact.address() == self.local.address()
    }

    // === Public Methods ===

    /// Attempts to add or update a contact, returns `true` if it is a new entry.
    pub fn add(&mut self, contact: Contact) -> bool {
        if self.is_local(&contact) {
            // Do not add self to the routing_table
            return false;
        }

        let distance = self.local.id().distance(contact.id());
        let bucket = self.buckets.entry(distance).or_default();

        bucket.add(contact)
    }

    /// Returns the contact with this id if it is in an active bucket slot.
    pub fn get(&self, id: &Kuid) -> Option<&Contact> {
        let distance = self.local.id().distance(id);

        self.buckets
            .get(&distance)
            .and_then(|bucket| bucket.get(id))
    }

    /// Remove a contact from this routing table.
    pub fn remove(&mut self, id: &Kuid) {
        let distance = self.local.id().distance(id);

        if let Some(bucket) = self.buckets.get_mut(&distance) {
            bucket.remove(id)
        }
    }

    /// Return up to `count` contacts closest to the `target`.
    pub fn select(&self, target: &Kuid, count: usize, mode: SelectMode) -> Vec<Contact> {
        let mut selected: Vec<Contact> = self
            .contacts()
            .filter(|contact| match mode {
                SelectMode::All => !contact.is_dead(),
                SelectMode::Alive | SelectMode::AliveWithLocal => contact.is_alive(),
            })
            .cloned()
            .collect();

        if mode == SelectMode::AliveWithLocal {
            selected.push(self.local.clone());
        }

        selected.sort_by_key(|contact| contact.id().xor(target));
        selected.truncate(count);

        selected
    }

    /// Note a request to this contact failed. The contact is replaced by a cached
    /// candidate once it is considered dead.
    pub fn handle_failure(&mut self, id: &Kuid, address: SocketAddr) {
        let distance = self.local.id().distance(id);

        if let Some(bucket) = self.buckets.get_mut(&distance) {
            bucket.handle_failure(id, address);
        }
    }

    /// Compact the routing table.
    pub fn purge(&mut self, modes: &[PurgeMode]) {
        for mode in modes {
            match mode {
                PurgeMode::DropCache => {
                    for bucket in self.buckets.values_mut() {
                        bucket.cache.clear();
                    }
                }
                PurgeMode::PurgeContacts => {
                    for bucket in self.buckets.values_mut() {
                        bucket.contacts.retain(|contact| !contact.is_dead());
                    }
                }
                PurgeMode::MergeBuckets => {
                    self.buckets.retain(|_, bucket| !bucket.contacts.is_empty());
                }
                PurgeMode::StateToUnknown => {
                    for bucket in self.buckets.values_mut() {
                        for contact in bucket.contacts.iter_mut() {
                            contact.set_state(ContactState::Unknown);
                        }
                    }
                }
            }
        }

        trace!(?modes, size = self.size(), "Purged routing table");
    }

    /// Random lookup targets, one per bucket that needs a refresh, ordered from
    /// the closest bucket to the furthest.
    ///
    /// While bootstrapping every bucket from the closest populated one to the
    /// furthest possible one is refreshed.
    pub fn refresh_ids(&self, bootstrapping: bool) -> Vec<Kuid> {
        let local_id = *self.local.id();

        if bootstrapping {
            let closest = self
                .buckets
                .iter()
                .find(|(_, bucket)| !bucket.contacts.is_empty())
                .map(|(distance, _)| *distance);

            return match closest {
                Some(closest) => (closest..=MAX_DISTANCE)
                    .map(|distance| local_id.random_at_distance(distance))
                    .collect(),
                None => vec![],
            };
        }

        self.buckets
            .iter()
            .filter(|(_, bucket)| bucket.needs_refresh())
            .map(|(distance, _)| local_id.random_at_distance(*distance))
            .collect()
    }

    /// Ratio (0.0 ..= 1.0) of alive contacts among all active contacts.
    pub fn alive_percentage(&self) -> f32 {
        let size = self.size();
        if size == 0 {
            return 0.0;
        }

        let alive = self.contacts().filter(|contact| contact.is_alive()).count();

        alive as f32 / size as f32
    }

    /// Re-key the table for a new local id.
    pub fn change_local_id(&mut self, id: Kuid) {
        let contacts: Vec<Contact> = self.contacts().cloned().collect();

        self.local.set_id(id);
        self.buckets.clear();

        for contact in contacts {
            self.add(contact);
        }
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.contacts.is_empty())
    }

    /// Return the number of active contacts in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.contacts.len())
    }

    /// Returns an iterator over the active contacts in this routing table.
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> + '_ {
        self.buckets.values().flat_map(|bucket| bucket.contacts.iter())
    }

    /// Returns the number of replacement candidates.
    pub fn cached_size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.cache.len())
    }
}

/// Kbuckets keep up to K contacts, new contacts overflow into a small
/// replacement cache that is drawn from when a contact dies.
#[derive(Debug)]
pub struct KBucket {
    /// Contacts in the k-bucket, sorted by the least recently updated.
    contacts: Vec<Contact>,
    cache: LruCache<Kuid, Contact>,
}

impl KBucket {
    pub fn new() -> Self {
        KBucket {
            contacts: Vec::with_capacity(MAX_BUCKET_SIZE_K),
            cache: LruCache::new(MAX_CACHE_SIZE),
        }
    }

    // === Public Methods ===

    pub fn add(&mut self, incoming: Contact) -> bool {
        if let Some(index) = self.contacts.iter().position(|c| c.id() == incoming.id()) {
            let existing = &mut self.contacts[index];

            // An alive contact keeps its address unless the incoming one is
            // just as alive, otherwise anyone could hijack its slot.
            if existing.address() != incoming.address()
                && existing.is_alive()
                && !incoming.is_alive()
            {
                return false;
            }

            let mut updated = existing.clone();
            updated.update_from(&incoming);

            self.contacts.remove(index);
            self.contacts.push(updated);

            false
        } else if self.contacts.len() < MAX_BUCKET_SIZE_K {
            self.cache.pop(incoming.id());
            self.contacts.push(incoming);
            true
        } else if let Some(index) = self.contacts.iter().position(|c| c.is_dead()) {
            self.contacts.remove(index);
            self.contacts.push(incoming);
            true
        } else {
            self.cache.put(*incoming.id(), incoming);
            false
        }
    }

    pub fn get(&self, id: &Kuid) -> Option<&Contact> {
        self.contacts.iter().find(|contact| contact.id() == id)
    }

    pub fn remove(&mut self, id: &Kuid) {
        self.contacts.retain(|contact| contact.id() != id);
    }

    fn handle_failure(&mut self, id: &Kuid, address: SocketAddr) {
        let Some(index) = self
            .contacts
            .iter()
            .position(|c| c.id() == id && c.address() == address)
        else {
            self.cache.pop(id);
            return;
        };

        if self.contacts[index].record_failure() < MAX_FAILURES {
            return;
        }

        if let Some((_, replacement)) = self.cache.pop_lru() {
            self.contacts.remove(index);
            self.contacts.push(replacement);
        } else {
            self.contacts[index].set_state(ContactState::Dead);
        }
    }

    fn needs_refresh(&self) -> bool {
        self.contacts
            .iter()
            .filter_map(|contact| contact.last_seen())
            .max()
            .map(|last_seen| last_seen.elapsed() >= BUCKET_REFRESH_INTERVAL)
            .unwrap_or(true)
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    #[cfg(test)]
    fn contains(&self, id: &Kuid) -> bool {
        self.contacts.iter().any(|contact| contact.id() == id)
    }
}

impl Default for KBucket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    fn local() -> Contact {
        Contact::alive(Kuid::random(), SocketAddr::from(([127, 0, 0, 1], 6346)))
    }

    #[test]
    fn table_is_empty() {
        let mut table = RoutingTable::new(local());
        assert!(table.is_empty());

        table.add(Contact::random());
        assert!(!table.is_empty());
    }

    #[test]
    fn contains_and_remove() {
        let mut table = RoutingTable::new(local());

        let contact = Contact::random();

        assert!(table.get(contact.id()).is_none());

        table.add(contact.clone());
        assert!(table.get(contact.id()).is_some());

        table.remove(contact.id());
        assert!(table.get(contact.id()).is_none());
    }

    #[test]
    fn buckets_are_sets() {
        let mut table = RoutingTable::new(local());

        let contact1 = Contact::random();
        let contact2 = Contact::new(*contact1.id(), contact1.address());

        assert!(table.add(contact1));
        assert!(!table.add(contact2));

        assert_eq!(table.size(), 1);
    }

    #[test]
    fn should_not_add_self() {
        let mut table = RoutingTable::new(local());
        let contact = table.local_contact().clone();

        assert!(!table.add(contact));
        assert!(table.is_empty())
    }

    #[test]
    fn should_not_add_more_than_k() {
        let mut bucket = KBucket::new();

        for i in 0..MAX_BUCKET_SIZE_K {
            assert!(bucket.add(Contact::random()), "Failed to add contact {i}");
        }

        let overflow = Contact::random();
        assert!(!bucket.add(overflow.clone()));
        assert!(!bucket.contains(overflow.id()));
        assert_eq!(bucket.cache.len(), 1);
    }

    #[test]
    fn alive_contact_keeps_its_address() {
        let mut bucket = KBucket::new();

        let alive = Contact::random().with_state(ContactState::Alive);
        let spoof = Contact::new(*alive.id(), SocketAddr::from(([10, 0, 0, 1], 1)));

        bucket.add(alive.clone());
        bucket.add(spoof);

        assert_eq!(bucket.get(alive.id()).unwrap().address(), alive.address());
    }

    #[test]
    fn update_marks_alive() {
        let mut table = RoutingTable::new(local());
        let contact = Contact::random();

        table.add(contact.clone());
        assert!(!table.get(contact.id()).unwrap().is_alive());

        table.add(contact.clone().with_state(ContactState::Alive));
        assert!(table.get(contact.id()).unwrap().is_alive());
    }

    #[test]
    fn failures_kill_and_purge() {
        let mut table = RoutingTable::new(local());
        let contact = Contact::random();
        table.add(contact.clone());

        for _ in 0..MAX_FAILURES {
            table.handle_failure(contact.id(), contact.address());
        }
        assert!(table.get(contact.id()).unwrap().is_dead());

        table.purge(&[PurgeMode::PurgeContacts, PurgeMode::MergeBuckets]);
        assert!(table.is_empty());
        assert_eq!(table.buckets.len(), 0);
    }

    #[test]
    fn alive_percentage() {
        let mut table = RoutingTable::new(local());
        assert_eq!(table.alive_percentage(), 0.0);

        table.add(Contact::random().with_state(ContactState::Alive));
        table.add(Contact::random());

        assert!((table.alive_percentage() - 0.5).abs() < f32::EPSILON);

        table.purge(&[PurgeMode::StateToUnknown]);
        assert_eq!(table.alive_percentage(), 0.0);
    }

    #[test]
    fn refresh_ids_cover_far_buckets() {
        let local_id = Kuid::from_str("ba3042eb2d373b19e7c411ce6826e31b37be0b2e").unwrap();
        let mut table = RoutingTable::new(Contact::alive(
            local_id,
            SocketAddr::from(([127, 0, 0, 1], 6346)),
        ));
        assert!(table.refresh_ids(true).is_empty());

        let close = local_id.random_at_distance(150);
        table.add(Contact::new(close, SocketAddr::from(([10, 0, 0, 1], 1))));

        let ids = table.refresh_ids(true);
        assert_eq!(ids.len(), 11);

        let distances: Vec<u8> = ids.iter().map(|id| local_id.distance(id)).collect();
        assert_eq!(distances, (150..=160).collect::<Vec<u8>>());

        // Never refreshed buckets are due.
        assert_eq!(table.refresh_ids(false).len(), 1);
    }

    #[test]
    fn select_closest() {
        let mut table = RoutingTable::new(local());
        for _ in 0..50 {
            table.add(Contact::random());
        }

        let target = Kuid::random();
        let selected = table.select(&target, 10, SelectMode::All);
        assert_eq!(selected.len(), 10);

        for pair in selected.windows(2) {
            assert!(pair[0].id().xor(&target) <= pair[1].id().xor(&target));
        }

        assert!(table.select(&target, 10, SelectMode::Alive).is_empty());
        assert_eq!(table.select(&target, 10, SelectMode::AliveWithLocal).len(), 1);
    }

    #[test]
    fn change_local_id_rebuckets() {
        let mut table = RoutingTable::new(local());
        for _ in 0..10 {
            table.add(Contact::random());
        }

        let new_id = Kuid::random();
        table.change_local_id(new_id);

        assert_eq!(table.id(), &new_id);
        for (distance, bucket) in table.buckets.iter() {
            for contact in bucket.contacts.iter() {
                assert_eq!(new_id.distance(contact.id()), *distance);
            }
        }
    }
}
