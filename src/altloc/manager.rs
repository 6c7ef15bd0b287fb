//! Registry of the alternate locations of every file, run as an actor.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use flume::{Receiver, Sender};
use tracing::{debug, trace};

use crate::altloc::{
    AltLocKind, AltLocSettings, AlternateLocation, AlternateLocationCollection, LocationId,
    MeshType, Urn,
};
use crate::{Error, Result};

/// Notified of the locations added to or removed from a file.
///
/// Listeners run on the manager's thread and must not wait on the
/// [AltLocManager].
pub trait AltLocListener: Send + Sync {
    fn location_added(&self, location: &AlternateLocation);

    fn location_removed(&self, _location: &AlternateLocation) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Identifies a registered listener, also used as the source of an event so
/// the listener isn't notified of its own changes.
pub struct ListenerId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
/// Changes to the local file library.
pub enum FileEvent {
    /// Every shared file is gone.
    FilesCleared,
    /// A file was removed, `remaining` files with the same content are still
    /// shared.
    FileRemoved { urn: Urn, remaining: usize },
}

#[derive(Clone)]
/// Handle to the registry, cheap to clone.
///
/// The registry thread stops once every handle is dropped.
pub struct AltLocManager {
    sender: Sender<Command>,
    settings: Arc<AltLocSettings>,
}

impl AltLocManager {
    pub fn new(settings: AltLocSettings) -> Result<Self> {
        let (sender, receiver) = flume::unbounded();
        let settings = Arc::new(settings);

        let actor = Actor {
            settings: settings.clone(),
            urns: HashMap::new(),
            next_listener: 0,
        };

        thread::Builder::new()
            .name("mojito-altloc".to_string())
            .spawn(move || actor.run(receiver))?;

        Ok(AltLocManager { sender, settings })
    }

    pub fn settings(&self) -> &AltLocSettings {
        &self.settings
    }

    /// Add `location` to its file's collection of its kind, and notify the
    /// file's listeners other than `source`.
    ///
    /// Returns `true` if the location was new.
    pub fn add(&self, location: AlternateLocation, source: Option<ListenerId>) -> Result<bool> {
        self.request(|reply| Command::Add(location, source, reply))?
    }

    /// Demote `location`, or drop it if it was already demoted.
    ///
    /// Returns `true` if the location was dropped.
    pub fn remove(&self, location: AlternateLocation, source: Option<ListenerId>) -> Result<bool> {
        self.request(|reply| Command::Remove(location, source, reply))
    }

    /// Snapshot of the locations of one kind for `urn`.
    pub fn locations(&self, urn: Urn, kind: AltLocKind) -> Result<AlternateLocationCollection> {
        self.request(|reply| Command::Locations(urn, kind, reply))
    }

    pub fn has_alt_locs(&self, urn: Urn) -> Result<bool> {
        Ok(self.num_locs(urn)? > 0)
    }

    pub fn num_locs(&self, urn: Urn) -> Result<usize> {
        self.request(|reply| Command::NumLocs(urn, reply))
    }

    /// Returns `true` while anything, locations or listeners, is kept for
    /// `urn`.
    pub fn is_tracked(&self, urn: Urn) -> Result<bool> {
        self.request(|reply| Command::IsTracked(urn, reply))
    }

    /// Up to `max` locations of the given kinds, in kind order, that may be
    /// advertised on `mesh`, leaving out `skip`. The returned locations are
    /// recorded as sent at `now`.
    pub fn send(
        &self,
        urn: Urn,
        kinds: &[AltLocKind],
        mesh: MeshType,
        max: usize,
        skip: HashSet<LocationId>,
        now: Instant,
    ) -> Result<Vec<AlternateLocation>> {
        let request = SendRequest {
            urn,
            kinds: kinds.to_vec(),
            mesh,
            max,
            skip,
            now,
        };

        self.request(|reply| Command::Send(request, reply))
    }

    pub fn add_listener(&self, urn: Urn, listener: Arc<dyn AltLocListener>) -> Result<ListenerId> {
        self.request(|reply| Command::AddListener(urn, listener, reply))
    }

    pub fn remove_listener(&self, urn: Urn, id: ListenerId) -> Result<()> {
        self.request(|reply| Command::RemoveListener(urn, id, reply))
    }

    pub fn handle_file_event(&self, event: FileEvent) -> Result<()> {
        self.request(|reply| Command::FileEvent(event, reply))
    }

    /// Forget everything.
    pub fn purge(&self) -> Result<()> {
        self.handle_file_event(FileEvent::FilesCleared)
    }

    // === Private Methods ===

    fn request<T>(&self, command: impl FnOnce(Sender<T>) -> Command) -> Result<T> {
        let (reply, receiver) = flume::bounded(1);

        self.sender
            .send(command(reply))
            .map_err(|_| Error::Shutdown)?;

        receiver.recv().map_err(|_| Error::Shutdown)
    }
}

impl Debug for AltLocManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AltLocManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

struct SendRequest {
    urn: Urn,
    kinds: Vec<AltLocKind>,
    mesh: MeshType,
    max: usize,
    skip: HashSet<LocationId>,
    now: Instant,
}

enum Command {
    Add(AlternateLocation, Option<ListenerId>, Sender<Result<bool>>),
    Remove(AlternateLocation, Option<ListenerId>, Sender<bool>),
    Locations(Urn, AltLocKind, Sender<AlternateLocationCollection>),
    NumLocs(Urn, Sender<usize>),
    IsTracked(Urn, Sender<bool>),
    Send(SendRequest, Sender<Vec<AlternateLocation>>),
    AddListener(Urn, Arc<dyn AltLocListener>, Sender<ListenerId>),
    RemoveListener(Urn, ListenerId, Sender<()>),
    FileEvent(FileEvent, Sender<()>),
}

struct UrnData {
    direct: AlternateLocationCollection,
    push: AlternateLocationCollection,
    fwt: AlternateLocationCollection,
    listeners: Vec<(ListenerId, Arc<dyn AltLocListener>)>,
}

impl UrnData {
    fn new(urn: Urn, capacity: usize) -> Self {
        UrnData {
            direct: AlternateLocationCollection::with_capacity(urn, capacity),
            push: AlternateLocationCollection::with_capacity(urn, capacity),
            fwt: AlternateLocationCollection::with_capacity(urn, capacity),
            listeners: vec![],
        }
    }

    fn collection(&self, kind: AltLocKind) -> &AlternateLocationCollection {
        match kind {
            AltLocKind::Direct => &self.direct,
            AltLocKind::Push => &self.push,
            AltLocKind::Fwt => &self.fwt,
        }
    }

    fn collection_mut(&mut self, kind: AltLocKind) -> &mut AlternateLocationCollection {
        match kind {
            AltLocKind::Direct => &mut self.direct,
            AltLocKind::Push => &mut self.push,
            AltLocKind::Fwt => &mut self.fwt,
        }
    }

    fn num_locs(&self) -> usize {
        self.direct.len() + self.push.len() + self.fwt.len()
    }

    fn is_empty(&self) -> bool {
        self.num_locs() == 0 && self.listeners.is_empty()
    }

    fn notify(&self, source: Option<ListenerId>, notify: impl Fn(&dyn AltLocListener)) {
        self.listeners
            .iter()
            .filter(|(id, _)| Some(*id) != source)
            .for_each(|(_, listener)| notify(listener.as_ref()));
    }
}

/// Owns every [UrnData], only ever touched by the registry thread.
struct Actor {
    settings: Arc<AltLocSettings>,
    urns: HashMap<Urn, UrnData>,
    next_listener: u64,
}

impl Actor {
    fn run(mut self, receiver: Receiver<Command>) {
        while let Ok(command) = receiver.recv() {
            self.handle(command);
        }

        debug!("Alternate location registry stopped, every handle was dropped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Add(location, source, reply) => {
                let _ = reply.send(self.add(location, source));
            }
            Command::Remove(location, source, reply) => {
                let _ = reply.send(self.remove(location, source));
            }
            Command::Locations(urn, kind, reply) => {
                let collection = self
                    .urns
                    .get(&urn)
                    .map(|data| data.collection(kind).clone())
                    .unwrap_or_else(|| AlternateLocationCollection::new(urn));

                let _ = reply.send(collection);
            }
            Command::NumLocs(urn, reply) => {
                let _ = reply.send(self.urns.get(&urn).map_or(0, UrnData::num_locs));
            }
            Command::IsTracked(urn, reply) => {
                let _ = reply.send(self.urns.contains_key(&urn));
            }
            Command::Send(request, reply) => {
                let _ = reply.send(self.send(request));
            }
            Command::AddListener(urn, listener, reply) => {
                let id = ListenerId(self.next_listener);
                self.next_listener += 1;

                self.data(urn).listeners.push((id, listener));
                let _ = reply.send(id);
            }
            Command::RemoveListener(urn, id, reply) => {
                if let Some(data) = self.urns.get_mut(&urn) {
                    data.listeners.retain(|(listener, _)| *listener != id);
                }
                self.remove_if_empty(&urn);

                let _ = reply.send(());
            }
            Command::FileEvent(event, reply) => {
                match event {
                    FileEvent::FilesCleared => {
                        debug!(urns = self.urns.len(), "Purging all alternate locations");
                        self.urns.clear();
                    }
                    FileEvent::FileRemoved { urn, remaining: 0 } => {
                        debug!(?urn, "Purging alternate locations of removed file");
                        self.urns.remove(&urn);
                    }
                    FileEvent::FileRemoved { .. } => {}
                }

                let _ = reply.send(());
            }
        }
    }

    fn data(&mut self, urn: Urn) -> &mut UrnData {
        let capacity = self.settings.max_locations;

        self.urns
            .entry(urn)
            .or_insert_with(|| UrnData::new(urn, capacity))
    }

    fn add(&mut self, location: AlternateLocation, source: Option<ListenerId>) -> Result<bool> {
        trace!(?location, "Alternate location added");

        let data = self.data(*location.urn());
        let added = data.collection_mut(location.kind()).add(location.clone())?;

        data.notify(source, |listener| listener.location_added(&location));

        Ok(added)
    }

    fn remove(&mut self, location: AlternateLocation, source: Option<ListenerId>) -> bool {
        let urn = *location.urn();
        let Some(data) = self.urns.get_mut(&urn) else {
            return false;
        };

        let collection = data.collection_mut(location.kind());
        if !collection.contains(&location) {
            return false;
        }

        let removed = collection.remove(&location);
        let emptied = collection.is_empty();

        data.notify(source, |listener| listener.location_removed(&location));

        if emptied {
            self.remove_if_empty(&urn);
        }

        removed
    }

    fn send(&mut self, request: SendRequest) -> Vec<AlternateLocation> {
        let SendRequest {
            urn,
            kinds,
            mesh,
            max,
            skip,
            now,
        } = request;

        let settings = self.settings.clone();
        let Some(data) = self.urns.get_mut(&urn) else {
            return vec![];
        };

        let mut sent = vec![];
        for kind in kinds {
            let remaining = max.saturating_sub(sent.len());
            if remaining == 0 {
                break;
            }

            sent.extend(data.collection_mut(kind).send(
                now,
                mesh,
                remaining,
                &settings,
                |location| skip.contains(&location.id()),
            ));
        }

        sent
    }

    fn remove_if_empty(&mut self, urn: &Urn) {
        if self.urns.get(urn).is_some_and(UrnData::is_empty) {
            trace!(?urn, "Forgetting file without alternate locations");
            self.urns.remove(urn);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;
    use crate::altloc::{Guid, Host, PushEndpoint};

    #[derive(Default)]
    struct Recorder {
        added: Mutex<Vec<AlternateLocation>>,
        removed: Mutex<Vec<AlternateLocation>>,
    }

    impl AltLocListener for Recorder {
        fn location_added(&self, location: &AlternateLocation) {
            self.added.lock().unwrap().push(location.clone());
        }

        fn location_removed(&self, location: &AlternateLocation) {
            self.removed.lock().unwrap().push(location.clone());
        }
    }

    fn urn() -> Urn {
        Urn::from_content(b"file")
    }

    fn direct(i: u8) -> AlternateLocation {
        AlternateLocation::direct(urn(), Host::parse(&format!("1.1.1.{i}"), false).unwrap())
    }

    fn push(fwt: bool) -> AlternateLocation {
        let proxy = Host::parse("2.2.2.2:2", false).unwrap();
        let mut endpoint = PushEndpoint::new(Guid::random(), vec![proxy]);
        if fwt {
            endpoint = endpoint.with_fwt(1, "3.3.3.3:3".parse().unwrap());
        }

        AlternateLocation::push(urn(), endpoint)
    }

    #[test]
    fn routes_by_kind() {
        let manager = AltLocManager::new(AltLocSettings::default()).unwrap();

        assert!(manager.add(direct(1), None).unwrap());
        assert!(manager.add(push(false), None).unwrap());
        assert!(manager.add(push(true), None).unwrap());
        assert!(!manager.add(direct(1), None).unwrap());

        assert_eq!(manager.locations(urn(), AltLocKind::Direct).unwrap().len(), 1);
        assert_eq!(manager.locations(urn(), AltLocKind::Push).unwrap().len(), 1);
        assert_eq!(manager.locations(urn(), AltLocKind::Fwt).unwrap().len(), 1);
        assert_eq!(manager.num_locs(urn()).unwrap(), 3);
        assert!(manager.has_alt_locs(urn()).unwrap());
    }

    #[test]
    fn remove_twice_forgets_urn() {
        let manager = AltLocManager::new(AltLocSettings::default()).unwrap();
        manager.add(direct(1), None).unwrap();

        assert!(!manager.remove(direct(1), None).unwrap());
        assert!(manager.is_tracked(urn()).unwrap());

        assert!(manager.remove(direct(1), None).unwrap());
        assert!(!manager.is_tracked(urn()).unwrap());
        assert!(!manager.remove(direct(1), None).unwrap());
    }

    #[test]
    fn remove_push_twice() {
        let manager = AltLocManager::new(AltLocSettings::default()).unwrap();
        let location = push(false);
        manager.add(location.clone(), None).unwrap();

        assert!(!manager.remove(location.clone(), None).unwrap());
        assert_eq!(manager.locations(urn(), AltLocKind::Push).unwrap().len(), 1);

        assert!(manager.remove(location, None).unwrap());
        assert!(!manager.has_alt_locs(urn()).unwrap());
    }

    #[test]
    fn listeners_skip_source() {
        let manager = AltLocManager::new(AltLocSettings::default()).unwrap();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());

        let first_id = manager.add_listener(urn(), first.clone()).unwrap();
        manager.add_listener(urn(), second.clone()).unwrap();

        manager.add(direct(1), Some(first_id)).unwrap();
        manager.remove(direct(1), None).unwrap();

        assert!(first.added.lock().unwrap().is_empty());
        assert_eq!(second.added.lock().unwrap().len(), 1);
        assert_eq!(first.removed.lock().unwrap().len(), 1);
        assert_eq!(second.removed.lock().unwrap().len(), 1);
    }

    #[test]
    fn listeners_keep_urn() {
        let manager = AltLocManager::new(AltLocSettings::default()).unwrap();
        let id = manager
            .add_listener(urn(), Arc::new(Recorder::default()))
            .unwrap();

        manager.add(direct(1), None).unwrap();
        manager.remove(direct(1), None).unwrap();
        manager.remove(direct(1), None).unwrap();
        assert!(manager.is_tracked(urn()).unwrap());

        manager.remove_listener(urn(), id).unwrap();
        assert!(!manager.is_tracked(urn()).unwrap());
    }

    #[test]
    fn file_events() {
        let manager = AltLocManager::new(AltLocSettings::default()).unwrap();
        let other = Urn::from_content(b"other");
        manager.add(direct(1), None).unwrap();
        manager
            .add(
                AlternateLocation::direct(other, Host::parse("1.1.1.1", false).unwrap()),
                None,
            )
            .unwrap();

        manager
            .handle_file_event(FileEvent::FileRemoved {
                urn: urn(),
                remaining: 1,
            })
            .unwrap();
        assert!(manager.is_tracked(urn()).unwrap());

        manager
            .handle_file_event(FileEvent::FileRemoved {
                urn: urn(),
                remaining: 0,
            })
            .unwrap();
        assert!(!manager.is_tracked(urn()).unwrap());
        assert!(manager.is_tracked(other).unwrap());

        manager.purge().unwrap();
        assert!(!manager.is_tracked(other).unwrap());
    }

    #[test]
    fn send_in_kind_order() {
        let manager = AltLocManager::new(AltLocSettings::default()).unwrap();
        let fwt = push(true);
        let plain = push(false);
        manager.add(plain.clone(), None).unwrap();
        manager.add(fwt.clone(), None).unwrap();

        let sent = manager
            .send(
                urn(),
                &[AltLocKind::Fwt, AltLocKind::Push],
                MeshType::Legacy,
                1,
                HashSet::new(),
                Instant::now(),
            )
            .unwrap();
        assert_eq!(sent, vec![fwt.clone()]);

        let sent = manager
            .send(
                urn(),
                &[AltLocKind::Fwt, AltLocKind::Push],
                MeshType::Legacy,
                5,
                HashSet::from([fwt.id()]),
                Instant::now(),
            )
            .unwrap();
        assert_eq!(sent, vec![plain]);
    }
}
