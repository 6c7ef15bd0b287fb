//! Two peers exchanging alternate locations over HTTP headers.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use mojito::altloc::{
    AltLocKind, AltLocListener, AltLocManager, AltLocSettings, AltLocTracker, AlternateLocation,
    FileEvent, Guid, Host, Location, PushEndpoint, Urn, X_FEATURES, X_NALT,
};

#[derive(Default)]
struct Recorder(Mutex<Vec<AlternateLocation>>);

impl AltLocListener for Recorder {
    fn location_added(&self, location: &AlternateLocation) {
        self.0.lock().unwrap().push(location.clone());
    }
}

fn urn() -> Urn {
    Urn::from_content(b"shared file")
}

fn direct(address: &str, tls: bool) -> AlternateLocation {
    AlternateLocation::direct(urn(), Host::parse(address, tls).unwrap())
}

#[test]
fn upload_download_exchange() {
    let uploader = AltLocManager::new(AltLocSettings::default()).unwrap();
    let downloader = AltLocManager::new(AltLocSettings::default()).unwrap();
    let now = Instant::now();

    uploader.add(direct("1.1.1.1:1000", true), None).unwrap();
    uploader.add(direct("2.2.2.2:2000", false), None).unwrap();
    let proxy = Host::parse("3.3.3.3:3000", false).unwrap();
    let push = AlternateLocation::push(urn(), PushEndpoint::new(Guid::random(), vec![proxy]));
    uploader.add(push.clone(), None).unwrap();

    downloader.add(direct("4.4.4.4:4000", false), None).unwrap();

    let recorder = Arc::new(Recorder::default());
    downloader.add_listener(urn(), recorder.clone()).unwrap();

    // Download request.
    let mut downloader_side = AltLocTracker::new(urn());
    let mut request = downloader_side.headers(&downloader, now).unwrap();
    request.push((X_FEATURES, "fwalt/0.1".to_string()));

    let mut uploader_side = AltLocTracker::new(urn());
    for (name, value) in &request {
        uploader_side.handle_header(&uploader, name, value).unwrap();
    }
    assert!(uploader_side.wants_falts());
    assert_eq!(uploader.num_locs(urn()).unwrap(), 4);

    // Upload response, without the location the downloader just sent.
    let response = uploader_side.headers(&uploader, now).unwrap();
    for (name, value) in &response {
        downloader_side
            .handle_header(&downloader, name, value)
            .unwrap();
    }

    let direct_locations = downloader.locations(urn(), AltLocKind::Direct).unwrap();
    assert_eq!(direct_locations.len(), 3);
    let tls = direct_locations.get(&direct("1.1.1.1:1000", false)).unwrap();
    assert!(matches!(tls.location(), Location::Direct(host) if host.is_tls_capable()));
    assert!(downloader
        .locations(urn(), AltLocKind::Push)
        .unwrap()
        .contains(&push));
    assert_eq!(recorder.0.lock().unwrap().len(), 3);

    // Nothing new to tell each other.
    assert!(uploader_side.headers(&uploader, now).unwrap().is_empty());
}

#[test]
fn failed_download_is_reported() {
    let manager = AltLocManager::new(AltLocSettings::default()).unwrap();
    let location = direct("5.5.5.5:5000", false);
    manager.add(location.clone(), None).unwrap();

    let mut tracker = AltLocTracker::new(urn());
    tracker
        .handle_header(&manager, X_NALT, &location.to_string())
        .unwrap();
    tracker
        .handle_header(&manager, X_NALT, &location.to_string())
        .unwrap();

    assert!(!manager.has_alt_locs(urn()).unwrap());
}

#[test]
fn file_removed_forgets_locations() {
    let manager = AltLocManager::new(AltLocSettings::default()).unwrap();
    manager.add(direct("6.6.6.6", false), None).unwrap();
    manager.add_listener(urn(), Arc::new(Recorder::default())).unwrap();

    manager
        .handle_file_event(FileEvent::FileRemoved {
            urn: urn(),
            remaining: 0,
        })
        .unwrap();

    assert!(!manager.is_tracked(urn()).unwrap());
}
