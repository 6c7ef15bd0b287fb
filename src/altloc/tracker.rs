use std::collections::HashSet;
use std::time::Instant;

use tracing::trace;

use crate::altloc::{
    encode_alternate_locations, parse_alternate_locations, parse_node_info, AltLocKind,
    AltLocManager, AlternateLocation, Features, LocationId, MeshType, PushEndpoint, Urn, X_ALT,
    X_FALT, X_FEATURES, X_FW_NODE_INFO, X_NALT, X_NFALT,
};
use crate::Result;

#[derive(Debug, Clone)]
/// Alternate location state of one HTTP exchange with a peer about one file.
pub struct AltLocTracker {
    urn: Urn,
    /// Locations the peer already knows about.
    sent: HashSet<LocationId>,
    fwt_version: u8,
    wants_falts: bool,
    node_info: Option<PushEndpoint>,
}

impl AltLocTracker {
    pub fn new(urn: Urn) -> Self {
        AltLocTracker {
            urn,
            sent: HashSet::new(),
            fwt_version: 0,
            wants_falts: false,
            node_info: None,
        }
    }

    // === Getters ===

    pub fn urn(&self) -> &Urn {
        &self.urn
    }

    /// Firewall to firewall transfer version the peer declared.
    pub fn fwt_version(&self) -> u8 {
        self.fwt_version
    }

    /// Returns `true` if the peer asked for firewalled locations.
    pub fn wants_falts(&self) -> bool {
        self.wants_falts
    }

    /// The peer's own push endpoint, if it is firewalled.
    pub fn node_info(&self) -> Option<&PushEndpoint> {
        self.node_info.as_ref()
    }

    // === Public Methods ===

    pub fn set_features(&mut self, features: Features) {
        self.wants_falts |= features.wants_falts;
        if features.fwt_version > 0 {
            self.fwt_version = features.fwt_version;
        }
    }

    /// Read one header sent by the peer, good and failed locations go to
    /// `manager`. Other headers are ignored.
    pub fn handle_header(
        &mut self,
        manager: &AltLocManager,
        name: &str,
        value: &str,
    ) -> Result<()> {
        let name = name.trim();

        if name.eq_ignore_ascii_case(X_ALT) {
            self.add_locations(manager, parse_alternate_locations(&self.urn, value, true))?;
        } else if name.eq_ignore_ascii_case(X_FALT) {
            self.wants_falts = true;
            self.add_locations(manager, parse_alternate_locations(&self.urn, value, false))?;
        } else if name.eq_ignore_ascii_case(X_NALT) || name.eq_ignore_ascii_case(X_NFALT) {
            for location in parse_alternate_locations(&self.urn, value, false) {
                manager.remove(location, None)?;
            }
        } else if name.eq_ignore_ascii_case(X_FEATURES) {
            self.set_features(Features::parse(value));
        } else if name.eq_ignore_ascii_case(X_FW_NODE_INFO) {
            match parse_node_info(value) {
                Ok(endpoint) => {
                    if endpoint.fwt_version() > 0 {
                        self.fwt_version = endpoint.fwt_version();
                    }
                    self.node_info = Some(endpoint);
                }
                Err(error) => trace!(?error, "Ignoring invalid node info"),
            }
        }

        Ok(())
    }

    /// Next direct locations to send the peer, never more than
    /// `max_direct_per_exchange` nor one it already knows.
    pub fn next_direct_to_send(
        &mut self,
        manager: &AltLocManager,
        now: Instant,
    ) -> Result<Vec<AlternateLocation>> {
        let max = manager.settings().max_direct_per_exchange;

        self.next_to_send(manager, &[AltLocKind::Direct], max, now)
    }

    /// Next firewalled locations to send the peer, only if it wants them.
    ///
    /// Locations supporting firewall to firewall transfers are only sent to
    /// peers supporting them too.
    pub fn next_push_to_send(
        &mut self,
        manager: &AltLocManager,
        now: Instant,
    ) -> Result<Vec<AlternateLocation>> {
        if !self.wants_falts {
            return Ok(vec![]);
        }

        let kinds: &[AltLocKind] = if self.fwt_version > 0 {
            &[AltLocKind::Fwt, AltLocKind::Push]
        } else {
            &[AltLocKind::Push]
        };
        let max = manager.settings().max_push_per_exchange;

        self.next_to_send(manager, kinds, max, now)
    }

    /// The `X-Alt` and `X-FAlt` headers to send the peer, if there is
    /// anything to tell it.
    pub fn headers(
        &mut self,
        manager: &AltLocManager,
        now: Instant,
    ) -> Result<Vec<(&'static str, String)>> {
        let mut headers = vec![];

        let direct = self.next_direct_to_send(manager, now)?;
        if !direct.is_empty() {
            headers.push((X_ALT, encode_alternate_locations(&direct)));
        }

        let push = self.next_push_to_send(manager, now)?;
        if !push.is_empty() {
            headers.push((X_FALT, encode_alternate_locations(&push)));
        }

        Ok(headers)
    }

    // === Private Methods ===

    fn add_locations(
        &mut self,
        manager: &AltLocManager,
        locations: Vec<AlternateLocation>,
    ) -> Result<()> {
        for location in locations {
            self.sent.insert(location.id());
            manager.add(location, None)?;
        }

        Ok(())
    }

    fn next_to_send(
        &mut self,
        manager: &AltLocManager,
        kinds: &[AltLocKind],
        max: usize,
        now: Instant,
    ) -> Result<Vec<AlternateLocation>> {
        let locations = manager.send(
            self.urn,
            kinds,
            MeshType::Legacy,
            max,
            self.sent.clone(),
            now,
        )?;

        self.sent
            .extend(locations.iter().map(AlternateLocation::id));

        Ok(locations)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::altloc::{AltLocSettings, Guid, Host};

    fn urn() -> Urn {
        Urn::from_content(b"file")
    }

    fn manager() -> AltLocManager {
        AltLocManager::new(AltLocSettings::default()).unwrap()
    }

    fn direct(i: u8) -> AlternateLocation {
        AlternateLocation::direct(urn(), Host::parse(&format!("1.1.{i}.1"), false).unwrap())
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
    fn caps_and_skips_sent() {
        let manager = manager();
        for i in 0..15 {
            manager.add(direct(i), None).unwrap();
        }

        let mut tracker = AltLocTracker::new(urn());
        let now = Instant::now();

        let first = tracker.next_direct_to_send(&manager, now).unwrap();
        assert_eq!(first.len(), 10);

        let second = tracker.next_direct_to_send(&manager, now).unwrap();
        assert_eq!(second.len(), 5);
        assert!(second.iter().all(|location| !first.contains(location)));

        assert!(tracker.next_direct_to_send(&manager, now).unwrap().is_empty());
    }

    #[test]
    fn push_only_when_wanted() {
        let manager = manager();
        for _ in 0..7 {
            manager.add(push(false), None).unwrap();
        }
        let fwt = push(true);
        manager.add(fwt.clone(), None).unwrap();

        let mut tracker = AltLocTracker::new(urn());
        let now = Instant::now();
        assert!(tracker.next_push_to_send(&manager, now).unwrap().is_empty());

        tracker.set_features(Features::parse("fwalt/0.1"));
        let sent = tracker.next_push_to_send(&manager, now).unwrap();
        assert_eq!(sent.len(), 5);
        assert!(!sent.contains(&fwt));

        let mut tracker = AltLocTracker::new(urn());
        tracker.set_features(Features::parse("fwalt/0.1, fwt/1"));
        let sent = tracker.next_push_to_send(&manager, now).unwrap();
        assert_eq!(sent[0], fwt);
    }

    #[test]
    fn received_locations_are_not_echoed() {
        let manager = manager();
        let mut tracker = AltLocTracker::new(urn());

        tracker
            .handle_header(&manager, "x-alt", "1.1.1.1:6346, 1.1.2.1")
            .unwrap();
        assert_eq!(manager.num_locs(urn()).unwrap(), 2);
        assert!(tracker.next_direct_to_send(&manager, Instant::now()).unwrap().is_empty());

        let mut other = AltLocTracker::new(urn());
        assert_eq!(other.next_direct_to_send(&manager, Instant::now()).unwrap().len(), 2);
    }

    #[test]
    fn failed_locations_are_demoted() {
        let manager = manager();
        manager.add(direct(1), None).unwrap();

        let mut tracker = AltLocTracker::new(urn());
        tracker
            .handle_header(&manager, X_NALT, &direct(1).to_string())
            .unwrap();

        let locations = manager.locations(urn(), AltLocKind::Direct).unwrap();
        assert!(locations.get(&direct(1)).unwrap().is_demoted());
    }

    #[test]
    fn failed_push_locations_are_dropped() {
        let manager = manager();
        let location = push(false);
        manager.add(location.clone(), None).unwrap();

        let mut tracker = AltLocTracker::new(urn());
        for _ in 0..2 {
            tracker
                .handle_header(&manager, X_NFALT, &location.to_string())
                .unwrap();
        }

        assert!(!manager.has_alt_locs(urn()).unwrap());
    }

    #[test]
    fn falt_header_means_wants_falts() {
        let manager = manager();
        let mut tracker = AltLocTracker::new(urn());

        tracker
            .handle_header(&manager, X_FALT, &push(false).to_string())
            .unwrap();

        assert!(tracker.wants_falts());
        assert_eq!(manager.locations(urn(), AltLocKind::Push).unwrap().len(), 1);
    }

    #[test]
    fn node_info_sets_fwt_version() {
        let manager = manager();
        let mut tracker = AltLocTracker::new(urn());
        let value = format!("{};fwt/1;6346:5.5.5.5;1.1.1.1:1", Guid::random());

        tracker.handle_header(&manager, X_FW_NODE_INFO, &value).unwrap();

        assert_eq!(tracker.fwt_version(), 1);
        assert!(tracker.node_info().is_some());
    }

    #[test]
    fn headers() {
        let manager = manager();
        manager.add(direct(1), None).unwrap();
        manager.add(push(false), None).unwrap();

        let mut tracker = AltLocTracker::new(urn());
        tracker.set_features(Features {
            wants_falts: true,
            fwt_version: 0,
        });

        let headers = tracker.headers(&manager, Instant::now()).unwrap();

        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], (X_ALT, "1.1.1.1:6346".to_string()));
        assert_eq!(headers[1].0, X_FALT);
    }
}
