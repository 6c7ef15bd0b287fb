//! Alternate locations: other hosts known to share a file.

use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::{Hash, Hasher},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    str::FromStr,
    time::Instant,
};

use crate::altloc::{AltLocSettings, MeshSettings, TlsIndices, Urn};
use crate::common::hex_value;
use crate::{Error, Result};

/// Port assumed for a direct location written without one.
pub const DEFAULT_PORT: u16 = 6346;
/// Most push proxies kept for a [PushEndpoint].
pub const MAX_PROXIES: usize = 4;

const GUID_SIZE: usize = 16;
pub(crate) const FWT_TOKEN: &str = "fwt/";
pub(crate) const PPTLS_TOKEN: &str = "pptls=";

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Client GUID of a Gnutella servent.
pub struct Guid(pub [u8; GUID_SIZE]);

impl Guid {
    pub fn random() -> Guid {
        Guid(rand::random())
    }
}

impl FromStr for Guid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Guid> {
        let invalid = || Error::InvalidLocation(s.to_string());

        if s.len() != GUID_SIZE * 2 {
            return Err(invalid());
        }

        let mut bytes = [0_u8; GUID_SIZE];
        for (i, pair) in s.as_bytes().chunks(2).enumerate() {
            match (hex_value(pair[0]), hex_value(pair[1])) {
                (Some(high), Some(low)) => bytes[i] = (high << 4) | low,
                _ => return Err(invalid()),
            }
        }

        Ok(Guid(bytes))
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl Debug for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({self})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// A reachable host, and whether it accepts TLS connections.
pub struct Host {
    address: SocketAddr,
    tls: bool,
}

impl Host {
    pub fn new(address: SocketAddr) -> Self {
        Host {
            address,
            tls: false,
        }
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_tls_capable(&self) -> bool {
        self.tls
    }

    /// Parses `ip[:port]`, the port defaults to [DEFAULT_PORT].
    pub fn parse(location: &str, tls: bool) -> Result<Host> {
        let invalid = || Error::InvalidLocation(location.to_string());

        let location = location.trim();
        let (ip, port) = match location.split_once(':') {
            Some((ip, port)) => (ip, port.parse::<u16>().map_err(|_| invalid())?),
            None => (location, DEFAULT_PORT),
        };

        let ip = ip.parse::<Ipv4Addr>().map_err(|_| invalid())?;
        if !is_valid_address(&ip) || port == 0 {
            return Err(invalid());
        }

        Ok(Host::new(SocketAddrV4::new(ip, port).into()).with_tls(tls))
    }

    /// Parses `port:ip`, the external address form used for firewall to
    /// firewall transfers.
    fn parse_port_ip(token: &str) -> Option<SocketAddr> {
        let (port, ip) = token.trim().split_once(':')?;
        let port = port.parse::<u16>().ok()?;
        let ip = ip.parse::<Ipv4Addr>().ok()?;

        (port != 0 && is_valid_address(&ip)).then(|| SocketAddrV4::new(ip, port).into())
    }
}

impl Display for Host {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.address {
            SocketAddr::V4(address) => write!(f, "{}:{}", address.ip(), address.port()),
            SocketAddr::V6(address) => write!(f, "[{}]:{}", address.ip(), address.port()),
        }
    }
}

fn is_valid_address(ip: &Ipv4Addr) -> bool {
    let first = ip.octets()[0];
    first != 0 && first != 255
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// A firewalled host, reachable through its push proxies.
pub struct PushEndpoint {
    guid: Guid,
    proxies: Vec<Host>,
    fwt_version: u8,
    external: Option<SocketAddr>,
}

impl PushEndpoint {
    pub fn new(guid: Guid, proxies: Vec<Host>) -> Self {
        let mut endpoint = PushEndpoint {
            guid,
            proxies: Vec::with_capacity(proxies.len().min(MAX_PROXIES)),
            fwt_version: 0,
            external: None,
        };

        for proxy in proxies {
            endpoint.add_proxy(proxy);
        }

        endpoint
    }

    /// Firewall to firewall transfers need the endpoint's external address.
    pub fn with_fwt(mut self, version: u8, external: SocketAddr) -> Self {
        self.fwt_version = version;
        self.external = Some(external);
        self
    }

    pub fn guid(&self) -> &Guid {
        &self.guid
    }

    pub fn proxies(&self) -> &[Host] {
        &self.proxies
    }

    /// 0 if the endpoint doesn't support firewall to firewall transfers.
    pub fn fwt_version(&self) -> u8 {
        self.fwt_version
    }

    pub fn external_address(&self) -> Option<SocketAddr> {
        self.external
    }

    fn add_proxy(&mut self, proxy: Host) {
        if self.proxies.len() < MAX_PROXIES && !self.proxies.contains(&proxy) {
            self.proxies.push(proxy);
        }
    }

    /// Parses `guid[;fwt/<version>;port:ip][;pptls=<hex>];ip:port;ip:port...`.
    ///
    /// Unparseable proxies are skipped, and stop marking later proxies as TLS
    /// capable since their index may be off. A malformed `pptls=` or `fwt/`
    /// token fails the whole endpoint.
    pub fn parse(value: &str) -> Result<PushEndpoint> {
        let invalid = || Error::InvalidLocation(value.to_string());

        let mut tokens = value.trim().split(';');
        let guid = tokens
            .next()
            .ok_or_else(invalid)?
            .trim()
            .parse::<Guid>()
            .map_err(|_| invalid())?;

        let mut endpoint = PushEndpoint::new(guid, vec![]);
        let mut fwt_version = 0;
        let mut external = None;
        let mut tls: Option<TlsIndices> = None;

        for token in tokens.map(str::trim).filter(|token| !token.is_empty()) {
            if let Some(version) = token.strip_prefix(FWT_TOKEN) {
                fwt_version = parse_feature_version(version).ok_or_else(invalid)?;
                continue;
            }

            if let Some(hex) = token.strip_prefix(PPTLS_TOKEN) {
                if endpoint.proxies.is_empty() {
                    tls = Some(hex.parse::<TlsIndices>().map_err(|_| invalid())?);
                }
                continue;
            }

            if external.is_none() {
                if let Some(address) = Host::parse_port_ip(token) {
                    external = Some(address);
                    continue;
                }
            }

            let index = endpoint.proxies.len();
            let tls_capable = tls.as_ref().is_some_and(|tls| tls.is_set(index));
            match Host::parse(token, tls_capable) {
                Ok(proxy) => endpoint.add_proxy(proxy),
                Err(_) => tls = None,
            }
        }

        if let (Some(external), true) = (external, fwt_version > 0) {
            endpoint = endpoint.with_fwt(fwt_version, external);
        }

        Ok(endpoint)
    }
}

impl Display for PushEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.guid)?;

        if let (Some(SocketAddr::V4(external)), true) = (self.external, self.fwt_version > 0) {
            write!(
                f,
                ";{FWT_TOKEN}{}.0;{}:{}",
                self.fwt_version,
                external.port(),
                external.ip()
            )?;
        }

        let tls = TlsIndices::from_flags(self.proxies.iter().map(Host::is_tls_capable));
        if !tls.is_empty() {
            write!(f, ";{PPTLS_TOKEN}{tls}")?;
        }

        for proxy in &self.proxies {
            write!(f, ";{proxy}")?;
        }

        Ok(())
    }
}

/// Major version of a feature token value, `1` for both `1` and `1.0`.
pub(crate) fn parse_feature_version(version: &str) -> Option<u8> {
    version.trim().split('.').next()?.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Channel a location is advertised through.
pub enum MeshType {
    /// `X-Alt` style HTTP headers.
    Legacy,
    /// Head pings and pongs.
    Ping,
    /// Query responses.
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    Direct(Host),
    Push(PushEndpoint),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// What makes two locations of the same file the same location.
pub enum LocationId {
    Direct(SocketAddr),
    Push(Guid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Which collection of a file a location belongs to.
pub enum AltLocKind {
    Direct,
    /// Firewalled, without firewall to firewall transfer support.
    Push,
    /// Firewalled, supporting firewall to firewall transfers.
    Fwt,
}

#[derive(Debug, Clone)]
/// A known source of the file identified by `urn`.
pub struct AlternateLocation {
    urn: Urn,
    location: Location,
    count: u32,
    demoted: bool,
    legacy: SendAverage,
    ping: SendAverage,
    response: SendAverage,
}

impl AlternateLocation {
    pub fn new(urn: Urn, location: Location) -> Self {
        AlternateLocation {
            urn,
            location,
            count: 0,
            demoted: false,
            legacy: SendAverage::default(),
            ping: SendAverage::default(),
            response: SendAverage::default(),
        }
    }

    pub fn direct(urn: Urn, host: Host) -> Self {
        Self::new(urn, Location::Direct(host))
    }

    pub fn push(urn: Urn, endpoint: PushEndpoint) -> Self {
        Self::new(urn, Location::Push(endpoint))
    }

    /// A direct location for `ip[:port]`, or a push location when the string
    /// contains a `;`.
    pub fn parse(urn: Urn, location: &str, tls: bool) -> Result<Self> {
        let location = location.trim();
        if location.is_empty() {
            return Err(Error::InvalidLocation(location.to_string()));
        }

        if location.contains(';') {
            Ok(Self::push(urn, PushEndpoint::parse(location)?))
        } else {
            Ok(Self::direct(urn, Host::parse(location, tls)?))
        }
    }

    // === Getters ===

    pub fn urn(&self) -> &Urn {
        &self.urn
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn id(&self) -> LocationId {
        match &self.location {
            Location::Direct(host) => LocationId::Direct(host.address()),
            Location::Push(endpoint) => LocationId::Push(*endpoint.guid()),
        }
    }

    pub fn kind(&self) -> AltLocKind {
        match &self.location {
            Location::Direct(_) => AltLocKind::Direct,
            Location::Push(endpoint) if endpoint.fwt_version() < 1 => AltLocKind::Push,
            Location::Push(_) => AltLocKind::Fwt,
        }
    }

    /// How many more times the location was reported after it was first
    /// added.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// A push location is also demoted once it has no proxies left.
    pub fn is_demoted(&self) -> bool {
        match &self.location {
            Location::Direct(_) => self.demoted,
            Location::Push(endpoint) => self.demoted || endpoint.proxies().is_empty(),
        }
    }

    /// Returns `true` if the location may be advertised again on `mesh`.
    pub fn can_be_sent(&self, mesh: MeshType, settings: &AltLocSettings) -> bool {
        let settings = settings.mesh(mesh);
        if !settings.expire {
            return true;
        }

        self.average(mesh).can_be_sent(settings)
    }

    pub fn can_be_sent_any(&self, settings: &AltLocSettings) -> bool {
        [MeshType::Legacy, MeshType::Ping, MeshType::Response]
            .into_iter()
            .any(|mesh| self.can_be_sent(mesh, settings))
    }

    /// Record that the location was advertised on `mesh` at `now`.
    pub fn send(&mut self, now: Instant, mesh: MeshType) {
        match mesh {
            MeshType::Legacy => self.legacy.send(now),
            MeshType::Ping => self.ping.send(now),
            MeshType::Response => self.response.send(now),
        }
    }

    // === Private Methods ===

    fn average(&self, mesh: MeshType) -> &SendAverage {
        match mesh {
            MeshType::Legacy => &self.legacy,
            MeshType::Ping => &self.ping,
            MeshType::Response => &self.response,
        }
    }

    pub(crate) fn increment(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    pub(crate) fn promote(&mut self) {
        self.demoted = false;
    }

    pub(crate) fn demote(&mut self) {
        self.demoted = true;
    }

    pub(crate) fn reset_sent(&mut self) {
        self.legacy = SendAverage::default();
        self.ping = SendAverage::default();
        self.response = SendAverage::default();
    }

    /// Collection order: demoted last, then by ascending count.
    pub(crate) fn sort_key(&self) -> (bool, u32, LocationId) {
        (self.is_demoted(), self.count, self.id())
    }
}

impl PartialEq for AlternateLocation {
    fn eq(&self, other: &Self) -> bool {
        self.urn == other.urn && self.id() == other.id()
    }
}

impl Eq for AlternateLocation {}

impl Hash for AlternateLocation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.urn.hash(state);
        self.id().hash(state);
    }
}

impl Display for AlternateLocation {
    /// The form written in alternate location headers.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.location {
            Location::Direct(host) => write!(f, "{host}"),
            Location::Push(endpoint) => write!(f, "{endpoint}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// Rolling average of the interval between sends on one mesh.
struct SendAverage {
    times: u32,
    /// Milliseconds.
    average: f64,
    last_sent: Option<Instant>,
}

impl SendAverage {
    fn send(&mut self, now: Instant) {
        let interval = self
            .last_sent
            .map_or(0.0, |last| now.saturating_duration_since(last).as_millis() as f64);

        self.average = (self.average * self.times as f64 + interval) / (self.times + 1) as f64;
        self.times += 1;
        self.last_sent = Some(now);
    }

    /// The faster a location is being sent, the fewer times it may be sent.
    fn can_be_sent(&self, settings: &MeshSettings) -> bool {
        if self.times < 2 || self.average == 0.0 {
            return true;
        }

        let threshold = (self.average.ln() / (settings.damper as f64).ln()).abs();

        (self.times as f64) < threshold * settings.bias as f64
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    fn urn() -> Urn {
        Urn::from_content(b"file")
    }

    #[test]
    fn parse_direct() {
        let location = AlternateLocation::parse(urn(), "1.2.3.4:6347", true).unwrap();

        match location.location() {
            Location::Direct(host) => {
                assert_eq!(host.address(), "1.2.3.4:6347".parse().unwrap());
                assert!(host.is_tls_capable());
            }
            _ => panic!("expected a direct location"),
        }
        assert_eq!(location.kind(), AltLocKind::Direct);
        assert_eq!(location.to_string(), "1.2.3.4:6347");
    }

    #[test]
    fn direct_default_port() {
        let host = Host::parse("10.0.0.1", false).unwrap();

        assert_eq!(host.address().port(), DEFAULT_PORT);
    }

    #[test]
    fn reject_invalid_direct() {
        for invalid in [
            "",
            "example.com",
            "1.2.3.4:",
            "1.2.3.4:0",
            "1.2.3.4:70000",
            "1.2.3.4/24",
            "0.0.0.0:6346",
            "255.255.255.255",
        ] {
            assert!(AlternateLocation::parse(urn(), invalid, false).is_err(), "{invalid}");
        }
    }

    #[test]
    fn parse_push() {
        let guid = Guid::random();
        let value = format!("{guid};pptls=4;1.1.1.1:1;2.2.2.2:2;bogus;3.3.3.3:3");

        let location = AlternateLocation::parse(urn(), &value, false).unwrap();
        let Location::Push(endpoint) = location.location() else {
            panic!("expected a push location");
        };

        assert_eq!(endpoint.guid(), &guid);
        assert_eq!(endpoint.proxies().len(), 3);
        assert!(!endpoint.proxies()[0].is_tls_capable());
        assert!(endpoint.proxies()[1].is_tls_capable());
        // tls indices are dropped after an unparseable proxy
        assert!(!endpoint.proxies()[2].is_tls_capable());
        assert_eq!(location.kind(), AltLocKind::Push);
        assert!(!location.is_demoted());
    }

    #[test]
    fn push_with_fwt() {
        let guid = Guid::random();
        let value = format!("{guid};fwt/1.0;6348:5.5.5.5;1.1.1.1:1");

        let endpoint = PushEndpoint::parse(&value).unwrap();

        assert_eq!(endpoint.fwt_version(), 1);
        assert_eq!(
            endpoint.external_address(),
            Some("5.5.5.5:6348".parse().unwrap())
        );
        assert_eq!(endpoint.proxies().len(), 1);
        assert_eq!(endpoint.to_string(), value);

        let location = AlternateLocation::push(urn(), endpoint);
        assert_eq!(location.kind(), AltLocKind::Fwt);
    }

    #[test]
    fn fwt_without_external_address() {
        let value = format!("{};fwt/1;1.1.1.1:1", Guid::random());

        let endpoint = PushEndpoint::parse(&value).unwrap();

        assert_eq!(endpoint.fwt_version(), 0);
        assert_eq!(endpoint.external_address(), None);
    }

    #[test]
    fn push_without_proxies_is_demoted() {
        let location = AlternateLocation::push(urn(), PushEndpoint::new(Guid::random(), vec![]));

        assert!(location.is_demoted());
    }

    #[test]
    fn proxies_are_capped() {
        let proxies = (1..=6)
            .map(|i| Host::parse(&format!("1.1.1.{i}:1"), false).unwrap())
            .collect();

        let endpoint = PushEndpoint::new(Guid::random(), proxies);

        assert_eq!(endpoint.proxies().len(), MAX_PROXIES);
    }

    #[test]
    fn equality_ignores_state() {
        let host = Host::parse("1.2.3.4", false).unwrap();
        let mut a = AlternateLocation::direct(urn(), host);
        let b = AlternateLocation::direct(urn(), host.with_tls(true));

        a.increment();
        a.demote();

        assert_eq!(a, b);
        assert_ne!(a, AlternateLocation::direct(Urn::from_content(b"other"), host));
    }

    #[test]
    fn sending_fast_expires() {
        let settings = AltLocSettings::default();
        let mut location =
            AlternateLocation::direct(urn(), Host::parse("1.2.3.4", false).unwrap());

        let start = Instant::now();
        let mut sent = 0;
        while location.can_be_sent(MeshType::Legacy, &settings) && sent < 1000 {
            location.send(start + Duration::from_millis(10 * sent), MeshType::Legacy);
            sent += 1;
        }

        assert!(sent >= 2);
        assert!(sent < 1000);
        assert!(location.can_be_sent(MeshType::Ping, &settings));

        location.reset_sent();
        assert!(location.can_be_sent(MeshType::Legacy, &settings));
    }

    #[test]
    fn no_expiration() {
        let mut settings = AltLocSettings::default();
        settings.legacy.expire = false;

        let mut location =
            AlternateLocation::direct(urn(), Host::parse("1.2.3.4", false).unwrap());

        let start = Instant::now();
        for i in 0..100 {
            location.send(start + Duration::from_millis(i), MeshType::Legacy);
        }

        assert!(location.can_be_sent(MeshType::Legacy, &settings));
    }
}
