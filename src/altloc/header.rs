//! Alternate location HTTP headers.
//!
//! Locations are comma separated, direct ones as `ip[:port]` and firewalled
//! ones as a [PushEndpoint]. A leading `tls=<hex>` token marks which of the
//! following direct locations accept TLS.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use tracing::trace;

use crate::altloc::location::{parse_feature_version, FWT_TOKEN};
use crate::altloc::{AlternateLocation, Location, PushEndpoint, Urn, MAX_LOCATIONS};
use crate::common::hex_value;
use crate::{Error, Result};

/// Locations known to be good.
pub const X_ALT: &str = "X-Alt";
/// Locations that failed.
pub const X_NALT: &str = "X-NAlt";
/// Firewalled locations known to be good.
pub const X_FALT: &str = "X-FAlt";
/// Firewalled locations that failed.
pub const X_NFALT: &str = "X-NFAlt";
/// The sender's own push endpoint, when firewalled.
pub const X_FW_NODE_INFO: &str = "X-FW-Node-Info";
pub const X_FEATURES: &str = "X-Features";

const TLS_TOKEN: &str = "tls=";
/// Feature token of a peer that wants firewalled locations.
pub const FWALT_FEATURE: &str = "fwalt/0.1";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Set of indices encoded as hex nibbles, index 0 being the highest bit of the
/// first nibble.
pub struct TlsIndices(Vec<u8>);

impl TlsIndices {
    pub fn from_flags(flags: impl IntoIterator<Item = bool>) -> Self {
        let mut indices = TlsIndices::default();
        for (index, flag) in flags.into_iter().enumerate() {
            if flag {
                indices.set(index);
            }
        }
        indices
    }

    pub fn set(&mut self, index: usize) {
        let nibble = index / 4;
        if self.0.len() <= nibble {
            self.0.resize(nibble + 1, 0);
        }
        self.0[nibble] |= 0x8 >> (index % 4);
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.0
            .get(index / 4)
            .is_some_and(|nibble| nibble & (0x8 >> (index % 4)) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|nibble| *nibble == 0)
    }
}

impl FromStr for TlsIndices {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidLocation(s.to_string()));
        }

        s.bytes()
            .map(|c| hex_value(c).ok_or_else(|| Error::InvalidLocation(s.to_string())))
            .collect::<Result<Vec<u8>>>()
            .map(TlsIndices)
    }
}

impl Display for TlsIndices {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let used = self
            .0
            .iter()
            .rposition(|nibble| *nibble != 0)
            .map_or(0, |last| last + 1);

        for nibble in &self.0[..used] {
            write!(f, "{nibble:x}")?;
        }
        Ok(())
    }
}

/// Parse the value of an alternate location header.
///
/// Bad tokens are skipped, tokens past the first [MAX_LOCATIONS] locations
/// are ignored. The `tls=` token is only honored as the first
/// token and when `allow_tls` is set; if it is malformed, no location in the
/// header is marked as TLS capable.
pub fn parse_alternate_locations(
    urn: &Urn,
    value: &str,
    allow_tls: bool,
) -> Vec<AlternateLocation> {
    let mut locations = vec![];
    let mut tls: Option<TlsIndices> = None;
    let mut index = 0;

    for (position, token) in value.split(',').map(str::trim).enumerate() {
        if token.is_empty() {
            continue;
        }

        if let Some(hex) = strip_prefix_ignore_case(token, TLS_TOKEN) {
            if position == 0 && allow_tls {
                tls = hex.parse().ok();
            }
            continue;
        }

        if index >= MAX_LOCATIONS {
            trace!(max = MAX_LOCATIONS, "Ignoring extra alternate locations");
            break;
        }

        let tls_capable = tls.as_ref().is_some_and(|tls| tls.is_set(index));
        index += 1;

        match AlternateLocation::parse(*urn, token, tls_capable) {
            Ok(location) => locations.push(location),
            Err(error) => trace!(?error, "Skipping alternate location"),
        }
    }

    locations
}

/// Encode locations as an alternate location header value, direct locations
/// first, preceded by a `tls=` token if any of them accepts TLS.
pub fn encode_alternate_locations<'a>(
    locations: impl IntoIterator<Item = &'a AlternateLocation>,
) -> String {
    let (direct, push): (Vec<_>, Vec<_>) = locations
        .into_iter()
        .partition(|location| matches!(location.location(), Location::Direct(_)));

    let tls = TlsIndices::from_flags(direct.iter().map(|location| match location.location() {
        Location::Direct(host) => host.is_tls_capable(),
        Location::Push(_) => false,
    }));

    let mut tokens = Vec::with_capacity(direct.len() + push.len() + 1);
    if !tls.is_empty() {
        tokens.push(format!("{TLS_TOKEN}{tls}"));
    }
    tokens.extend(direct.iter().chain(push.iter()).map(ToString::to_string));

    tokens.join(", ")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// What a peer declared in its `X-Features` header.
pub struct Features {
    /// The peer wants firewalled locations.
    pub wants_falts: bool,
    /// Firewall to firewall transfer version, 0 if unsupported.
    pub fwt_version: u8,
}

impl Features {
    /// Parse `name/version` tokens, ignoring the ones that aren't about
    /// alternate locations.
    pub fn parse(value: &str) -> Features {
        let mut features = Features::default();

        for token in value.split(',').map(str::trim) {
            if token.eq_ignore_ascii_case(FWALT_FEATURE) {
                features.wants_falts = true;
            } else if let Some(version) = strip_prefix_ignore_case(token, FWT_TOKEN) {
                if let Some(version) = parse_feature_version(version) {
                    features.fwt_version = version;
                }
            }
        }

        features
    }
}

impl Display for Features {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut tokens = vec![];
        if self.wants_falts {
            tokens.push(FWALT_FEATURE.to_string());
        }
        if self.fwt_version > 0 {
            tokens.push(format!("{FWT_TOKEN}{}.0", self.fwt_version));
        }

        write!(f, "{}", tokens.join(", "))
    }
}

/// Parse an `X-FW-Node-Info` value.
pub fn parse_node_info(value: &str) -> Result<PushEndpoint> {
    PushEndpoint::parse(value)
}

fn strip_prefix_ignore_case<'a>(token: &'a str, prefix: &str) -> Option<&'a str> {
    if token.len() >= prefix.len()
        && token.is_char_boundary(prefix.len())
        && token[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&token[prefix.len()..])
    } else {
        None
    }
}
