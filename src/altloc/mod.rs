//! Gnutella alternate location mesh: which other hosts share a file, and
//! which of them to tell each peer about.

mod collection;
mod header;
mod location;
mod manager;
mod tracker;
mod urn;

pub use collection::*;
pub use header::*;
pub use location::*;
pub use manager::*;
pub use tracker::*;
pub use urn::*;

use serde::{Deserialize, Serialize};

/// Most locations kept per file and kind.
pub const MAX_LOCATIONS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// How eagerly locations are re-advertised on one [MeshType].
pub struct MeshSettings {
    /// When `false` a location can always be sent again.
    pub expire: bool,
    /// Scales how many times a location may be sent.
    pub bias: f32,
    /// The closer to 1, the more sends are allowed for a given send rate.
    pub damper: f32,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            expire: true,
            bias: 1.0,
            damper: std::f32::consts::E / 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AltLocSettings {
    pub legacy: MeshSettings,
    pub ping: MeshSettings,
    pub response: MeshSettings,
    /// Defaults to [MAX_LOCATIONS]
    pub max_locations: usize,
    /// Direct locations sent to a peer per HTTP exchange.
    ///
    /// Defaults to 10
    pub max_direct_per_exchange: usize,
    /// Firewalled locations sent to a peer per HTTP exchange.
    ///
    /// Defaults to 5
    pub max_push_per_exchange: usize,
}

impl AltLocSettings {
    pub fn mesh(&self, mesh: MeshType) -> &MeshSettings {
        match mesh {
            MeshType::Legacy => &self.legacy,
            MeshType::Ping => &self.ping,
            MeshType::Response => &self.response,
        }
    }
}

impl Default for AltLocSettings {
    fn default() -> Self {
        Self {
            legacy: MeshSettings::default(),
            ping: MeshSettings::default(),
            response: MeshSettings::default(),
            max_locations: MAX_LOCATIONS,
            max_direct_per_exchange: 10,
            max_push_per_exchange: 5,
        }
    }
}
