use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default request timeout before a remote node is considered unresponsive.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Dht Configurations
pub struct Config {
    pub kademlia: KademliaSettings,
    pub bootstrap: BootstrapSettings,
    pub lookup: LookupSettings,
    pub store: StoreSettings,
    pub executor: ExecutorSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KademliaSettings {
    /// Replication parameter, the size of a lookup's response path.
    ///
    /// Defaults to `20`
    pub k: usize,
    /// Number of parallel requests in a lookup.
    ///
    /// Defaults to `3`
    pub alpha: usize,
    /// Upper bound of a whole lookup, it completes with what it has so far
    /// once reached.
    ///
    /// Defaults to 60 seconds
    pub lookup_timeout: Duration,
    /// Expected per request timeout of the dispatcher.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
}

impl Default for KademliaSettings {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            lookup_timeout: Duration::from_secs(60),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSettings {
    /// Refreshing buckets stops handing out new buckets after this long.
    ///
    /// Defaults to 4 minutes
    pub bootstrap_timeout: Duration,
    /// Number of parallel bucket refresh workers.
    ///
    /// Defaults to `3`
    pub workers: usize,
    /// Failed lookups tolerated while refreshing buckets before the routing
    /// table is considered stale.
    ///
    /// Defaults to `20`
    pub max_bootstrap_failures: usize,
    /// Minimum ratio of alive contacts in the routing table for a bootstrap
    /// to succeed.
    ///
    /// Defaults to `0.5`
    pub is_bootstrapped_ratio: f32,
    /// Wait-on-lock hint of a bootstrap from a known contact.
    pub wait_on_lock_contact: Duration,
    /// Wait-on-lock hint of a bootstrap from a list of addresses.
    pub wait_on_lock_addresses: Duration,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            bootstrap_timeout: Duration::from_secs(4 * 60),
            workers: 3,
            max_bootstrap_failures: 20,
            is_bootstrapped_ratio: 0.5,
            wait_on_lock_contact: Duration::from_secs(5 * 60),
            wait_on_lock_addresses: Duration::from_secs(6 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupSettings {
    /// Use FIND_NODE rather than FIND_VALUE to fetch a security token.
    ///
    /// Defaults to `true`
    pub find_node_for_security_token: bool,
    /// Minimum ratio of usable contacts in a FIND_NODE response for it to
    /// count as a valid response.
    ///
    /// Defaults to `0.0`
    pub contacts_scrubber_required_ratio: f32,
    /// Count FIND_NODE responses without any contacts as valid.
    ///
    /// Defaults to `false`
    pub accept_empty_find_node_responses: bool,
}

impl Default for LookupSettings {
    fn default() -> Self {
        Self {
            find_node_for_security_token: true,
            contacts_scrubber_required_ratio: 0.0,
            accept_empty_find_node_responses: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Remote nodes only accept stores carrying their security token.
    ///
    /// Defaults to `true`
    pub store_requires_security_token: bool,
    /// Use FIND_NODE rather than FIND_VALUE to find the nodes to store at.
    ///
    /// Defaults to `true`
    pub find_node_for_store: bool,
    /// Wait-on-lock hint of a store.
    pub wait_on_lock: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            store_requires_security_token: true,
            find_node_for_store: true,
            wait_on_lock: Duration::from_secs(3 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Threads of a dedicated executor, ignored when the shared one is used.
    ///
    /// Defaults to [crate::concurrent::DEFAULT_POOL_SIZE]
    pub pool_size: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            pool_size: crate::concurrent::DEFAULT_POOL_SIZE,
        }
    }
}
