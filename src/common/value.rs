//! Values stored in the DHT and the keys they are looked up by.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::common::Kuid;

/// Kind of a stored value, part of its [EntityKey].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DhtValueType {
    /// Matches any value type in a lookup.
    Any,
    Binary,
    Text,
    /// Gnutella alternate location for a file.
    AltLoc,
    /// Gnutella push proxies of a firewalled node.
    PushProxies,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Identifies a value, or a set of values when `secondary_key` is `None`.
pub struct EntityKey {
    pub primary_key: Kuid,
    pub secondary_key: Option<Kuid>,
    pub value_type: DhtValueType,
}

impl EntityKey {
    /// Key matching every value stored under `primary_key`.
    pub fn lookup(primary_key: Kuid, value_type: DhtValueType) -> Self {
        EntityKey {
            primary_key,
            secondary_key: None,
            value_type,
        }
    }

    /// Returns `true` if the entity would be returned for this key.
    pub fn matches(&self, entity: &DhtValueEntity) -> bool {
        self.primary_key == entity.primary_key
            && self
                .secondary_key
                .map_or(true, |secondary| secondary == entity.secondary_key)
            && (self.value_type == DhtValueType::Any || self.value_type == entity.value_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A value with its primary key (where it lives in the DHT) and secondary key
/// (which creator it belongs to).
pub struct DhtValueEntity {
    pub primary_key: Kuid,
    pub secondary_key: Kuid,
    pub value_type: DhtValueType,
    pub value: Bytes,
}

impl DhtValueEntity {
    pub fn new(
        primary_key: Kuid,
        secondary_key: Kuid,
        value_type: DhtValueType,
        value: impl Into<Bytes>,
    ) -> Self {
        DhtValueEntity {
            primary_key,
            secondary_key,
            value_type,
            value: value.into(),
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey {
            primary_key: self.primary_key,
            secondary_key: Some(self.secondary_key),
            value_type: self.value_type,
        }
    }
}

/// Returns the primary key shared by all the entities, `None` if there are
/// no entities or they don't share one.
pub fn primary_key_of(entities: &[DhtValueEntity]) -> Option<Kuid> {
    let first = entities.first()?.primary_key;

    entities
        .iter()
        .all(|entity| entity.primary_key == first)
        .then_some(first)
}

/// Opaque token a remote node hands out with lookup responses and expects
/// back with store requests from the same address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecurityToken(pub Bytes);

impl SecurityToken {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}
