//! Bounded, sorted set of the alternate locations of one file.

use std::time::Instant;

use crate::altloc::{AltLocSettings, AlternateLocation, MeshType, Urn, MAX_LOCATIONS};
use crate::{Error, Result};

#[derive(Debug, Clone)]
/// Locations of the file `urn`, least reported first and demoted ones last,
/// so the locations spread the least get advertised first.
pub struct AlternateLocationCollection {
    urn: Urn,
    capacity: usize,
    locations: Vec<AlternateLocation>,
}

impl AlternateLocationCollection {
    pub fn new(urn: Urn) -> Self {
        Self::with_capacity(urn, MAX_LOCATIONS)
    }

    /// Holds at most `capacity` locations, evicting the last in order.
    pub fn with_capacity(urn: Urn, capacity: usize) -> Self {
        AlternateLocationCollection {
            urn,
            capacity,
            locations: Vec::with_capacity(capacity.min(MAX_LOCATIONS)),
        }
    }

    // === Getters ===

    pub fn urn(&self) -> &Urn {
        &self.urn
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn contains(&self, location: &AlternateLocation) -> bool {
        self.position(location).is_some()
    }

    pub fn get(&self, location: &AlternateLocation) -> Option<&AlternateLocation> {
        self.position(location).map(|index| &self.locations[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlternateLocation> {
        self.locations.iter()
    }

    // === Public Methods ===

    /// Adds a new location, or counts one more report of a known one.
    ///
    /// A known location is also promoted and may be advertised again right
    /// away. Returns `true` if the location was new.
    pub fn add(&mut self, location: AlternateLocation) -> Result<bool> {
        if location.urn() != &self.urn {
            return Err(Error::InvalidUrn(location.urn().to_string()));
        }

        match self.position(&location) {
            Some(index) => {
                let mut existing = self.locations.remove(index);

                existing.increment();
                existing.promote();
                existing.reset_sent();

                self.insert(existing);
                Ok(false)
            }
            None => {
                self.insert(location);
                Ok(true)
            }
        }
    }

    /// Demotes a location, or drops it if it was already demoted.
    ///
    /// Returns `true` only if the location was dropped.
    pub fn remove(&mut self, location: &AlternateLocation) -> bool {
        let Some(index) = self.position(location) else {
            return false;
        };

        let mut existing = self.locations.remove(index);
        if existing.is_demoted() {
            return true;
        }

        existing.demote();
        self.insert(existing);

        false
    }

    pub fn clear(&mut self) {
        self.locations.clear();
    }

    /// Up to `max` locations that may be advertised on `mesh`, in order,
    /// skipping the ones `skip` returns `true` for. The returned locations
    /// are recorded as sent at `now`.
    pub fn send(
        &mut self,
        now: Instant,
        mesh: MeshType,
        max: usize,
        settings: &AltLocSettings,
        mut skip: impl FnMut(&AlternateLocation) -> bool,
    ) -> Vec<AlternateLocation> {
        let mut sent = Vec::with_capacity(max.min(self.locations.len()));

        for location in self.locations.iter_mut() {
            if sent.len() >= max {
                break;
            }
            if skip(location) || !location.can_be_sent(mesh, settings) {
                continue;
            }

            location.send(now, mesh);
            sent.push(location.clone());
        }

        sent
    }

    /// The locations as a comma separated header value.
    pub fn http_string(&self) -> String {
        self.locations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }

    // === Private Methods ===

    fn position(&self, location: &AlternateLocation) -> Option<usize> {
        if location.urn() != &self.urn {
            return None;
        }

        let id = location.id();
        self.locations.iter().position(|existing| existing.id() == id)
    }

    fn insert(&mut self, location: AlternateLocation) {
        let key = location.sort_key();
        let index = self
            .locations
            .partition_point(|existing| existing.sort_key() < key);

        self.locations.insert(index, location);
        self.locations.truncate(self.capacity);
    }
}

impl<'a> IntoIterator for &'a AlternateLocationCollection {
    type Item = &'a AlternateLocation;
    type IntoIter = std::slice::Iter<'a, AlternateLocation>;

    fn into_iter(self) -> Self::IntoIter {
        self.locations.iter()
    }
}
