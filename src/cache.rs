//! Freshness cache - the most recent sample per guest
//!
//! Pure data structure; the [`Manager`](crate::actors::manager::Manager) wraps
//! it in a reader-writer lock and is the only writer.
//!
//! ## Update Rule
//!
//! A sample replaces the stored one only if its timestamp is strictly newer.
//! Replays, out-of-order points and ties leave the cache untouched, which makes
//! applying the same upstream window twice a no-op.

use std::collections::HashMap;

use crate::{EntityId, Sample};

#[derive(Debug, Clone, Default)]
pub struct FreshnessCache {
    entries: HashMap<EntityId, Sample>,
}

impl FreshnessCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the monotonic-timestamp rule
    ///
    /// Returns `true` when the sample was accepted.
    pub fn apply(&mut self, vmid: EntityId, sample: Sample) -> bool {
        match self.entries.get(&vmid) {
            Some(current) if current.time >= sample.time => false,
            _ => {
                self.entries.insert(vmid, sample);
                true
            }
        }
    }

    pub fn get(&self, vmid: EntityId) -> Option<&Sample> {
        self.entries.get(&vmid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of every entry, for the read surface
    pub fn snapshot(&self) -> HashMap<EntityId, Sample> {
        self.entries.clone()
    }
}

impl FromIterator<(EntityId, Sample)> for FreshnessCache {
    fn from_iter<I: IntoIterator<Item = (EntityId, Sample)>>(iter: I) -> Self {
        let mut cache = Self::new();
        for (vmid, sample) in iter {
            cache.apply(vmid, sample);
        }
        cache
    }
}
