//! Per-container baseline store
//!
//! Holds the last raw sample seen for each container. All viewers of a
//! container share one entry under [`BaselinePolicy::Shared`]; a swap is a
//! single atomic operation on the entry's shard so two connections can never
//! interleave a read and a write of the same baseline.

use crate::models::RawSample;
use dashmap::DashMap;
use serde::Deserialize;

/// How stats connections for the same container share baselines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselinePolicy {
    /// One canonical baseline per container, shared by every viewer
    #[default]
    Shared,
    /// Each stats connection computes against its own baseline
    PerConnection,
}

#[derive(Debug, Default)]
pub struct BaselineStore {
    samples: DashMap<String, RawSample>,
}

impl BaselineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `sample` as the new baseline and return the one it replaced
    pub fn replace(&self, container_id: &str, sample: RawSample) -> Option<RawSample> {
        self.samples.insert(container_id.to_string(), sample)
    }

    pub fn contains(&self, container_id: &str) -> bool {
        self.samples.contains_key(container_id)
    }

    pub fn remove(&self, container_id: &str) -> Option<RawSample> {
        self.samples.remove(container_id).map(|(_, v)| v)
    }

    pub fn clear(&self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
