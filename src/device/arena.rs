//! Live resource bookkeeping for leak reporting.
//!
//! Every allocation made through a device is registered here and removed on
//! destruction. Whatever remains at shutdown is a leak; [`ResourceArena::dump_live`]
//! reports it.

use std::collections::BTreeMap;
use std::fmt;

/// Arena slot id. Never reused within one arena.
pub type ResourceId = u64;

/// Closed set of resource variants tracked by the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    DeviceBuffer,
    StagingBuffer,
    AccelerationStructure,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::DeviceBuffer => "Device Buffer",
            ResourceKind::StagingBuffer => "Staging Buffer",
            ResourceKind::AccelerationStructure => "Acceleration Structure",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    pub kind: ResourceKind,
    pub name: String,
    pub size: u64,
}

#[derive(Debug)]
pub struct ResourceArena {
    next_id: ResourceId,
    live: BTreeMap<ResourceId, ResourceEntry>,
}

impl Default for ResourceArena {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceArena {
    pub fn new() -> Self {
        // 0 is left unused so a zeroed handle never names a live resource
        Self { next_id: 1, live: BTreeMap::new() }
    }

    pub fn insert(&mut self, kind: ResourceKind, name: impl Into<String>, size: u64) -> ResourceId {
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id, ResourceEntry { kind, name: name.into(), size });
        id
    }

    pub fn remove(&mut self, id: ResourceId) -> Option<ResourceEntry> {
        self.live.remove(&id)
    }

    pub fn get(&self, id: ResourceId) -> Option<&ResourceEntry> {
        self.live.get(&id)
    }

    pub fn exists(&self, id: ResourceId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn rename(&mut self, id: ResourceId, name: impl Into<String>) -> bool {
        match self.live.get_mut(&id) {
            Some(entry) => {
                entry.name = name.into();
                true
            }
            None => false,
        }
    }

    pub fn live(&self) -> impl Iterator<Item = (ResourceId, &ResourceEntry)> {
        self.live.iter().map(|(id, entry)| (*id, entry))
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn live_count_of(&self, kind: ResourceKind) -> usize {
        self.live.values().filter(|e| e.kind == kind).count()
    }

    /// One line per live resource, also emitted as warnings.
    pub fn dump_live(&self) -> Vec<String> {
        let lines: Vec<String> = self
            .live
            .iter()
            .map(|(id, e)| format!("#{id} {} \"{}\" ({} bytes)", e.kind, e.name, e.size))
            .collect();
        for line in &lines {
            tracing::warn!("live resource: {line}");
        }
        lines
    }
}
