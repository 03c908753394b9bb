//! Bookkeeping of known and mounted volumes
//!
//! The registry is owned by the coordinator and only mutated under its lock.

use std::collections::HashMap;

use super::{VolumeDescriptor, VolumeState};

/// All volumes known for the current user plus the subset currently mounted.
///
/// Every entry in the mounted map has a known entry with the same id whose
/// state is `Mounted`.
#[derive(Debug, Clone, Default)]
pub struct VolumeRegistry {
    /// All user volumes in any state, in enumeration order.
    known: Vec<VolumeDescriptor>,
    /// Mounted volumes keyed by id.
    mounted: HashMap<String, VolumeDescriptor>,
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a freshly enumerated volume list.
    pub fn from_known(known: Vec<VolumeDescriptor>) -> Self {
        let mut registry = Self::new();
        registry.refresh(known);
        registry
    }

    /// Replace the known set and recompute the mounted map from it.
    pub fn refresh(&mut self, known: Vec<VolumeDescriptor>) {
        self.mounted = known
            .iter()
            .filter(|v| v.is_mounted())
            .map(|v| (v.id.clone(), v.clone()))
            .collect();
        self.known = known;
    }

    pub fn known(&self) -> &[VolumeDescriptor] {
        &self.known
    }

    pub fn find_known(&self, id: &str) -> Option<&VolumeDescriptor> {
        self.known.iter().find(|v| v.id == id)
    }

    pub fn mounted(&self, id: &str) -> Option<&VolumeDescriptor> {
        self.mounted.get(id)
    }

    pub fn is_mounted(&self, id: &str) -> bool {
        self.mounted.contains_key(id)
    }

    pub fn mounted_count(&self) -> usize {
        self.mounted.len()
    }

    /// Mounted volumes in the order they were enumerated.
    pub fn mounted_in_known_order(&self) -> Vec<VolumeDescriptor> {
        self.known
            .iter()
            .filter_map(|v| self.mounted.get(&v.id))
            .cloned()
            .collect()
    }

    /// Record that a volume is now mounted.
    ///
    /// The known entry is updated (or appended if the volume was never
    /// enumerated) so the mounted map stays a subset of the known set.
    pub fn insert_mounted(&mut self, descriptor: &VolumeDescriptor) -> VolumeDescriptor {
        let mut descriptor = descriptor.clone();
        descriptor.state = VolumeState::Mounted;
        match self.known.iter_mut().find(|v| v.id == descriptor.id) {
            Some(entry) => *entry = descriptor.clone(),
            None => self.known.push(descriptor.clone()),
        }
        self.mounted.insert(descriptor.id.clone(), descriptor.clone());
        descriptor
    }

    /// Record that a volume left the mounted state.
    ///
    /// Returns the descriptor removed from the mounted map, if it was there.
    pub fn mark_unmounted(&mut self, id: &str, new_state: VolumeState) -> Option<VolumeDescriptor> {
        if let Some(entry) = self.known.iter_mut().find(|v| v.id == id) {
            entry.state = new_state;
        }
        self.mounted.remove(id)
    }
}
