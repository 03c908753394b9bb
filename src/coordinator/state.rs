//! Lock-guarded coordinator state and the storage eligibility policy

use super::SessionParams;
use crate::server::ServerHandle;
use crate::volume::{VolumeDescriptor, VolumeRegistry};

/// All mutable coordinator state. Guarded by a single mutex.
///
/// `handle` only ever moves `None -> Some` on a successful start and
/// `Some -> None` on teardown.
#[derive(Debug, Default)]
pub struct CoordinatorState {
    pub handle: Option<ServerHandle>,
    pub unlocked: bool,
    pub restricted: bool,
    pub registry: VolumeRegistry,
}

impl CoordinatorState {
    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    /// Whether a newly mounted volume should be exposed to the running session.
    pub fn should_expose(&self, volume: &VolumeDescriptor) -> bool {
        self.is_active() && self.unlocked && (volume.is_primary || !self.restricted)
    }
}

/// Volumes to seed a new session with.
///
/// A locked session starts empty. Otherwise the primary always comes first,
/// followed by every other mounted volume unless the session is restricted.
pub fn initial_storages(
    registry: &VolumeRegistry,
    primary: &VolumeDescriptor,
    params: &SessionParams,
) -> Vec<VolumeDescriptor> {
    if !params.unlocked {
        return Vec::new();
    }
    let mut storages = vec![primary.clone()];
    if !params.restricted {
        storages.extend(
            registry
                .mounted_in_known_order()
                .into_iter()
                .filter(|v| v.id != primary.id),
        );
    }
    storages
}
