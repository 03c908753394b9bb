//! Volume state listener
//!
//! Normalizes raw `(old, new)` state transitions into availability events and
//! routes them into the coordinator. Notifications may arrive on any thread,
//! concurrently with session operations and with each other; all
//! classification happens under the coordinator lock.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::{VolumeDescriptor, VolumeRegistry, VolumeState};
use crate::coordinator::{Coordinator, ForwardError, Forwarded};

/// A raw state transition delivered by the storage notification source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStateChange {
    pub id: String,
    pub old_state: VolumeState,
    pub new_state: VolumeState,
}

impl VolumeStateChange {
    pub fn new(id: impl Into<String>, old_state: VolumeState, new_state: VolumeState) -> Self {
        Self {
            id: id.into(),
            old_state,
            new_state,
        }
    }
}

/// Logical volume event derived from a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeEvent {
    /// A known volume reached `Mounted`.
    Available {
        id: String,
        descriptor: VolumeDescriptor,
    },
    /// A tracked volume left `Mounted`; `state` is the state it moved to.
    Unavailable { id: String, state: VolumeState },
}

impl VolumeEvent {
    /// Classify a raw transition against the current registry.
    ///
    /// Returns `None` for transitions that concern neither a known volume
    /// becoming mounted nor a tracked volume leaving the mounted state.
    pub fn classify(registry: &VolumeRegistry, change: &VolumeStateChange) -> Option<Self> {
        if change.new_state.is_mounted() {
            let known = registry.find_known(&change.id)?;
            let mut descriptor = known.clone();
            descriptor.state = VolumeState::Mounted;
            return Some(VolumeEvent::Available {
                id: change.id.clone(),
                descriptor,
            });
        }
        if change.old_state.is_mounted() && registry.is_mounted(&change.id) {
            return Some(VolumeEvent::Unavailable {
                id: change.id.clone(),
                state: change.new_state,
            });
        }
        None
    }

    pub fn id(&self) -> &str {
        match self {
            VolumeEvent::Available { id, .. } | VolumeEvent::Unavailable { id, .. } => id,
        }
    }
}

/// Bridges a storage notification source to the coordinator.
pub struct VolumeEventListener {
    coordinator: Arc<Coordinator>,
    shutdown_tx: broadcast::Sender<()>,
}

impl VolumeEventListener {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            coordinator,
            shutdown_tx,
        }
    }

    /// Handle one notification inline on the caller's thread.
    pub fn on_volume_state_changed(
        &self,
        change: &VolumeStateChange,
    ) -> Result<Forwarded, ForwardError> {
        log::debug!(
            "Volume state changed {}: {} -> {}",
            change.id,
            change.old_state,
            change.new_state
        );
        self.coordinator.on_volume_state_changed(change)
    }

    /// Drain notifications from `rx` on a background task until the channel
    /// closes or `detach` is called.
    pub fn attach(&self, rx: mpsc::Receiver<VolumeStateChange>) -> JoinHandle<()> {
        let coordinator = Arc::clone(&self.coordinator);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut rx = rx;
            loop {
                tokio::select! {
                    change = rx.recv() => {
                        let Some(change) = change else { break };
                        if let Err(e) = coordinator.on_volume_state_changed(&change) {
                            log::warn!("Volume event for {} not applied to server: {}", change.id, e);
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            log::debug!("Volume listener detached");
        })
    }

    /// Stop every pump started with `attach`.
    pub fn detach(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
