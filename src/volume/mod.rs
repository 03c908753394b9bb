//! Storage volumes as reported by the platform
//!
//! This module holds the volume descriptor and state vocabulary, the
//! registry of known and mounted volumes, and the listener that turns raw
//! state transitions into availability events.

pub mod listener;
pub mod registry;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use listener::{VolumeEvent, VolumeEventListener, VolumeStateChange};
pub use registry::VolumeRegistry;

use crate::user::UserId;

/// Error types for volume parsing
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VolumeError {
    #[error("Unknown volume state: {0}")]
    UnknownState(String),
}

/// State of a storage volume.
///
/// Only `Mounted` makes a volume eligible for export; a read-only mount
/// is reported separately and does not count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeState {
    Unknown,
    Removed,
    Unmounted,
    Checking,
    #[serde(rename = "nofs")]
    NoFs,
    Mounted,
    #[serde(rename = "mounted_ro")]
    MountedReadOnly,
    Shared,
    BadRemoval,
    Unmountable,
    Ejecting,
}

impl VolumeState {
    pub fn is_mounted(self) -> bool {
        self == VolumeState::Mounted
    }

    fn as_str(self) -> &'static str {
        match self {
            VolumeState::Unknown => "unknown",
            VolumeState::Removed => "removed",
            VolumeState::Unmounted => "unmounted",
            VolumeState::Checking => "checking",
            VolumeState::NoFs => "nofs",
            VolumeState::Mounted => "mounted",
            VolumeState::MountedReadOnly => "mounted_ro",
            VolumeState::Shared => "shared",
            VolumeState::BadRemoval => "bad_removal",
            VolumeState::Unmountable => "unmountable",
            VolumeState::Ejecting => "ejecting",
        }
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeState {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let state = match s {
            "unknown" => VolumeState::Unknown,
            "removed" => VolumeState::Removed,
            "unmounted" => VolumeState::Unmounted,
            "checking" => VolumeState::Checking,
            "nofs" => VolumeState::NoFs,
            "mounted" => VolumeState::Mounted,
            "mounted_ro" => VolumeState::MountedReadOnly,
            "shared" => VolumeState::Shared,
            "bad_removal" => VolumeState::BadRemoval,
            "unmountable" => VolumeState::Unmountable,
            "ejecting" => VolumeState::Ejecting,
            other => return Err(VolumeError::UnknownState(other.to_string())),
        };
        Ok(state)
    }
}

/// A storage volume visible to the target user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    /// Mount path; this is the volume's identity.
    pub id: String,
    /// Whether this is the user's default storage.
    pub is_primary: bool,
    /// Whether the media can be physically removed.
    #[serde(default)]
    pub removable: bool,
    /// Human-readable label.
    #[serde(default)]
    pub description: String,
    /// State at the time the descriptor was produced.
    pub state: VolumeState,
}

impl VolumeDescriptor {
    /// Create a descriptor with an empty description.
    pub fn new(id: impl Into<String>, is_primary: bool, state: VolumeState) -> Self {
        Self {
            id: id.into(),
            is_primary,
            removable: !is_primary,
            description: String::new(),
            state,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.state.is_mounted()
    }
}

/// Pick the primary volume out of a volume list.
pub fn primary_volume(volumes: &[VolumeDescriptor]) -> Option<&VolumeDescriptor> {
    volumes.iter().find(|v| v.is_primary)
}

/// Enumerates the volumes visible to a user, in any state.
pub trait VolumeSource: Send + Sync {
    fn volumes_for_user(&self, user: UserId) -> Vec<VolumeDescriptor>;
}

impl<F> VolumeSource for F
where
    F: Fn(UserId) -> Vec<VolumeDescriptor> + Send + Sync,
{
    fn volumes_for_user(&self, user: UserId) -> Vec<VolumeDescriptor> {
        self(user)
    }
}
