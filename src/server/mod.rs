//! Protocol server and data-view contracts
//!
//! The coordinator never implements the device transport or the storage
//! database; it constructs them through a [`SessionFactory`], feeds volumes
//! into the [`DataView`], and tears the pair down again. The traits here are
//! the whole surface it relies on.

pub mod handle;
pub mod simulated;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::user::UserContext;
use crate::volume::VolumeDescriptor;

pub use handle::{ServerHandle, SessionEvent, SessionEvents, TerminationNotifier};

/// Serial reported when the device does not expose one.
pub const UNKNOWN_SERIAL: &str = "????????";

/// Error types for data-view storage updates
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ViewError {
    #[error("Storage already present: {0}")]
    AlreadyPresent(String),

    #[error("Storage not present: {0}")]
    NotPresent(String),

    #[error("Data view rejected storage {id}: {reason}")]
    Rejected { id: String, reason: String },
}

/// Error types for server construction and startup
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[error("Failed to create data view: {0}")]
    DataView(String),

    #[error("Failed to create server: {0}")]
    Create(String),

    #[error("Failed to start server: {0}")]
    Start(String),
}

/// Identity strings the server reports to the connected host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceIdentity {
    pub manufacturer: String,
    pub model: String,
    pub version: String,
    pub serial: Option<String>,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            manufacturer: "unknown".to_string(),
            model: "unknown".to_string(),
            version: "1.0".to_string(),
            serial: None,
        }
    }
}

impl DeviceIdentity {
    /// The serial to report, substituting a placeholder when it is unknown.
    pub fn serial_or_placeholder(&self) -> &str {
        match self.serial.as_deref() {
            None | Some("") | Some("unknown") => UNKNOWN_SERIAL,
            Some(serial) => serial,
        }
    }
}

/// Everything needed to construct a data view for a session.
#[derive(Debug, Clone)]
pub struct DataViewSpec {
    /// Volume whose namespace the view is rooted in.
    pub primary: VolumeDescriptor,
    /// Logical storage namespace name.
    pub volume_name: String,
    /// Directory names the view is limited to in restricted mode.
    pub subdirs: Option<Vec<String>>,
    pub user: UserContext,
}

/// The object the server consults to resolve storage contents.
pub trait DataView: Send + Sync {
    fn add_storage(&self, volume: &VolumeDescriptor) -> Result<(), ViewError>;

    fn remove_storage(&self, volume: &VolumeDescriptor) -> Result<(), ViewError>;

    /// Link this view to a server, or sever the link with `None`.
    ///
    /// Implementations must keep only a weak reference; the coordinator owns
    /// the server.
    fn set_server(&self, server: Option<&Arc<dyn ProtocolServer>>);
}

/// A device-facing protocol server instance.
pub trait ProtocolServer: Send + Sync {
    /// Begin serving. Must not block on the serving loop.
    fn start(&self) -> Result<(), ServerError>;

    /// Whether this server runs in restricted mode.
    fn is_restricted(&self) -> bool;
}

/// Constructs the collaborators for one session.
pub trait SessionFactory: Send + Sync {
    fn create_data_view(&self, spec: &DataViewSpec) -> Result<Arc<dyn DataView>, ServerError>;

    fn create_server(
        &self,
        data_view: Arc<dyn DataView>,
        restricted: bool,
        notifier: TerminationNotifier,
        identity: &DeviceIdentity,
    ) -> Result<Arc<dyn ProtocolServer>, ServerError>;
}
