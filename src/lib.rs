// Mtphost - lifecycle coordinator for a singleton device-facing storage server

pub mod config;
pub mod coordinator;
pub mod server;
pub mod user;
pub mod volume;

pub use config::{ConfigError, CoordinatorConfig};
pub use coordinator::{
    Coordinator, ForwardError, Forwarded, SessionInfo, SessionOutcome, SessionParams, StartError,
};
pub use server::{
    DataView, DeviceIdentity, ProtocolServer, ServerError, SessionEvent, SessionFactory,
    TerminationNotifier, ViewError,
};
pub use user::{FsUserResolver, UserContext, UserId, UserLookupError, UserResolver};
pub use volume::{
    VolumeDescriptor, VolumeEvent, VolumeEventListener, VolumeRegistry, VolumeSource,
    VolumeState, VolumeStateChange,
};
