//! Session coordinator
//!
//! Owns the lifecycle of the singleton protocol server. Three kinds of caller
//! reach it, each possibly on its own thread and in no particular order:
//!
//! - the external run command (`start_session` / `stop_session`),
//! - the storage notification source (`on_volume_state_changed`),
//! - the server itself reporting that it terminated (`handle_event`).
//!
//! Every operation runs to completion under one mutex, including the calls it
//! forwards to the data view. Servers report termination through a channel
//! rather than by calling back in, so a server may notify from any context
//! without re-entering the lock.

mod state;

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::server::{
    DataViewSpec, DeviceIdentity, ServerError, ServerHandle, SessionEvent, SessionEvents,
    SessionFactory, TerminationNotifier, ViewError,
};
use crate::user::{UserContext, UserId, UserLookupError, UserResolver};
use crate::volume::{
    primary_volume, VolumeDescriptor, VolumeEvent, VolumeRegistry, VolumeSource,
    VolumeStateChange,
};

pub use state::{initial_storages, CoordinatorState};

/// Parameters carried by the external run command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParams {
    /// Whether the host may see storage contents.
    #[serde(default)]
    pub unlocked: bool,
    /// Restricted mode exposes only fixed subdirectories of the primary volume.
    #[serde(default)]
    pub restricted: bool,
    pub target_user: UserId,
}

/// Error types for a failed session start. State is left untouched.
#[derive(Error, Debug)]
pub enum StartError {
    #[error("No primary volume among {0} known volumes")]
    NoPrimaryVolume(usize),

    #[error("User lookup failed: {0}")]
    UserLookup(#[from] UserLookupError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// A storage update the data view refused. Never fatal to the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    #[error("Failed to add storage {id}: {source}")]
    Add {
        id: String,
        #[source]
        source: ViewError,
    },

    #[error("Failed to remove storage {id}: {source}")]
    Remove {
        id: String,
        #[source]
        source: ViewError,
    },
}

/// Result of a successful `start_session`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A new server was created and started.
    Started(Uuid),
    /// A session was already active; nothing was created.
    AlreadyActive(Uuid),
}

impl SessionOutcome {
    pub fn session_id(&self) -> Uuid {
        match self {
            SessionOutcome::Started(id) | SessionOutcome::AlreadyActive(id) => *id,
        }
    }
}

/// What a volume event did to the running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    /// The transition was irrelevant; nothing changed.
    Ignored,
    /// The registry was updated but the data view was not called.
    Recorded,
    /// `add_storage` was forwarded.
    Added,
    /// `remove_storage` was forwarded.
    Removed,
}

/// Snapshot of the active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub unlocked: bool,
    pub restricted: bool,
    pub target_user: UserId,
    pub primary_id: String,
}

/// Coordinates the singleton server with run commands and volume events.
pub struct Coordinator {
    config: CoordinatorConfig,
    factory: Arc<dyn SessionFactory>,
    users: Arc<dyn UserResolver>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    state: Mutex<CoordinatorState>,
}

impl Coordinator {
    /// Create a coordinator in the idle state.
    ///
    /// The returned receiver carries server termination events; pass it to
    /// [`Coordinator::spawn_event_loop`] or drain it with
    /// [`Coordinator::handle_event`].
    pub fn new(
        config: CoordinatorConfig,
        factory: Arc<dyn SessionFactory>,
        users: Arc<dyn UserResolver>,
    ) -> (Arc<Self>, SessionEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Self {
            config,
            factory,
            users,
            events_tx,
            state: Mutex::new(CoordinatorState::default()),
        });
        (coordinator, events_rx)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Handle an external run command: enumerate the user's volumes and
    /// start a session with them.
    pub fn on_start_command(
        &self,
        params: SessionParams,
        volumes: &dyn VolumeSource,
    ) -> Result<SessionOutcome, StartError> {
        let known = volumes.volumes_for_user(params.target_user);
        self.start_session(params, known)
    }

    /// Start a session unless one is already active.
    ///
    /// A start while active is a no-op success: the previous server is still
    /// draining and will terminate on its own. Every fallible step runs
    /// before any state is committed, so an error leaves the coordinator
    /// exactly as it was.
    pub fn start_session(
        &self,
        params: SessionParams,
        known_volumes: Vec<VolumeDescriptor>,
    ) -> Result<SessionOutcome, StartError> {
        let mut state = self.lock_state();

        if let Some(handle) = &state.handle {
            log::debug!(
                "Cannot launch second server; session {} still active",
                handle.session_id
            );
            return Ok(SessionOutcome::AlreadyActive(handle.session_id));
        }

        let registry = VolumeRegistry::from_known(known_volumes);
        let primary = primary_volume(registry.known())
            .cloned()
            .ok_or_else(|| StartError::NoPrimaryVolume(registry.known().len()))?;

        let user = self.users.resolve(params.target_user).map_err(|e| {
            log::error!("Couldn't find user {}: {}", params.target_user, e);
            e
        })?;
        let subdirs = if params.restricted {
            Some(self.prepare_restricted_dirs(&user))
        } else {
            None
        };

        log::info!(
            "Starting server in {} mode with storage {}{}",
            if params.restricted { "restricted" } else { "full" },
            primary.id,
            if params.unlocked { " unlocked" } else { "" }
        );

        let data_view = self.factory.create_data_view(&DataViewSpec {
            primary: primary.clone(),
            volume_name: self.config.volume_name.clone(),
            subdirs,
            user,
        })?;
        let session_id = Uuid::new_v4();
        let notifier = TerminationNotifier::new(session_id, self.events_tx.clone());
        let identity = DeviceIdentity {
            serial: Some(self.config.device.serial_or_placeholder().to_string()),
            ..self.config.device.clone()
        };
        let server = self.factory.create_server(
            Arc::clone(&data_view),
            params.restricted,
            notifier,
            &identity,
        )?;

        let handle = ServerHandle {
            session_id,
            server,
            data_view,
            params,
            primary_id: primary.id.clone(),
            started_at: Utc::now(),
        };
        handle.link();

        for volume in initial_storages(&registry, &primary, &params) {
            log::info!("Adding storage {}", volume.id);
            if let Err(e) = handle.data_view.add_storage(&volume) {
                log::warn!("Failed to add storage {} to new session: {}", volume.id, e);
            }
        }

        if let Err(e) = handle.server.start() {
            log::error!("Server for session {} failed to start: {}", session_id, e);
            handle.close();
            return Err(e.into());
        }

        state.registry = registry;
        state.unlocked = params.unlocked;
        state.restricted = params.restricted;
        state.handle = Some(handle);
        Ok(SessionOutcome::Started(session_id))
    }

    /// Create the restricted-mode public directories and return their names.
    ///
    /// Creation failures are logged; the directory name is still handed to
    /// the data view.
    fn prepare_restricted_dirs(&self, user: &UserContext) -> Vec<String> {
        self.config
            .restricted_subdirs
            .iter()
            .map(|name| {
                let path = user.public_dir(name);
                if let Err(e) = std::fs::create_dir_all(&path) {
                    log::warn!("Failed to create {}: {}", path.display(), e);
                }
                name.clone()
            })
            .collect()
    }

    /// Detach from the running server, if any.
    ///
    /// Does not stop the server's own thread; it only guarantees no further
    /// storage updates are routed to it. Returns whether a session was active.
    pub fn stop_session(&self) -> bool {
        let mut state = self.lock_state();
        match state.handle.take() {
            Some(handle) => {
                log::info!("Stopping session {}", handle.session_id);
                handle.close();
                true
            }
            None => false,
        }
    }

    /// Final teardown; equivalent to `stop_session`.
    pub fn shutdown(&self) {
        if self.stop_session() {
            log::info!("Coordinator shut down with an active session");
        }
    }

    /// The server reports that it can no longer serve.
    ///
    /// Racing with `stop_session` is legal: if no session is active this is
    /// logged and otherwise ignored.
    pub fn on_server_terminated(&self) {
        let mut state = self.lock_state();
        match state.handle.take() {
            Some(handle) => {
                log::info!("Server for session {} terminated", handle.session_id);
                handle.close();
            }
            None => log::error!("Server terminated but no session is active"),
        }
    }

    /// Apply an event from the coordinator's channel.
    ///
    /// Termination of a session that is no longer current is ignored so a
    /// late notification from an old server never tears down a newer one.
    pub fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::ServerTerminated { session_id } => {
                let mut state = self.lock_state();
                match &state.handle {
                    None => {
                        log::error!(
                            "Server for session {} terminated but no session is active",
                            session_id
                        );
                    }
                    Some(current) if current.session_id != session_id => {
                        log::warn!(
                            "Ignoring termination of stale session {} (current {})",
                            session_id,
                            current.session_id
                        );
                    }
                    Some(_) => {
                        if let Some(handle) = state.handle.take() {
                            log::info!("Server for session {} terminated", session_id);
                            handle.close();
                        }
                    }
                }
            }
        }
    }

    /// Drain termination events on a background task.
    ///
    /// The task holds only a weak reference and ends once the coordinator
    /// is dropped.
    pub fn spawn_event_loop(self: &Arc<Self>, events: SessionEvents) -> JoinHandle<()> {
        let coordinator = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.recv().await {
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                coordinator.handle_event(event);
            }
        })
    }

    /// Classify a raw volume transition and apply it.
    pub fn on_volume_state_changed(
        &self,
        change: &VolumeStateChange,
    ) -> Result<Forwarded, ForwardError> {
        let mut state = self.lock_state();
        match VolumeEvent::classify(&state.registry, change) {
            Some(event) => Self::apply_volume_event(&mut state, event),
            None => Ok(Forwarded::Ignored),
        }
    }

    /// Apply an already classified volume event.
    pub fn on_volume_changed(&self, event: VolumeEvent) -> Result<Forwarded, ForwardError> {
        let mut state = self.lock_state();
        Self::apply_volume_event(&mut state, event)
    }

    fn apply_volume_event(
        state: &mut CoordinatorState,
        event: VolumeEvent,
    ) -> Result<Forwarded, ForwardError> {
        match event {
            VolumeEvent::Available { id, descriptor } => {
                if descriptor.id != id {
                    log::warn!(
                        "Ignoring availability of {} carrying descriptor for {}",
                        id,
                        descriptor.id
                    );
                    return Ok(Forwarded::Ignored);
                }
                let descriptor = state.registry.insert_mounted(&descriptor);
                if !state.should_expose(&descriptor) {
                    return Ok(Forwarded::Recorded);
                }
                let Some(handle) = &state.handle else {
                    return Ok(Forwarded::Recorded);
                };
                log::info!("Adding storage {}", id);
                handle.data_view.add_storage(&descriptor).map_err(|source| {
                    log::warn!("Failed to add storage {}: {}", id, source);
                    ForwardError::Add {
                        id: id.clone(),
                        source,
                    }
                })?;
                Ok(Forwarded::Added)
            }
            VolumeEvent::Unavailable { id, state: new_state } => {
                let removed = state.registry.mark_unmounted(&id, new_state);
                let Some(handle) = &state.handle else {
                    return Ok(Forwarded::Recorded);
                };
                let Some(descriptor) =
                    removed.or_else(|| state.registry.find_known(&id).cloned())
                else {
                    return Ok(Forwarded::Recorded);
                };
                // Retracted regardless of lock state or mode.
                log::info!("Removing storage {}", id);
                handle.data_view.remove_storage(&descriptor).map_err(|source| {
                    log::warn!("Failed to remove storage {}: {}", id, source);
                    ForwardError::Remove {
                        id: id.clone(),
                        source,
                    }
                })?;
                Ok(Forwarded::Removed)
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock_state().is_active()
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        let state = self.lock_state();
        state.handle.as_ref().map(|handle| SessionInfo {
            session_id: handle.session_id,
            started_at: handle.started_at,
            unlocked: handle.params.unlocked,
            restricted: handle.params.restricted,
            target_user: handle.params.target_user,
            primary_id: handle.primary_id.clone(),
        })
    }

    /// Currently mounted volumes, in enumeration order.
    pub fn mounted_volumes(&self) -> Vec<VolumeDescriptor> {
        self.lock_state().registry.mounted_in_known_order()
    }

    /// All known volumes in any state.
    pub fn known_volumes(&self) -> Vec<VolumeDescriptor> {
        self.lock_state().registry.known().to_vec()
    }
}
