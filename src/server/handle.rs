//! The running server/data-view pair and its termination channel

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{DataView, ProtocolServer};
use crate::coordinator::SessionParams;

/// Events sent to the coordinator from outside its lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The server for `session_id` can no longer serve and has shut down.
    ServerTerminated { session_id: Uuid },
}

/// Receiving side of the coordinator's event channel.
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Handed to each server at construction; the server's only way to report
/// that it terminated on its own.
///
/// Notifying never touches coordinator state directly, so it is safe to
/// call from any thread, including from inside a data-view callback.
#[derive(Debug, Clone)]
pub struct TerminationNotifier {
    session_id: Uuid,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl TerminationNotifier {
    pub(crate) fn new(session_id: Uuid, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { session_id, tx }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn notify(&self) {
        let event = SessionEvent::ServerTerminated {
            session_id: self.session_id,
        };
        if self.tx.send(event).is_err() {
            log::warn!(
                "Termination of session {} dropped: coordinator is gone",
                self.session_id
            );
        }
    }
}

/// One running protocol server paired with its data view.
///
/// Its presence in the coordinator is what makes a session active.
pub struct ServerHandle {
    pub session_id: Uuid,
    pub server: Arc<dyn ProtocolServer>,
    pub data_view: Arc<dyn DataView>,
    pub params: SessionParams,
    pub primary_id: String,
    pub started_at: DateTime<Utc>,
}

impl ServerHandle {
    /// Link the data view back to the server.
    pub fn link(&self) {
        self.data_view.set_server(Some(&self.server));
    }

    /// Sever the data view's link to the server.
    pub fn close(self) {
        log::debug!("Detaching data view from session {}", self.session_id);
        self.data_view.set_server(None);
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("session_id", &self.session_id)
            .field("params", &self.params)
            .field("primary_id", &self.primary_id)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}
