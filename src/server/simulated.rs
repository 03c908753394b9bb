//! In-process server simulator
//!
//! Provides a data view that records every storage update, a server whose
//! serving loop runs on its own thread until the simulated transport is
//! disconnected, and a factory tying them together. Used for testing and by
//! the simulator binary, without a real device transport.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;

use uuid::Uuid;

use super::{
    DataView, DataViewSpec, DeviceIdentity, ProtocolServer, ServerError, SessionFactory,
    TerminationNotifier, ViewError,
};
use crate::volume::VolumeDescriptor;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A call observed by a [`SimDataView`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewCall {
    Added(String),
    Removed(String),
    Linked,
    Unlinked,
}

/// A data view that keeps its storages in memory and logs every call.
pub struct SimDataView {
    spec: DataViewSpec,
    storages: Mutex<Vec<String>>,
    calls: Mutex<Vec<ViewCall>>,
    server: Mutex<Option<Weak<dyn ProtocolServer>>>,
    reject_updates: AtomicBool,
}

impl SimDataView {
    pub fn new(spec: DataViewSpec) -> Self {
        Self {
            spec,
            storages: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            server: Mutex::new(None),
            reject_updates: AtomicBool::new(false),
        }
    }

    pub fn spec(&self) -> &DataViewSpec {
        &self.spec
    }

    /// Ids of the storages currently exposed, in the order they were added.
    pub fn storages(&self) -> Vec<String> {
        lock(&self.storages).clone()
    }

    pub fn calls(&self) -> Vec<ViewCall> {
        lock(&self.calls).clone()
    }

    /// Ids passed to `add_storage`, in call order.
    pub fn added(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ViewCall::Added(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Ids passed to `remove_storage`, in call order.
    pub fn removed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ViewCall::Removed(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Whether the view currently holds a live link to a server.
    pub fn has_server(&self) -> bool {
        lock(&self.server)
            .as_ref()
            .map(|weak| weak.upgrade().is_some())
            .unwrap_or(false)
    }

    /// Make subsequent storage updates fail.
    pub fn set_reject_updates(&self, reject: bool) {
        self.reject_updates.store(reject, Ordering::SeqCst);
    }

    fn check_rejected(&self, volume: &VolumeDescriptor) -> Result<(), ViewError> {
        if self.reject_updates.load(Ordering::SeqCst) {
            return Err(ViewError::Rejected {
                id: volume.id.clone(),
                reason: "simulated failure".to_string(),
            });
        }
        Ok(())
    }
}

impl DataView for SimDataView {
    fn add_storage(&self, volume: &VolumeDescriptor) -> Result<(), ViewError> {
        lock(&self.calls).push(ViewCall::Added(volume.id.clone()));
        self.check_rejected(volume)?;
        let mut storages = lock(&self.storages);
        if !storages.contains(&volume.id) {
            storages.push(volume.id.clone());
        }
        Ok(())
    }

    fn remove_storage(&self, volume: &VolumeDescriptor) -> Result<(), ViewError> {
        lock(&self.calls).push(ViewCall::Removed(volume.id.clone()));
        self.check_rejected(volume)?;
        lock(&self.storages).retain(|id| id != &volume.id);
        Ok(())
    }

    fn set_server(&self, server: Option<&Arc<dyn ProtocolServer>>) {
        let call = if server.is_some() {
            ViewCall::Linked
        } else {
            ViewCall::Unlinked
        };
        lock(&self.calls).push(call);
        *lock(&self.server) = server.map(Arc::downgrade);
    }
}

/// A server whose serving loop parks on its own thread until disconnected.
pub struct SimServer {
    restricted: bool,
    identity: DeviceIdentity,
    notifier: TerminationNotifier,
    fail_start: bool,
    disconnect_tx: Mutex<Option<mpsc::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SimServer {
    pub fn new(
        restricted: bool,
        notifier: TerminationNotifier,
        identity: DeviceIdentity,
        fail_start: bool,
    ) -> Self {
        Self {
            restricted,
            identity,
            notifier,
            fail_start,
            disconnect_tx: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Session this server was built for.
    pub fn session_id(&self) -> Uuid {
        self.notifier.session_id()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.disconnect_tx).is_some()
    }

    /// Simulate the transport becoming invalid: the serving loop exits and
    /// reports termination.
    pub fn disconnect(&self) {
        if let Some(tx) = lock(&self.disconnect_tx).take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the serving thread to finish.
    pub fn join(&self) {
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl ProtocolServer for SimServer {
    fn start(&self) -> Result<(), ServerError> {
        if self.fail_start {
            return Err(ServerError::Start("simulated failure".to_string()));
        }
        let mut disconnect_tx = lock(&self.disconnect_tx);
        if disconnect_tx.is_some() {
            return Err(ServerError::Start("already serving".to_string()));
        }

        let (tx, rx) = mpsc::channel::<()>();
        let notifier = self.notifier.clone();
        let handle = std::thread::spawn(move || {
            // Either an explicit disconnect or the sender being dropped ends the loop.
            let _ = rx.recv();
            log::debug!("Simulated server {} lost its transport", notifier.session_id());
            notifier.notify();
        });

        *disconnect_tx = Some(tx);
        *lock(&self.thread) = Some(handle);
        Ok(())
    }

    fn is_restricted(&self) -> bool {
        self.restricted
    }
}

/// Builds [`SimDataView`]/[`SimServer`] pairs and keeps every one it built.
#[derive(Default)]
pub struct SimSessionFactory {
    views: Mutex<Vec<Arc<SimDataView>>>,
    servers: Mutex<Vec<Arc<SimServer>>>,
    fail_data_view: AtomicBool,
    fail_server: AtomicBool,
    fail_start: AtomicBool,
    attempts: AtomicUsize,
}

impl SimSessionFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_data_view(&self, fail: bool) {
        self.fail_data_view.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_server(&self, fail: bool) {
        self.fail_server.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Number of data views requested, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn views(&self) -> Vec<Arc<SimDataView>> {
        lock(&self.views).clone()
    }

    pub fn servers(&self) -> Vec<Arc<SimServer>> {
        lock(&self.servers).clone()
    }

    pub fn last_view(&self) -> Option<Arc<SimDataView>> {
        lock(&self.views).last().cloned()
    }

    pub fn last_server(&self) -> Option<Arc<SimServer>> {
        lock(&self.servers).last().cloned()
    }

    /// Number of servers constructed so far.
    pub fn server_count(&self) -> usize {
        lock(&self.servers).len()
    }

    pub fn running_servers(&self) -> Vec<Arc<SimServer>> {
        lock(&self.servers)
            .iter()
            .filter(|server| server.is_running())
            .cloned()
            .collect()
    }

    pub fn server_for(&self, session_id: Uuid) -> Option<Arc<SimServer>> {
        lock(&self.servers)
            .iter()
            .find(|server| server.session_id() == session_id)
            .cloned()
    }

    /// Disconnect every running server except the one serving `current`.
    ///
    /// Returns how many servers were disconnected.
    pub fn disconnect_detached(&self, current: Option<Uuid>) -> usize {
        let detached: Vec<_> = self
            .running_servers()
            .into_iter()
            .filter(|server| Some(server.session_id()) != current)
            .collect();
        for server in &detached {
            server.disconnect();
        }
        detached.len()
    }
}

impl SessionFactory for SimSessionFactory {
    fn create_data_view(&self, spec: &DataViewSpec) -> Result<Arc<dyn DataView>, ServerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_data_view.load(Ordering::SeqCst) {
            return Err(ServerError::DataView("simulated failure".to_string()));
        }
        let view = Arc::new(SimDataView::new(spec.clone()));
        lock(&self.views).push(Arc::clone(&view));
        Ok(view)
    }

    fn create_server(
        &self,
        _data_view: Arc<dyn DataView>,
        restricted: bool,
        notifier: TerminationNotifier,
        identity: &DeviceIdentity,
    ) -> Result<Arc<dyn ProtocolServer>, ServerError> {
        if self.fail_server.load(Ordering::SeqCst) {
            return Err(ServerError::Create("simulated failure".to_string()));
        }
        let server = Arc::new(SimServer::new(
            restricted,
            notifier,
            identity.clone(),
            self.fail_start.load(Ordering::SeqCst),
        ));
        lock(&self.servers).push(Arc::clone(&server));
        Ok(server)
    }
}
