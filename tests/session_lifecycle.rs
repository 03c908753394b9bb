//! Session lifecycle integration tests
//!
//! Drives a coordinator against the simulated server and data view through
//! start/stop, volume churn and server self-termination, including the
//! races between them.
//!
//! Run with:
//!   cargo test --test session_lifecycle

use std::sync::{Arc, Barrier};
use std::time::Duration;

use mtphost::server::simulated::{SimSessionFactory, ViewCall};
use mtphost::{
    Coordinator, CoordinatorConfig, Forwarded, FsUserResolver, SessionEvent, SessionOutcome,
    SessionParams, StartError, UserId, VolumeDescriptor, VolumeEvent, VolumeEventListener,
    VolumeState, VolumeStateChange,
};
use mtphost::server::SessionEvents;
use tempfile::TempDir;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const PRIMARY: &str = "/storage/emulated/0";
const CARD: &str = "/storage/1234-ABCD";
const USB: &str = "/storage/5678-EF01";

struct Harness {
    _users: TempDir,
    coordinator: Arc<Coordinator>,
    factory: Arc<SimSessionFactory>,
    events: SessionEvents,
}

fn harness() -> Harness {
    let users = TempDir::new().unwrap();
    std::fs::create_dir(users.path().join("0")).unwrap();
    let factory = SimSessionFactory::new();
    let (coordinator, events) = Coordinator::new(
        CoordinatorConfig::default(),
        factory.clone(),
        Arc::new(FsUserResolver::new(users.path())),
    );
    Harness {
        _users: users,
        coordinator,
        factory,
        events,
    }
}

fn params(unlocked: bool, restricted: bool) -> SessionParams {
    SessionParams {
        unlocked,
        restricted,
        target_user: UserId(0),
    }
}

fn volumes() -> Vec<VolumeDescriptor> {
    vec![
        VolumeDescriptor::new(PRIMARY, true, VolumeState::Mounted),
        VolumeDescriptor::new(CARD, false, VolumeState::Mounted),
        VolumeDescriptor::new(USB, false, VolumeState::Unmounted),
    ]
}

fn mount(id: &str) -> VolumeStateChange {
    VolumeStateChange::new(id, VolumeState::Checking, VolumeState::Mounted)
}

fn unmount(id: &str) -> VolumeStateChange {
    VolumeStateChange::new(id, VolumeState::Mounted, VolumeState::Unmounted)
}

// ---------------------------------------------------------------------------
// Session management
// ---------------------------------------------------------------------------

#[test]
fn test_at_most_one_session_under_concurrent_starts() {
    let h = harness();
    let barrier = Arc::new(Barrier::new(8));

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let coordinator = Arc::clone(&h.coordinator);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                coordinator.start_session(params(true, false), volumes()).unwrap()
            })
        })
        .collect();

    let outcomes: Vec<SessionOutcome> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    let started = outcomes
        .iter()
        .filter(|o| matches!(o, SessionOutcome::Started(_)))
        .count();
    assert_eq!(started, 1);
    assert_eq!(h.factory.server_count(), 1);

    let id = outcomes[0].session_id();
    assert!(outcomes.iter().all(|o| o.session_id() == id));
}

#[test]
fn test_idle_stop_is_noop() {
    let h = harness();
    assert!(!h.coordinator.stop_session());
    assert!(!h.coordinator.is_active());
    assert!(h.factory.views().is_empty());
}

#[test]
fn test_fatal_start_leaves_no_trace() {
    let h = harness();
    let no_primary = vec![VolumeDescriptor::new(CARD, false, VolumeState::Mounted)];

    let err = h
        .coordinator
        .start_session(params(true, false), no_primary)
        .unwrap_err();
    assert!(matches!(err, StartError::NoPrimaryVolume(1)));
    assert!(!h.coordinator.is_active());
    assert!(h.coordinator.known_volumes().is_empty());
    assert_eq!(h.factory.attempts(), 0);
}

#[test]
fn test_restart_after_stop_reseeds_storage() {
    let h = harness();
    h.coordinator.start_session(params(true, false), volumes()).unwrap();
    assert_eq!(h.factory.last_view().unwrap().added(), vec![PRIMARY, CARD]);

    assert!(h.coordinator.stop_session());
    let first_view = h.factory.last_view().unwrap();
    assert!(!first_view.has_server());

    let outcome = h
        .coordinator
        .start_session(params(true, true), volumes())
        .unwrap();
    assert!(matches!(outcome, SessionOutcome::Started(_)));
    assert_eq!(h.factory.server_count(), 2);
    assert_eq!(h.factory.last_view().unwrap().added(), vec![PRIMARY]);

    // The detached view never hears about later volume events.
    h.coordinator.on_volume_state_changed(&unmount(CARD)).unwrap();
    assert!(first_view.removed().is_empty());
}

#[test]
fn test_locked_session_exposes_nothing() {
    let h = harness();
    h.coordinator.start_session(params(false, false), volumes()).unwrap();
    let view = h.factory.last_view().unwrap();
    assert!(view.added().is_empty());

    let forwarded = h.coordinator.on_volume_state_changed(&mount(USB)).unwrap();
    assert_eq!(forwarded, Forwarded::Recorded);
    assert!(view.added().is_empty());
    assert_eq!(h.coordinator.mounted_volumes().len(), 3);
}

#[test]
fn test_start_command_enumerates_user_volumes() {
    let h = harness();
    let source = |user: UserId| {
        assert_eq!(user, UserId(0));
        volumes()
    };
    h.coordinator
        .on_start_command(params(true, false), &source)
        .unwrap();
    assert_eq!(h.coordinator.known_volumes().len(), 3);
    assert_eq!(h.factory.last_view().unwrap().storages(), vec![PRIMARY, CARD]);
}

// ---------------------------------------------------------------------------
// Volume reconciliation
// ---------------------------------------------------------------------------

#[test]
fn test_restricted_session_only_learns_primary() {
    let h = harness();
    let mut known = volumes();
    known[0].state = VolumeState::Unmounted;
    h.coordinator.start_session(params(true, true), known).unwrap();
    let view = h.factory.last_view().unwrap();
    assert_eq!(view.added(), vec![PRIMARY]);

    let forwarded = h.coordinator.on_volume_state_changed(&mount(USB)).unwrap();
    assert_eq!(forwarded, Forwarded::Recorded);

    let forwarded = h.coordinator.on_volume_state_changed(&mount(PRIMARY)).unwrap();
    assert_eq!(forwarded, Forwarded::Added);
    assert_eq!(view.added(), vec![PRIMARY, PRIMARY]);
}

#[test]
fn test_full_session_learns_every_volume() {
    let h = harness();
    h.coordinator.start_session(params(true, false), volumes()).unwrap();

    let forwarded = h.coordinator.on_volume_state_changed(&mount(USB)).unwrap();
    assert_eq!(forwarded, Forwarded::Added);
    assert_eq!(
        h.factory.last_view().unwrap().storages(),
        vec![PRIMARY, CARD, USB]
    );
}

#[test]
fn test_retraction_is_unconditional() {
    for (unlocked, restricted) in [(false, false), (false, true), (true, false), (true, true)] {
        let h = harness();
        h.coordinator
            .start_session(params(unlocked, restricted), volumes())
            .unwrap();

        let forwarded = h.coordinator.on_volume_state_changed(&unmount(CARD)).unwrap();
        assert_eq!(forwarded, Forwarded::Removed, "unlocked={unlocked} restricted={restricted}");
        assert_eq!(h.factory.last_view().unwrap().removed(), vec![CARD]);
        assert!(h.coordinator.mounted_volumes().iter().all(|v| v.id != CARD));
    }
}

#[test]
fn test_volume_events_while_idle_update_registry_only() {
    let h = harness();
    h.coordinator.start_session(params(true, false), volumes()).unwrap();
    h.coordinator.stop_session();
    let view = h.factory.last_view().unwrap();
    let calls_before = view.calls().len();

    assert_eq!(
        h.coordinator.on_volume_state_changed(&mount(USB)).unwrap(),
        Forwarded::Recorded
    );
    assert_eq!(
        h.coordinator.on_volume_state_changed(&unmount(CARD)).unwrap(),
        Forwarded::Recorded
    );
    assert_eq!(view.calls().len(), calls_before);

    let mounted: Vec<_> = h
        .coordinator
        .mounted_volumes()
        .into_iter()
        .map(|v| v.id)
        .collect();
    assert_eq!(mounted, vec![PRIMARY, USB]);
}

#[test]
fn test_irrelevant_transitions_are_ignored() {
    let h = harness();
    h.coordinator.start_session(params(true, false), volumes()).unwrap();

    // Unknown volume, untracked unmount, and a non-mount transition.
    for change in [
        mount("/mnt/unknown"),
        unmount(USB),
        VolumeStateChange::new(USB, VolumeState::Unmounted, VolumeState::Checking),
    ] {
        assert_eq!(
            h.coordinator.on_volume_state_changed(&change).unwrap(),
            Forwarded::Ignored
        );
    }
}

#[test]
fn test_classified_event_entry_point() {
    let h = harness();
    h.coordinator.start_session(params(true, false), volumes()).unwrap();
    let otg = VolumeDescriptor::new("/storage/OTG-0001", false, VolumeState::Mounted);

    let forwarded = h
        .coordinator
        .on_volume_changed(VolumeEvent::Available {
            id: otg.id.clone(),
            descriptor: otg.clone(),
        })
        .unwrap();
    assert_eq!(forwarded, Forwarded::Added);
    assert!(h.coordinator.known_volumes().contains(&otg));
}

// ---------------------------------------------------------------------------
// Termination reconciliation
// ---------------------------------------------------------------------------

#[test]
fn test_termination_race_safety() {
    let h = harness();
    h.coordinator.start_session(params(true, false), volumes()).unwrap();

    h.coordinator.on_server_terminated();
    h.coordinator.on_server_terminated();
    assert!(!h.coordinator.is_active());

    h.coordinator.start_session(params(true, false), volumes()).unwrap();
    h.coordinator.stop_session();
    h.coordinator.on_server_terminated();
    assert!(!h.coordinator.is_active());

    let view = h.factory.last_view().unwrap();
    assert_eq!(view.calls().last(), Some(&ViewCall::Unlinked));
}

#[test]
fn test_server_disconnect_tears_down_session() {
    let mut h = harness();
    let outcome = h
        .coordinator
        .start_session(params(true, false), volumes())
        .unwrap();

    let server = h.factory.last_server().unwrap();
    server.disconnect();
    server.join();

    let event = h.events.try_recv().unwrap();
    assert_eq!(
        event,
        SessionEvent::ServerTerminated {
            session_id: outcome.session_id()
        }
    );
    h.coordinator.handle_event(event.clone());
    assert!(!h.coordinator.is_active());
    assert!(!h.factory.last_view().unwrap().has_server());

    // A duplicate notification after teardown is harmless.
    h.coordinator.handle_event(event);
    assert!(!h.coordinator.is_active());
}

#[test]
fn test_terminate_stop_start_race() {
    let h = harness();
    for _ in 0..20 {
        h.coordinator.start_session(params(true, false), volumes()).unwrap();
        let barrier = Arc::new(Barrier::new(3));
        let threads: Vec<_> = (0..3)
            .map(|i| {
                let coordinator = Arc::clone(&h.coordinator);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    match i {
                        0 => coordinator.on_server_terminated(),
                        1 => {
                            coordinator.stop_session();
                        }
                        _ => {
                            coordinator
                                .start_session(params(true, true), volumes())
                                .unwrap();
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        h.coordinator.stop_session();
        assert!(!h.coordinator.is_active());
    }

    // Every view ends up detached from its server.
    assert!(h.factory.views().iter().all(|v| !v.has_server()));
}

// ---------------------------------------------------------------------------
// Channel-driven paths
// ---------------------------------------------------------------------------

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_event_loop_handles_self_termination() {
    let h = harness();
    let event_loop = h.coordinator.spawn_event_loop(h.events);
    h.coordinator.start_session(params(true, false), volumes()).unwrap();

    h.factory.last_server().unwrap().disconnect();
    let coordinator = Arc::clone(&h.coordinator);
    wait_until(|| !coordinator.is_active()).await;

    // The next run command starts a fresh server.
    let outcome = h
        .coordinator
        .start_session(params(true, false), volumes())
        .unwrap();
    assert!(matches!(outcome, SessionOutcome::Started(_)));
    event_loop.abort();
}

#[tokio::test]
async fn test_listener_pump_applies_changes() {
    let h = harness();
    h.coordinator.start_session(params(true, false), volumes()).unwrap();
    let view = h.factory.last_view().unwrap();

    let listener = VolumeEventListener::new(Arc::clone(&h.coordinator));
    let (tx, rx) = mpsc::channel(8);
    let pump = listener.attach(rx);

    tx.send(mount(USB)).await.unwrap();
    tx.send(unmount(CARD)).await.unwrap();
    wait_until(|| view.removed() == vec![CARD.to_string()]).await;
    assert_eq!(view.storages(), vec![PRIMARY, USB]);

    listener.detach();
    pump.await.unwrap();

    // Detached: further notifications are not applied.
    let _ = tx.send(unmount(USB)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(view.storages(), vec![PRIMARY, USB]);
}

#[tokio::test]
async fn test_listener_pump_survives_forward_failure() {
    let h = harness();
    h.coordinator.start_session(params(true, false), volumes()).unwrap();
    let view = h.factory.last_view().unwrap();
    view.set_reject_updates(true);

    let listener = VolumeEventListener::new(Arc::clone(&h.coordinator));
    assert!(listener.on_volume_state_changed(&mount(USB)).is_err());

    let (tx, rx) = mpsc::channel(8);
    let pump = listener.attach(rx);
    tx.send(unmount(CARD)).await.unwrap();
    drop(tx);
    pump.await.unwrap();

    assert!(h.coordinator.is_active());
    assert_eq!(view.removed(), vec![CARD]);
    let mounted: Vec<_> = h
        .coordinator
        .mounted_volumes()
        .into_iter()
        .map(|v| v.id)
        .collect();
    assert_eq!(mounted, vec![PRIMARY, USB]);
}
