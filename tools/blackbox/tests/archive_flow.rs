use blackbox::config::{AppConfig, DEFAULT_FINALIZER};
use blackbox::errors::BlackboxError;
use blackbox::reconciler::Reconciler;
use blackbox::runtime::{RecordingStore, ScriptedSessionClient, ScriptedSessionFactory};
use blackbox::store::{ClusterStore, ServiceRecord};
use blackbox::types::{
    FlightRecorder, FlightRecorderStatus, RecordingDescriptor, RecordingSpec, RecordingState,
    ResourceKey, SavedRecordingDescriptor, ServiceRef,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    store: Arc<ClusterStore>,
    client: ScriptedSessionClient,
    reconciler: Reconciler,
    _dir: TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(ClusterStore::open(dir.path().join("cluster.sqlite")).expect("open"));
    store
        .upsert_service(ServiceRecord {
            namespace: "prod".to_string(),
            name: "agent".to_string(),
            host: "10.0.0.2".to_string(),
            port: 8181,
            ready_instances: 1,
            controller: true,
        })
        .expect("controller service");
    store
        .upsert_service(ServiceRecord {
            namespace: "prod".to_string(),
            name: "app".to_string(),
            host: "10.0.0.3".to_string(),
            port: 9091,
            ready_instances: 1,
            controller: false,
        })
        .expect("target service");
    store
        .upsert_flight_recorder(FlightRecorder {
            namespace: "prod".to_string(),
            name: "jfr-1".to_string(),
            status: FlightRecorderStatus {
                target: Some(ServiceRef {
                    namespace: "prod".to_string(),
                    name: "app".to_string(),
                }),
                port: 9091,
            },
        })
        .expect("recorder");

    let client = ScriptedSessionClient::default();
    let factory = ScriptedSessionFactory::new(client.clone());
    let cfg = AppConfig::default();
    let reconciler = Reconciler::new(store.clone(), store.clone(), Arc::new(factory), &cfg);
    Harness {
        store,
        client,
        reconciler,
        _dir: dir,
    }
}

fn key() -> ResourceKey {
    ResourceKey::new("prod", "rec1")
}

/// Seeds a stopped recording with the archive flag set and our finalizer in
/// place, as a prior reconciliation would have left it.
fn seed_stopped_archive_requested(store: &ClusterStore) {
    store
        .upsert_recording(
            "prod",
            "rec1",
            RecordingSpec {
                flight_recorder: Some("jfr-1".to_string()),
                name: "rec1".to_string(),
                duration_seconds: 30,
                requested_state: None,
                event_options: BTreeMap::new(),
                archive: true,
            },
        )
        .expect("seed");
    let mut recording = store.get(&key()).expect("get").expect("present");
    recording.meta.finalizers.push(DEFAULT_FINALIZER.to_string());
    let mut recording = store.update(&recording).expect("finalizer");
    recording.status.state = Some(RecordingState::Stopped);
    recording.status.start_time_ms = Some(1000);
    recording.status.duration_ms = Some(30_000);
    store.update_status(&recording).expect("status");
}

fn stopped_descriptor() -> RecordingDescriptor {
    RecordingDescriptor {
        name: "rec1".to_string(),
        state: "STOPPED".to_string(),
        start_time: 1000,
        duration: 30_000,
    }
}

#[test]
fn stopped_recording_is_saved_and_gets_its_download_url_once() {
    let h = harness();
    seed_stopped_archive_requested(&h.store);
    h.client.set_live(vec![stopped_descriptor()]);
    h.client.set_saved(vec![SavedRecordingDescriptor {
        name: "rec1.jfr".to_string(),
        download_url: "https://agent:8181/files/rec1.jfr".to_string(),
    }]);

    let requeue = h.reconciler.reconcile(&key()).expect("reconcile");
    assert_eq!(requeue, None);

    let calls = h.client.calls();
    assert!(calls.iter().any(|c| c == "save rec1"), "{calls:?}");

    let stored = h.store.get(&key()).expect("get").expect("present");
    assert_eq!(
        stored.status.download_url.as_deref(),
        Some("https://agent:8181/files/rec1.jfr")
    );

    // Archive satisfied: the next invocation is a no-op.
    let requeue = h.reconciler.reconcile(&key()).expect("second");
    assert_eq!(requeue, None);
    let calls_after = h.client.calls();
    assert_eq!(calls, calls_after, "no further save or list calls");
}

#[test]
fn archive_waits_until_the_session_has_stopped() {
    let h = harness();
    seed_stopped_archive_requested(&h.store);
    // The agent still reports the session running; the earlier stopped
    // status came from a stale round.
    h.client.set_live(vec![RecordingDescriptor {
        name: "rec1".to_string(),
        state: "RUNNING".to_string(),
        start_time: 1000,
        duration: 30_000,
    }]);

    let requeue = h.reconciler.reconcile(&key()).expect("reconcile");
    assert_eq!(requeue, Some(std::time::Duration::from_secs(10)));

    let calls = h.client.calls();
    assert!(!calls.iter().any(|c| c == "save rec1"), "{calls:?}");
    let stored = h.store.get(&key()).expect("get").expect("present");
    assert!(stored.status.download_url.is_none());
}

#[test]
fn save_failure_surfaces_and_leaves_the_url_unset() {
    let h = harness();
    seed_stopped_archive_requested(&h.store);
    h.client.set_live(vec![stopped_descriptor()]);
    h.client.fail_on("save");

    let err = h.reconciler.reconcile(&key()).expect_err("must fail");
    assert!(matches!(err, BlackboxError::Remote(_)), "got {err}");

    let stored = h.store.get(&key()).expect("get").expect("present");
    assert!(stored.status.download_url.is_none());
}

#[test]
fn missing_saved_entry_leaves_the_url_for_a_later_round() {
    let h = harness();
    seed_stopped_archive_requested(&h.store);
    h.client.set_live(vec![stopped_descriptor()]);
    h.client.set_saved(Vec::new());

    let requeue = h.reconciler.reconcile(&key()).expect("reconcile");
    assert_eq!(requeue, None);

    let stored = h.store.get(&key()).expect("get").expect("present");
    assert!(stored.status.download_url.is_none());
}

#[test]
fn unrequested_archive_never_saves() {
    let h = harness();
    h.store
        .upsert_recording(
            "prod",
            "rec1",
            RecordingSpec {
                flight_recorder: Some("jfr-1".to_string()),
                name: "rec1".to_string(),
                duration_seconds: 30,
                requested_state: None,
                event_options: BTreeMap::new(),
                archive: false,
            },
        )
        .expect("seed");
    h.client.set_live(vec![stopped_descriptor()]);

    let requeue = h.reconciler.reconcile(&key()).expect("reconcile");
    assert_eq!(requeue, None);

    let calls = h.client.calls();
    assert!(!calls.iter().any(|c| c.starts_with("save")), "{calls:?}");
}
