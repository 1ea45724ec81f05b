use blackbox::config::{AppConfig, DEFAULT_FINALIZER};
use blackbox::errors::BlackboxError;
use blackbox::reconciler::Reconciler;
use blackbox::runtime::{RecordingStore, ScriptedSessionClient, ScriptedSessionFactory};
use blackbox::store::{ClusterStore, ServiceRecord};
use blackbox::types::{
    FlightRecorder, FlightRecorderStatus, Recording, RecordingDescriptor, RecordingSpec,
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

fn harness(ready_instances: usize, with_recorder: bool) -> Harness {
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
            ready_instances,
            controller: false,
        })
        .expect("target service");
    if with_recorder {
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
    }

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

/// Seeds a recording carrying this controller's finalizer and the deletion
/// marker, optionally with a recorded download URL.
fn seed_deleting(store: &ClusterStore, download_url: Option<&str>) -> Recording {
    store
        .upsert_recording(
            "prod",
            "rec1",
            RecordingSpec {
                flight_recorder: Some("jfr-1".to_string()),
                name: "rec1".to_string(),
                duration_seconds: 0,
                requested_state: None,
                event_options: BTreeMap::new(),
                archive: download_url.is_some(),
            },
        )
        .expect("seed");

    let mut recording = store.get(&key()).expect("get").expect("present");
    recording.meta.finalizers.push(DEFAULT_FINALIZER.to_string());
    recording = store.update(&recording).expect("finalizer");
    if let Some(url) = download_url {
        recording.status.record_download_url(url);
        store.update_status(&recording).expect("status");
    }

    assert!(store.request_deletion(&key()).expect("request"));
    store.get(&key()).expect("get").expect("still present")
}

#[test]
fn unreachable_target_skips_cleanup_and_releases_the_finalizer() {
    let h = harness(0, true);
    seed_deleting(&h.store, None);

    let requeue = h.reconciler.reconcile(&key()).expect("reconcile");
    assert_eq!(requeue, None);
    assert!(h.client.calls().is_empty(), "{:?}", h.client.calls());
    assert!(
        h.store.get(&key()).expect("get").is_none(),
        "row removed once the finalizer cleared"
    );
}

#[test]
fn missing_recorder_during_deletion_releases_the_finalizer_immediately() {
    let h = harness(1, false);
    seed_deleting(&h.store, None);

    let requeue = h.reconciler.reconcile(&key()).expect("reconcile");
    assert_eq!(requeue, None);
    assert!(h.client.calls().is_empty());
    assert!(h.store.get(&key()).expect("get").is_none());
}

#[test]
fn reachable_target_deletes_the_live_recording_before_unwinding() {
    let h = harness(1, true);
    seed_deleting(&h.store, None);
    h.client.set_live(vec![RecordingDescriptor {
        name: "rec1".to_string(),
        state: "RUNNING".to_string(),
        start_time: 1000,
        duration: 0,
    }]);

    let requeue = h.reconciler.reconcile(&key()).expect("reconcile");
    assert_eq!(requeue, None);

    let calls = h.client.calls();
    assert!(calls.iter().any(|c| c == "delete_live rec1"), "{calls:?}");
    assert!(calls.iter().any(|c| c == "disconnect"), "{calls:?}");
    assert!(h.store.get(&key()).expect("get").is_none());
}

#[test]
fn live_deletion_failure_is_best_effort() {
    let h = harness(1, true);
    seed_deleting(&h.store, None);
    h.client.set_live(vec![RecordingDescriptor {
        name: "rec1".to_string(),
        state: "RUNNING".to_string(),
        start_time: 1000,
        duration: 0,
    }]);
    h.client.fail_on("delete_live");

    let requeue = h.reconciler.reconcile(&key()).expect("reconcile");
    assert_eq!(requeue, None);
    assert!(
        h.store.get(&key()).expect("get").is_none(),
        "finalizer released despite the failed remote delete"
    );
}

#[test]
fn archived_artifact_is_deleted_first() {
    let h = harness(1, true);
    seed_deleting(&h.store, Some("https://agent:8181/files/rec1.jfr"));
    h.client.set_saved(vec![SavedRecordingDescriptor {
        name: "rec1.jfr".to_string(),
        download_url: "https://agent:8181/files/rec1.jfr".to_string(),
    }]);

    h.reconciler.reconcile(&key()).expect("reconcile");

    let calls = h.client.calls();
    let saved_delete = calls.iter().position(|c| c == "delete_saved rec1.jfr");
    let connect = calls.iter().position(|c| c.starts_with("connect"));
    assert!(saved_delete.is_some(), "{calls:?}");
    assert!(
        saved_delete < connect,
        "saved artifact removal precedes the target attach: {calls:?}"
    );
    assert!(h.store.get(&key()).expect("get").is_none());
}

#[test]
fn absent_saved_file_counts_as_already_deleted() {
    let h = harness(1, true);
    seed_deleting(&h.store, Some("https://agent:8181/files/rec1.jfr"));
    h.client.set_saved(Vec::new());

    h.reconciler.reconcile(&key()).expect("reconcile");

    let calls = h.client.calls();
    assert!(!calls.iter().any(|c| c.starts_with("delete_saved")), "{calls:?}");
    assert!(h.store.get(&key()).expect("get").is_none());
}

#[test]
fn saved_listing_failure_aborts_the_deletion_for_retry() {
    let h = harness(1, true);
    seed_deleting(&h.store, Some("https://agent:8181/files/rec1.jfr"));
    h.client.fail_on("list_saved");

    let err = h.reconciler.reconcile(&key()).expect_err("must fail");
    assert!(matches!(err, BlackboxError::Remote(_)), "got {err}");

    let stored = h.store.get(&key()).expect("get").expect("still present");
    assert!(
        stored.meta.finalizers.contains(&DEFAULT_FINALIZER.to_string()),
        "finalizer stays until cleanup succeeds"
    );
}

#[test]
fn marker_without_our_finalizer_touches_nothing() {
    let h = harness(1, true);
    h.store
        .upsert_recording(
            "prod",
            "rec1",
            RecordingSpec {
                flight_recorder: Some("jfr-1".to_string()),
                name: "rec1".to_string(),
                duration_seconds: 0,
                requested_state: None,
                event_options: BTreeMap::new(),
                archive: false,
            },
        )
        .expect("seed");
    let mut recording = h.store.get(&key()).expect("get").expect("present");
    recording.meta.finalizers.push("other.finalizer".to_string());
    h.store.update(&recording).expect("foreign finalizer");
    assert!(h.store.request_deletion(&key()).expect("request"));

    let before = h.store.get(&key()).expect("get").expect("present");
    let requeue = h.reconciler.reconcile(&key()).expect("reconcile");
    assert_eq!(requeue, None);
    assert!(h.client.calls().is_empty(), "{:?}", h.client.calls());
    assert_eq!(
        h.store.get(&key()).expect("get").expect("present"),
        before,
        "no writes while another owner unwinds"
    );
}
