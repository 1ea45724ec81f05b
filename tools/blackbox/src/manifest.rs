use crate::errors::BlackboxError;
use crate::logging::append_run_log;
use crate::store::{ClusterStore, ServiceRecord};
use crate::types::{
    FlightRecorder, FlightRecorderStatus, RecordingSpec, RecordingState, ServiceRef,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;

/// Declarative cluster state: services, flight recorders, and recordings in
/// one JSON document. Applying is upsert-only; deletion goes through the
/// deletion marker.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
    #[serde(default)]
    pub flight_recorders: Vec<RecorderEntry>,
    #[serde(default)]
    pub recordings: Vec<RecordingEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    pub namespace: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub ready_instances: usize,
    #[serde(default)]
    pub controller: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecorderEntry {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub target: Option<ServiceRef>,
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingEntry {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub flight_recorder: Option<String>,
    /// Session name on the agent; defaults to the resource name.
    #[serde(default)]
    pub session_name: Option<String>,
    #[serde(default)]
    pub duration_seconds: u64,
    #[serde(default)]
    pub requested_state: Option<RecordingState>,
    #[serde(default)]
    pub event_options: BTreeMap<String, String>,
    #[serde(default)]
    pub archive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub services: usize,
    pub flight_recorders: usize,
    pub recordings: usize,
}

pub fn load_manifest(path: &Path) -> Result<Manifest, BlackboxError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| BlackboxError::Io(format!("read {}: {e}", path.display())))?;
    serde_json::from_str(&raw).map_err(|e| BlackboxError::Validation(e.to_string()))
}

pub fn apply_manifest(
    store: &ClusterStore,
    manifest: &Manifest,
) -> Result<ApplySummary, BlackboxError> {
    let mut summary = ApplySummary::default();

    for service in &manifest.services {
        store.upsert_service(ServiceRecord {
            namespace: service.namespace.clone(),
            name: service.name.clone(),
            host: service.host.clone(),
            port: service.port,
            ready_instances: service.ready_instances,
            controller: service.controller,
        })?;
        summary.services += 1;
    }

    for recorder in &manifest.flight_recorders {
        store.upsert_flight_recorder(FlightRecorder {
            namespace: recorder.namespace.clone(),
            name: recorder.name.clone(),
            status: FlightRecorderStatus {
                target: recorder.target.clone(),
                port: recorder.port,
            },
        })?;
        summary.flight_recorders += 1;
    }

    for recording in &manifest.recordings {
        let spec = RecordingSpec {
            flight_recorder: recording.flight_recorder.clone(),
            name: recording
                .session_name
                .clone()
                .unwrap_or_else(|| recording.name.clone()),
            duration_seconds: recording.duration_seconds,
            requested_state: recording.requested_state,
            event_options: recording.event_options.clone(),
            archive: recording.archive,
        };
        store.upsert_recording(&recording.namespace, &recording.name, spec)?;
        summary.recordings += 1;
    }

    append_run_log(
        "info",
        "manifest.applied",
        json!({
            "services": summary.services,
            "flight_recorders": summary.flight_recorders,
            "recordings": summary.recordings,
        }),
    );
    Ok(summary)
}
