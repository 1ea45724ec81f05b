use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Namespace-qualified identity of a stored resource. This is the unit the
/// reconcile queue delivers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parses the `namespace/name` form used on the command line.
    pub fn parse(value: &str) -> Option<Self> {
        let (namespace, name) = value.split_once('/')?;
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub namespace: String,
    pub name: String,
    /// Optimistic-concurrency token; bumped by the store on every accepted
    /// write. A stale token is rejected as a conflict, never merged.
    pub resource_version: u64,
    pub deletion_requested: bool,
    pub finalizers: Vec<String>,
}

impl ResourceMeta {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// The fixed enumeration of session states the remote agent may report.
/// Raw strings outside this set are a validation failure, never coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordingState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl RecordingState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
        }
    }

    pub fn parse_raw(value: &str) -> Option<Self> {
        match value {
            "CREATED" => Some(Self::Created),
            "RUNNING" => Some(Self::Running),
            "STOPPING" => Some(Self::Stopping),
            "STOPPED" => Some(Self::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingSpec {
    /// Name of the FlightRecorder resource (same namespace) identifying the
    /// target process.
    pub flight_recorder: Option<String>,
    /// Session name on the remote agent.
    pub name: String,
    /// Zero requests a continuous session; nonzero a timed dump.
    pub duration_seconds: u64,
    /// Only `Stopped` is meaningful; anything else is left unset.
    pub requested_state: Option<RecordingState>,
    pub event_options: BTreeMap<String, String>,
    pub archive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingStatus {
    /// Unset until the session has been observed on the remote agent.
    pub state: Option<RecordingState>,
    pub start_time_ms: Option<i64>,
    pub duration_ms: Option<i64>,
    pub download_url: Option<String>,
}

impl RecordingStatus {
    /// Records the archive location. The first write wins; later calls are
    /// ignored so the published URL never changes under a reader.
    pub fn record_download_url(&mut self, url: impl Into<String>) {
        if self.download_url.is_none() {
            self.download_url = Some(url.into());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recording {
    pub meta: ResourceMeta,
    pub spec: RecordingSpec,
    pub status: RecordingStatus,
}

impl Recording {
    pub fn key(&self) -> ResourceKey {
        self.meta.key()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightRecorderStatus {
    /// Service backing the target process; unset until the recorder has
    /// observed a live target.
    pub target: Option<ServiceRef>,
    pub port: u16,
}

/// Read-only companion resource naming a target process and the port its
/// profiling agent listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightRecorder {
    pub namespace: String,
    pub name: String,
    pub status: FlightRecorderStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub namespace: String,
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl ServiceEndpoint {
    /// Stable identity used to key session caching and the per-agent lock
    /// registry.
    pub fn identity(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Live session entry reported by the remote agent. Reconstructed on every
/// reconcile; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingDescriptor {
    pub name: String,
    pub state: String,
    pub start_time: i64,
    pub duration: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedRecordingDescriptor {
    pub name: String,
    pub download_url: String,
}
