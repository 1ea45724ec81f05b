use crate::errors::BlackboxError;
use crate::log_retention::prune_to_budget;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_DISK_BUDGET_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub ts_ms: i64,
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: 4096,
            budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
        }
    }

    pub fn append(&self, level: &str, event_type: &str, payload: Value) -> Result<(), BlackboxError> {
        let parent = self.path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(parent) = parent {
            fs::create_dir_all(parent).map_err(|e| BlackboxError::Io(e.to_string()))?;
        }
        let event = LogEvent {
            ts_ms: epoch_ms(),
            level,
            event_type,
            payload: truncate_json(payload, self.max_payload_bytes),
        };
        let line =
            serde_json::to_string(&event).map_err(|e| BlackboxError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| BlackboxError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| BlackboxError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| BlackboxError::Io(e.to_string()))?;

        if let Some(parent) = parent {
            let _ = prune_to_budget(parent, self.budget_bytes)?;
        }

        Ok(())
    }
}

static RUN_LOGGER: OnceLock<Mutex<Option<JsonlLogger>>> = OnceLock::new();

fn run_logger() -> &'static Mutex<Option<JsonlLogger>> {
    RUN_LOGGER.get_or_init(|| Mutex::new(None))
}

/// Routes `append_run_log` to `path` for the rest of the process. Until this
/// is called, run-log events are dropped (unit tests stay silent on disk).
pub fn init_run_log(path: impl AsRef<Path>, budget_bytes: u64) {
    let mut logger = JsonlLogger::new(path);
    logger.budget_bytes = budget_bytes;
    if let Ok(mut slot) = run_logger().lock() {
        *slot = Some(logger);
    }
}

/// Appends one structured event to the process run log. Logging is
/// best-effort; failures never interrupt reconciliation.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let Ok(slot) = run_logger().lock() else {
        return;
    };
    if let Some(logger) = slot.as_ref() {
        let _ = logger.append(level, event_type, payload);
    }
}

fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut truncated = rendered;
    truncated.truncate(max_bytes.saturating_sub(3));
    Value::String(format!("{truncated}..."))
}
