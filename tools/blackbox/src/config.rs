use crate::errors::BlackboxError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Finalizer token recorded on every Recording the controller manages.
pub const DEFAULT_FINALIZER: &str = "recording.finalizer.blackbox.dev";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteMode {
    /// In-process agent model; the controller runs end-to-end with no
    /// network. Used by the CLI default and the integration tests.
    Simulated,
    /// Session wiring supplied by the embedder through `SessionFactory`.
    External,
}

impl RemoteMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simulated => "simulated",
            Self::External => "external",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub parallelism: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub controller: ControllerConfig,
    pub store: StoreConfig,
    pub remote: RemoteConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerConfig {
    pub parallelism: u32,
    /// Poll cadence while a session is active.
    pub active_requeue_seconds: u64,
    /// Delay while the referenced FlightRecorder has no observed target.
    pub target_wait_requeue_seconds: u64,
    pub error_backoff_base_ms: u64,
    pub error_backoff_cap_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteConfig {
    pub mode: RemoteMode,
    pub finalizer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub run_log_path: PathBuf,
    pub disk_budget_bytes: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig {
                parallelism: 2,
                active_requeue_seconds: 10,
                target_wait_requeue_seconds: 1,
                error_backoff_base_ms: 500,
                error_backoff_cap_ms: 30_000,
            },
            store: StoreConfig {
                db_path: PathBuf::from(".cache/blackbox/cluster.sqlite"),
            },
            remote: RemoteConfig {
                mode: RemoteMode::Simulated,
                finalizer: DEFAULT_FINALIZER.to_string(),
            },
            logging: LoggingConfig {
                // Retention prunes the log's directory; keep it separate
                // from the database.
                run_log_path: PathBuf::from(".cache/blackbox/logs/run.jsonl"),
                disk_budget_bytes: crate::logging::DEFAULT_DISK_BUDGET_BYTES,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    controller: Option<PartialControllerConfig>,
    store: Option<PartialStoreConfig>,
    remote: Option<PartialRemoteConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialControllerConfig {
    parallelism: Option<u32>,
    active_requeue_seconds: Option<u64>,
    target_wait_requeue_seconds: Option<u64>,
    error_backoff_base_ms: Option<u64>,
    error_backoff_cap_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialStoreConfig {
    db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialRemoteConfig {
    mode: Option<RemoteMode>,
    finalizer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    run_log_path: Option<PathBuf>,
    disk_budget_bytes: Option<u64>,
}

pub fn load_config(overrides: &CliOverrides) -> Result<AppConfig, BlackboxError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = read_config_file(path)?;
        let partial: PartialAppConfig = toml::from_str(&file_contents)
            .map_err(|e| BlackboxError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<String, BlackboxError> {
    std::fs::read_to_string(path)
        .map_err(|e| BlackboxError::Io(format!("read {}: {e}", path.display())))
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(controller) = partial.controller {
        if let Some(value) = controller.parallelism {
            cfg.controller.parallelism = value;
        }
        if let Some(value) = controller.active_requeue_seconds {
            cfg.controller.active_requeue_seconds = value;
        }
        if let Some(value) = controller.target_wait_requeue_seconds {
            cfg.controller.target_wait_requeue_seconds = value;
        }
        if let Some(value) = controller.error_backoff_base_ms {
            cfg.controller.error_backoff_base_ms = value;
        }
        if let Some(value) = controller.error_backoff_cap_ms {
            cfg.controller.error_backoff_cap_ms = value;
        }
    }

    if let Some(store) = partial.store {
        if let Some(value) = store.db_path {
            cfg.store.db_path = value;
        }
    }

    if let Some(remote) = partial.remote {
        if let Some(value) = remote.mode {
            cfg.remote.mode = value;
        }
        if let Some(value) = remote.finalizer {
            cfg.remote.finalizer = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(value) = logging.run_log_path {
            cfg.logging.run_log_path = value;
        }
        if let Some(value) = logging.disk_budget_bytes {
            cfg.logging.disk_budget_bytes = value;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(db_path) = &overrides.db_path {
        cfg.store.db_path = db_path.clone();
    }
    if let Some(parallelism) = overrides.parallelism {
        cfg.controller.parallelism = parallelism;
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), BlackboxError> {
    if cfg.controller.parallelism == 0 {
        return Err(BlackboxError::InvalidConfig(
            "controller.parallelism must be at least 1".to_string(),
        ));
    }
    if cfg.remote.finalizer.is_empty() {
        return Err(BlackboxError::InvalidConfig(
            "remote.finalizer must not be empty".to_string(),
        ));
    }
    if cfg.controller.error_backoff_base_ms > cfg.controller.error_backoff_cap_ms {
        return Err(BlackboxError::InvalidConfig(
            "controller.error_backoff_base_ms exceeds error_backoff_cap_ms".to_string(),
        ));
    }
    Ok(())
}
