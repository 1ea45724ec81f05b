pub mod config;
pub mod errors;
pub mod finalizer;
pub mod log_retention;
pub mod logging;
pub mod manifest;
pub mod phase;
pub mod projector;
pub mod queue;
pub mod reconciler;
pub mod runtime;
pub mod session;
pub mod store;
pub mod types;

use clap::{error::ErrorKind, CommandFactory, Parser};
use config::{load_config, AppConfig, CliOverrides, RemoteMode};
use errors::BlackboxError;
use logging::{append_run_log, init_run_log};
use manifest::{apply_manifest, load_manifest};
use queue::{QueueMetrics, ReconcileQueue};
use reconciler::Reconciler;
use runtime::{
    Clock, ProductionClock, RecordingStore, SessionFactory, SimulatedAgent,
    SimulatedSessionFactory, TargetResolver,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use store::ClusterStore;
use types::ResourceKey;

#[derive(Debug, Clone, Parser)]
#[command(name = "blackbox")]
#[command(about = "Reconciling controller for remote profiling recordings")]
pub struct Cli {
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,
    #[arg(long)]
    pub db: Option<std::path::PathBuf>,
    #[arg(long)]
    pub parallelism: Option<u32>,
    /// Apply a JSON manifest of services, flight recorders, and recordings.
    #[arg(long)]
    pub apply: Option<std::path::PathBuf>,
    /// Mark a recording (namespace/name) for deletion.
    #[arg(long)]
    pub delete: Option<String>,
    /// Print stored recordings as JSON lines.
    #[arg(long, default_value_t = false)]
    pub list: bool,
    /// Run the controller loop until the queue is idle.
    #[arg(long, default_value_t = false)]
    pub run: bool,
    /// Stop the controller loop after this many reconciliations.
    #[arg(long = "quit-after")]
    pub quit_after: Option<u32>,
}

pub fn run() -> Result<i32, BlackboxError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    run_with_args(&args)
}

pub fn run_with_args(args: &[std::ffi::OsString]) -> Result<i32, BlackboxError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(BlackboxError::Cli(error.to_string())),
        },
    };

    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        db_path: cli.db.clone(),
        parallelism: cli.parallelism,
    };
    let cfg = load_config(&overrides)?;
    init_run_log(&cfg.logging.run_log_path, cfg.logging.disk_budget_bytes);

    let store = Arc::new(ClusterStore::open(&cfg.store.db_path)?);
    let mut acted = false;

    if let Some(path) = &cli.apply {
        let manifest = load_manifest(path)?;
        let summary = apply_manifest(&store, &manifest)?;
        println!(
            "applied: services={} flight_recorders={} recordings={}",
            summary.services, summary.flight_recorders, summary.recordings
        );
        acted = true;
    }

    if let Some(raw) = &cli.delete {
        let key = ResourceKey::parse(raw).ok_or_else(|| {
            BlackboxError::Cli(format!("--delete expects namespace/name, got {raw}"))
        })?;
        let found = store.request_deletion(&key)?;
        if found {
            println!("deletion requested: {key}");
        } else {
            println!("not found: {key}");
        }
        acted = true;
    }

    if cli.run || cli.quit_after.is_some() {
        let metrics = run_controller(&cfg, store.clone(), cli.quit_after.map(u64::from))?;
        println!(
            "controller idle: delivered={} requeued={} failures={}",
            metrics.delivered, metrics.requeued, metrics.failures
        );
        acted = true;
    }

    if cli.list {
        for recording in store.list_recordings()? {
            let line = serde_json::to_string(&recording)
                .map_err(|e| BlackboxError::Io(e.to_string()))?;
            println!("{line}");
        }
        acted = true;
    }

    if !acted {
        println!("nothing to do (try --apply, --run, or --list)");
    }
    Ok(0)
}

/// Wires the reconciler to the configured remote mode and drains the queue,
/// seeding it from the store's current contents.
pub fn run_controller(
    cfg: &AppConfig,
    store: Arc<ClusterStore>,
    quit_after: Option<u64>,
) -> Result<QueueMetrics, BlackboxError> {
    let clock: Arc<dyn Clock> = Arc::new(ProductionClock);
    let factory: Arc<dyn SessionFactory> = match cfg.remote.mode {
        RemoteMode::Simulated => {
            let agent = SimulatedAgent::new(clock.clone(), "https://blackbox.simulated/files");
            Arc::new(SimulatedSessionFactory::new(agent))
        }
        RemoteMode::External => {
            return Err(BlackboxError::InvalidConfig(
                "remote.mode = \"external\" needs session wiring from the embedding process; \
                 the bundled binary only runs simulated"
                    .to_string(),
            ));
        }
    };

    let recording_store: Arc<dyn RecordingStore> = store.clone();
    let resolver: Arc<dyn TargetResolver> = store.clone();
    let reconciler = Reconciler::new(recording_store, resolver, factory, cfg);

    let queue = ReconcileQueue::new(
        clock,
        Duration::from_millis(cfg.controller.error_backoff_base_ms),
        Duration::from_millis(cfg.controller.error_backoff_cap_ms),
    );
    let keys = store.list_keys()?;
    append_run_log(
        "info",
        "controller.seeded",
        json!({ "keys": keys.len(), "parallelism": cfg.controller.parallelism }),
    );
    for key in keys {
        queue.submit(key);
    }

    Ok(queue.run(
        &reconciler,
        cfg.controller.parallelism as usize,
        quit_after,
    ))
}

pub fn render_help() -> String {
    let mut cmd = Cli::command();
    let mut buffer = Vec::new();
    cmd.write_long_help(&mut buffer).expect("write help to vec");
    String::from_utf8(buffer).expect("utf8")
}
