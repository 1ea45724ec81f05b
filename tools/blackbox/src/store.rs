use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::errors::BlackboxError;
use crate::logging::append_run_log;
use crate::runtime::{RecordingStore, TargetResolver};
use crate::types::{
    FlightRecorder, FlightRecorderStatus, Recording, RecordingSpec, RecordingStatus, ResourceKey,
    ResourceMeta, ServiceEndpoint, ServiceRef,
};

const READ_POOL_SIZE: usize = 2;

type StoreResult<T> = Result<T, BlackboxError>;

/// A service row applied from a manifest. `controller` marks the namespace's
/// controlling agent service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub namespace: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub ready_instances: usize,
    pub controller: bool,
}

#[derive(Debug)]
enum WriteCmd {
    UpsertRecording {
        namespace: String,
        name: String,
        spec: RecordingSpec,
        now: i64,
        reply: oneshot::Sender<StoreResult<Recording>>,
    },
    Update {
        recording: Box<Recording>,
        now: i64,
        reply: oneshot::Sender<StoreResult<Recording>>,
    },
    UpdateStatus {
        recording: Box<Recording>,
        now: i64,
        reply: oneshot::Sender<StoreResult<Recording>>,
    },
    RequestDeletion {
        key: ResourceKey,
        now: i64,
        reply: oneshot::Sender<StoreResult<bool>>,
    },
    UpsertFlightRecorder {
        recorder: FlightRecorder,
        now: i64,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    UpsertService {
        service: ServiceRecord,
        now: i64,
        reply: oneshot::Sender<StoreResult<()>>,
    },
}

/// Sqlite-backed cluster state: recordings plus the read-only companion
/// resources (flight recorders, services) the resolver answers from.
/// Writes funnel through a single writer thread; reads go to a small pool
/// of read-only connections.
pub struct ClusterStore {
    write_tx: Option<mpsc::Sender<WriteCmd>>,
    read_pool: ReadPool,
    writer_join: Option<thread::JoinHandle<()>>,
    db_path: PathBuf,
}

impl Drop for ClusterStore {
    fn drop(&mut self) {
        // Close the sender first so the writer loop exits.
        drop(self.write_tx.take());
        if let Some(handle) = self.writer_join.take() {
            let _ = handle.join();
        }
    }
}

impl ClusterStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| BlackboxError::Storage(e.to_string()))?;
        }

        let existed_before_open = path.exists();

        // Zero-byte files indicate prior corruption.
        if existed_before_open {
            let meta = std::fs::metadata(&path)
                .map_err(|e| BlackboxError::Storage(e.to_string()))?;
            if meta.len() == 0 {
                return Err(BlackboxError::Storage(format!(
                    "cluster database is 0 bytes (corrupt): {}",
                    path.display()
                )));
            }
        }

        let mut write_conn = Connection::open(&path).map_err(db_err)?;
        configure_write_connection(&write_conn)?;

        if existed_before_open {
            let integrity: String = write_conn
                .pragma_query_value(None, "quick_check", |row| row.get(0))
                .map_err(db_err)?;
            if integrity != "ok" {
                return Err(BlackboxError::Storage(format!(
                    "cluster database failed integrity check: {integrity}"
                )));
            }
        }

        run_migrations(&mut write_conn)?;

        let (write_tx, mut write_rx) = mpsc::channel(64);
        let writer_join = thread::spawn(move || {
            while let Some(cmd) = write_rx.blocking_recv() {
                match cmd {
                    WriteCmd::UpsertRecording {
                        namespace,
                        name,
                        spec,
                        now,
                        reply,
                    } => {
                        let result = upsert_recording(&write_conn, &namespace, &name, &spec, now);
                        let _ = reply.send(result);
                    }
                    WriteCmd::Update {
                        recording,
                        now,
                        reply,
                    } => {
                        let result = update_recording(&write_conn, &recording, now);
                        let _ = reply.send(result);
                    }
                    WriteCmd::UpdateStatus {
                        recording,
                        now,
                        reply,
                    } => {
                        let result = update_recording_status(&write_conn, &recording, now);
                        let _ = reply.send(result);
                    }
                    WriteCmd::RequestDeletion { key, now, reply } => {
                        let result = request_deletion(&write_conn, &key, now);
                        let _ = reply.send(result);
                    }
                    WriteCmd::UpsertFlightRecorder {
                        recorder,
                        now,
                        reply,
                    } => {
                        let result = upsert_flight_recorder(&write_conn, &recorder, now);
                        let _ = reply.send(result);
                    }
                    WriteCmd::UpsertService {
                        service,
                        now,
                        reply,
                    } => {
                        let result = upsert_service(&write_conn, &service, now);
                        let _ = reply.send(result);
                    }
                }
            }
        });

        let read_pool = ReadPool::open(&path, READ_POOL_SIZE)?;
        let store = Self {
            write_tx: Some(write_tx),
            read_pool,
            writer_join: Some(writer_join),
            db_path: path.clone(),
        };

        append_run_log(
            "info",
            "cluster_store.opened",
            json!({ "path": path.display().to_string() }),
        );
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn sender(&self) -> StoreResult<&mpsc::Sender<WriteCmd>> {
        self.write_tx
            .as_ref()
            .ok_or_else(|| BlackboxError::Storage("store is closed".to_string()))
    }

    fn write<T: Send + 'static>(
        &self,
        build: impl FnOnce(oneshot::Sender<StoreResult<T>>) -> WriteCmd,
    ) -> StoreResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender()?
            .blocking_send(build(reply_tx))
            .map_err(|e| BlackboxError::Storage(e.to_string()))?;
        reply_rx
            .blocking_recv()
            .map_err(|e| BlackboxError::Storage(e.to_string()))?
    }

    /// Creates or replaces the user-supplied spec for a recording. Status,
    /// finalizers, and the deletion marker of an existing row are preserved.
    pub fn upsert_recording(
        &self,
        namespace: &str,
        name: &str,
        spec: RecordingSpec,
    ) -> StoreResult<Recording> {
        let now = system_time_unix();
        let namespace = namespace.to_string();
        let name = name.to_string();
        self.write(move |reply| WriteCmd::UpsertRecording {
            namespace,
            name,
            spec,
            now,
            reply,
        })
    }

    /// Sets the deletion marker. Rows with no finalizer are removed at once;
    /// the rest wait for the controller to unwind remote state. Returns false
    /// when the recording does not exist.
    pub fn request_deletion(&self, key: &ResourceKey) -> StoreResult<bool> {
        let now = system_time_unix();
        let key = key.clone();
        self.write(move |reply| WriteCmd::RequestDeletion { key, now, reply })
    }

    pub fn upsert_flight_recorder(&self, recorder: FlightRecorder) -> StoreResult<()> {
        let now = system_time_unix();
        self.write(move |reply| WriteCmd::UpsertFlightRecorder {
            recorder,
            now,
            reply,
        })
    }

    pub fn upsert_service(&self, service: ServiceRecord) -> StoreResult<()> {
        let now = system_time_unix();
        self.write(move |reply| WriteCmd::UpsertService {
            service,
            now,
            reply,
        })
    }

    pub fn list_recordings(&self) -> StoreResult<Vec<Recording>> {
        self.read_pool.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT namespace, name, resource_version, deletion_requested, finalizers, \
                     spec, status FROM recordings ORDER BY namespace, name",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], row_to_recording)
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows.into_iter().collect()
        })
    }
}

impl RecordingStore for ClusterStore {
    fn get(&self, key: &ResourceKey) -> StoreResult<Option<Recording>> {
        self.read_pool.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT namespace, name, resource_version, deletion_requested, finalizers, \
                     spec, status FROM recordings WHERE namespace = ?1 AND name = ?2",
                    params![key.namespace, key.name],
                    row_to_recording,
                )
                .optional()
                .map_err(db_err)?;
            row.transpose()
        })
    }

    fn update(&self, recording: &Recording) -> StoreResult<Recording> {
        let now = system_time_unix();
        let recording = Box::new(recording.clone());
        self.write(move |reply| WriteCmd::Update {
            recording,
            now,
            reply,
        })
    }

    fn update_status(&self, recording: &Recording) -> StoreResult<Recording> {
        let now = system_time_unix();
        let recording = Box::new(recording.clone());
        self.write(move |reply| WriteCmd::UpdateStatus {
            recording,
            now,
            reply,
        })
    }

    fn list_keys(&self) -> StoreResult<Vec<ResourceKey>> {
        self.read_pool.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT namespace, name FROM recordings ORDER BY namespace, name")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ResourceKey::new(
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                    ))
                })
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }
}

impl TargetResolver for ClusterStore {
    fn controller_service(&self, namespace: &str) -> StoreResult<Option<ServiceEndpoint>> {
        self.read_pool.with_conn(|conn| {
            conn.query_row(
                "SELECT namespace, name, host, port FROM services \
                 WHERE namespace = ?1 AND is_controller = 1",
                params![namespace],
                row_to_endpoint,
            )
            .optional()
            .map_err(db_err)
        })
    }

    fn flight_recorder(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<FlightRecorder>> {
        self.read_pool.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT namespace, name, status FROM flight_recorders \
                     WHERE namespace = ?1 AND name = ?2",
                    params![namespace, name],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()
                .map_err(db_err)?;
            match row {
                None => Ok(None),
                Some((namespace, name, status)) => {
                    let status: FlightRecorderStatus = serde_json::from_str(&status)
                        .map_err(|e| BlackboxError::Storage(e.to_string()))?;
                    Ok(Some(FlightRecorder {
                        namespace,
                        name,
                        status,
                    }))
                }
            }
        })
    }

    fn service(&self, target: &ServiceRef) -> StoreResult<Option<ServiceEndpoint>> {
        self.read_pool.with_conn(|conn| {
            conn.query_row(
                "SELECT namespace, name, host, port FROM services \
                 WHERE namespace = ?1 AND name = ?2",
                params![target.namespace, target.name],
                row_to_endpoint,
            )
            .optional()
            .map_err(db_err)
        })
    }

    fn ready_instances(&self, target: &ServiceRef) -> StoreResult<usize> {
        self.read_pool.with_conn(|conn| {
            let count = conn
                .query_row(
                    "SELECT ready_instances FROM services WHERE namespace = ?1 AND name = ?2",
                    params![target.namespace, target.name],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
                .map_err(db_err)?;
            Ok(count.unwrap_or(0).max(0) as usize)
        })
    }
}

struct ReadPool {
    conns: Arc<Vec<Mutex<Connection>>>,
    next: Arc<AtomicUsize>,
}

impl ReadPool {
    fn open(path: &Path, size: usize) -> StoreResult<Self> {
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .map_err(db_err)?;
            conn.busy_timeout(std::time::Duration::from_secs(3))
                .map_err(db_err)?;
            conns.push(Mutex::new(conn));
        }

        Ok(Self {
            conns: Arc::new(conns),
            next: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        let guard = self.conns[idx]
            .lock()
            .map_err(|_| BlackboxError::Storage("read connection lock poisoned".to_string()))?;
        f(&guard)
    }
}

fn configure_write_connection(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(db_err)?;
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(db_err)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(db_err)?;
    Ok(())
}

fn run_migrations(conn: &mut Connection) -> StoreResult<()> {
    let migrations = [(1_i64, include_str!("../migrations/0001_cluster.sql"))];

    conn.execute_batch(
        "BEGIN IMMEDIATE; CREATE TABLE IF NOT EXISTS schema_migrations \
         (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL); COMMIT;",
    )
    .map_err(db_err)?;

    for (version, sql) in migrations {
        let exists = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?
            .is_some();

        if exists {
            continue;
        }

        append_run_log(
            "info",
            "cluster_store.migration.applying",
            json!({ "version": version }),
        );
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(sql).map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, system_time_unix()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
    }

    Ok(())
}

fn row_to_recording(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreResult<Recording>> {
    let namespace: String = row.get(0)?;
    let name: String = row.get(1)?;
    let resource_version: i64 = row.get(2)?;
    let deletion_requested: bool = row.get(3)?;
    let finalizers: String = row.get(4)?;
    let spec: String = row.get(5)?;
    let status: String = row.get(6)?;

    Ok(decode_recording(
        namespace,
        name,
        resource_version,
        deletion_requested,
        &finalizers,
        &spec,
        &status,
    ))
}

fn decode_recording(
    namespace: String,
    name: String,
    resource_version: i64,
    deletion_requested: bool,
    finalizers: &str,
    spec: &str,
    status: &str,
) -> StoreResult<Recording> {
    let finalizers: Vec<String> =
        serde_json::from_str(finalizers).map_err(|e| BlackboxError::Storage(e.to_string()))?;
    let spec: RecordingSpec =
        serde_json::from_str(spec).map_err(|e| BlackboxError::Storage(e.to_string()))?;
    let status: RecordingStatus =
        serde_json::from_str(status).map_err(|e| BlackboxError::Storage(e.to_string()))?;
    Ok(Recording {
        meta: ResourceMeta {
            namespace,
            name,
            resource_version: resource_version.max(0) as u64,
            deletion_requested,
            finalizers,
        },
        spec,
        status,
    })
}

fn row_to_endpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<ServiceEndpoint> {
    Ok(ServiceEndpoint {
        namespace: row.get(0)?,
        name: row.get(1)?,
        host: row.get(2)?,
        port: row.get::<_, i64>(3)?.clamp(0, i64::from(u16::MAX)) as u16,
    })
}

fn encode<T: serde::Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| BlackboxError::Storage(e.to_string()))
}

fn upsert_recording(
    conn: &Connection,
    namespace: &str,
    name: &str,
    spec: &RecordingSpec,
    now: i64,
) -> StoreResult<Recording> {
    let spec_json = encode(spec)?;
    let existing = conn
        .query_row(
            "SELECT resource_version FROM recordings WHERE namespace = ?1 AND name = ?2",
            params![namespace, name],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(db_err)?;

    match existing {
        Some(current) => {
            conn.execute(
                "UPDATE recordings SET resource_version = ?1, spec = ?2, updated_at = ?3 \
                 WHERE namespace = ?4 AND name = ?5",
                params![current + 1, spec_json, now, namespace, name],
            )
            .map_err(db_err)?;
        }
        None => {
            conn.execute(
                "INSERT INTO recordings (namespace, name, resource_version, deletion_requested, \
                 finalizers, spec, status, updated_at) VALUES (?1, ?2, 1, 0, '[]', ?3, ?4, ?5)",
                params![namespace, name, spec_json, encode(&RecordingStatus::default())?, now],
            )
            .map_err(db_err)?;
        }
    }

    append_run_log(
        "info",
        "cluster_store.recording.applied",
        json!({ "namespace": namespace, "name": name, "session": spec.name }),
    );
    fetch_recording(conn, namespace, name)?.ok_or_else(|| {
        BlackboxError::Storage("recording row missing after upsert".to_string())
    })
}

fn fetch_recording(
    conn: &Connection,
    namespace: &str,
    name: &str,
) -> StoreResult<Option<Recording>> {
    let row = conn
        .query_row(
            "SELECT namespace, name, resource_version, deletion_requested, finalizers, spec, \
             status FROM recordings WHERE namespace = ?1 AND name = ?2",
            params![namespace, name],
            row_to_recording,
        )
        .optional()
        .map_err(db_err)?;
    row.transpose()
}

fn stale_write_error(
    conn: &Connection,
    recording: &Recording,
) -> BlackboxError {
    let current = conn
        .query_row(
            "SELECT resource_version FROM recordings WHERE namespace = ?1 AND name = ?2",
            params![recording.meta.namespace, recording.meta.name],
            |row| row.get::<_, i64>(0),
        )
        .optional();
    match current {
        Ok(Some(version)) => BlackboxError::Conflict(format!(
            "recording {} is at version {version}, write carried {}",
            recording.key(),
            recording.meta.resource_version
        )),
        Ok(None) => BlackboxError::Storage(format!("recording {} not found", recording.key())),
        Err(e) => db_err(e),
    }
}

fn update_recording(conn: &Connection, recording: &Recording, now: i64) -> StoreResult<Recording> {
    let next = recording.meta.resource_version as i64 + 1;
    let changed = conn
        .execute(
            "UPDATE recordings SET resource_version = ?1, deletion_requested = ?2, \
             finalizers = ?3, spec = ?4, updated_at = ?5 \
             WHERE namespace = ?6 AND name = ?7 AND resource_version = ?8",
            params![
                next,
                recording.meta.deletion_requested,
                encode(&recording.meta.finalizers)?,
                encode(&recording.spec)?,
                now,
                recording.meta.namespace,
                recording.meta.name,
                recording.meta.resource_version as i64,
            ],
        )
        .map_err(db_err)?;
    if changed == 0 {
        return Err(stale_write_error(conn, recording));
    }

    let mut stored = recording.clone();
    stored.meta.resource_version = next.max(0) as u64;

    // The store removes a marked row once its finalizer list empties.
    if stored.meta.deletion_requested && stored.meta.finalizers.is_empty() {
        conn.execute(
            "DELETE FROM recordings WHERE namespace = ?1 AND name = ?2",
            params![stored.meta.namespace, stored.meta.name],
        )
        .map_err(db_err)?;
        append_run_log(
            "info",
            "cluster_store.recording.removed",
            json!({ "key": stored.key().to_string() }),
        );
    }

    Ok(stored)
}

fn update_recording_status(
    conn: &Connection,
    recording: &Recording,
    now: i64,
) -> StoreResult<Recording> {
    let next = recording.meta.resource_version as i64 + 1;
    let changed = conn
        .execute(
            "UPDATE recordings SET resource_version = ?1, status = ?2, updated_at = ?3 \
             WHERE namespace = ?4 AND name = ?5 AND resource_version = ?6",
            params![
                next,
                encode(&recording.status)?,
                now,
                recording.meta.namespace,
                recording.meta.name,
                recording.meta.resource_version as i64,
            ],
        )
        .map_err(db_err)?;
    if changed == 0 {
        return Err(stale_write_error(conn, recording));
    }

    let mut stored = recording.clone();
    stored.meta.resource_version = next.max(0) as u64;
    Ok(stored)
}

fn request_deletion(conn: &Connection, key: &ResourceKey, now: i64) -> StoreResult<bool> {
    let row = conn
        .query_row(
            "SELECT resource_version, finalizers FROM recordings \
             WHERE namespace = ?1 AND name = ?2",
            params![key.namespace, key.name],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()
        .map_err(db_err)?;

    let Some((version, finalizers)) = row else {
        return Ok(false);
    };
    let finalizers: Vec<String> =
        serde_json::from_str(&finalizers).map_err(|e| BlackboxError::Storage(e.to_string()))?;

    if finalizers.is_empty() {
        conn.execute(
            "DELETE FROM recordings WHERE namespace = ?1 AND name = ?2",
            params![key.namespace, key.name],
        )
        .map_err(db_err)?;
        append_run_log(
            "info",
            "cluster_store.recording.removed",
            json!({ "key": key.to_string() }),
        );
        return Ok(true);
    }

    conn.execute(
        "UPDATE recordings SET resource_version = ?1, deletion_requested = 1, updated_at = ?2 \
         WHERE namespace = ?3 AND name = ?4",
        params![version + 1, now, key.namespace, key.name],
    )
    .map_err(db_err)?;
    append_run_log(
        "info",
        "cluster_store.recording.deletion_requested",
        json!({ "key": key.to_string() }),
    );
    Ok(true)
}

fn upsert_flight_recorder(
    conn: &Connection,
    recorder: &FlightRecorder,
    now: i64,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO flight_recorders (namespace, name, status, updated_at) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT (namespace, name) DO UPDATE SET status = ?3, updated_at = ?4",
        params![recorder.namespace, recorder.name, encode(&recorder.status)?, now],
    )
    .map_err(db_err)?;
    Ok(())
}

fn upsert_service(conn: &Connection, service: &ServiceRecord, now: i64) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO services (namespace, name, host, port, ready_instances, is_controller, \
         updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         ON CONFLICT (namespace, name) DO UPDATE SET host = ?3, port = ?4, \
         ready_instances = ?5, is_controller = ?6, updated_at = ?7",
        params![
            service.namespace,
            service.name,
            service.host,
            i64::from(service.port),
            service.ready_instances as i64,
            service.controller,
            now,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn db_err(error: rusqlite::Error) -> BlackboxError {
    BlackboxError::Storage(error.to_string())
}

pub fn system_time_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
