use crate::errors::BlackboxError;
use crate::types::{
    FlightRecorder, Recording, RecordingDescriptor, RecordingState, ResourceKey,
    SavedRecordingDescriptor, ServiceEndpoint, ServiceRef,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn sleep_until(&self, deadline: SystemTime) -> Result<(), BlackboxError>;
}

/// Resource storage with optimistic concurrency. Absence is `None`, never an
/// error; a stale `resource_version` is rejected as `Conflict`.
pub trait RecordingStore: Send + Sync {
    fn get(&self, key: &ResourceKey) -> Result<Option<Recording>, BlackboxError>;
    /// Persists meta + spec (finalizers, deletion marker included) and
    /// returns the stored copy with its bumped `resource_version`.
    fn update(&self, recording: &Recording) -> Result<Recording, BlackboxError>;
    /// Persists status only.
    fn update_status(&self, recording: &Recording) -> Result<Recording, BlackboxError>;
    fn list_keys(&self) -> Result<Vec<ResourceKey>, BlackboxError>;
}

/// Resolution of a Recording's host and target dependencies.
pub trait TargetResolver: Send + Sync {
    /// The controlling agent service for a namespace; the session handle is
    /// opened against this endpoint.
    fn controller_service(&self, namespace: &str)
        -> Result<Option<ServiceEndpoint>, BlackboxError>;
    fn flight_recorder(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<FlightRecorder>, BlackboxError>;
    fn service(&self, target: &ServiceRef) -> Result<Option<ServiceEndpoint>, BlackboxError>;
    /// Number of live backing instances behind the target service.
    fn ready_instances(&self, target: &ServiceRef) -> Result<usize, BlackboxError>;
}

/// One caller session against a controlling agent. Live-session operations
/// require a prior `connect` to a target; saved-storage operations do not.
pub trait SessionClient: Send + Sync {
    fn connect(&self, endpoint: &ServiceEndpoint, port: u16) -> Result<(), BlackboxError>;
    fn disconnect(&self);
    fn start_continuous(
        &self,
        name: &str,
        event_options: &BTreeMap<String, String>,
    ) -> Result<(), BlackboxError>;
    fn start_timed(
        &self,
        name: &str,
        duration_seconds: u64,
        event_options: &BTreeMap<String, String>,
    ) -> Result<(), BlackboxError>;
    fn stop(&self, name: &str) -> Result<(), BlackboxError>;
    fn list_live(&self) -> Result<Vec<RecordingDescriptor>, BlackboxError>;
    /// Persists a live recording to the agent's storage, returning the
    /// stored filename.
    fn save_to_storage(&self, name: &str) -> Result<String, BlackboxError>;
    fn list_saved(&self) -> Result<Vec<SavedRecordingDescriptor>, BlackboxError>;
    fn delete_live(&self, name: &str) -> Result<(), BlackboxError>;
    fn delete_saved(&self, filename: &str) -> Result<(), BlackboxError>;
}

/// Opens session handles. The production wiring for `remote.mode =
/// "external"` is supplied by the embedder; `simulated` mode uses
/// [`SimulatedAgent`].
pub trait SessionFactory: Send + Sync {
    fn open(&self, host: &ServiceEndpoint) -> Result<Box<dyn SessionClient>, BlackboxError>;
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), BlackboxError> {
        let now = SystemTime::now();
        if let Ok(duration) = deadline.duration_since(now) {
            std::thread::sleep(duration);
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
    sleeps: Arc<Mutex<Vec<SystemTime>>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn advance(&self, by: std::time::Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }

    pub fn sleeps(&self) -> Vec<SystemTime> {
        self.sleeps.lock().expect("sleep lock").clone()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), BlackboxError> {
        self.sleeps.lock().expect("sleep lock").push(deadline);
        let mut now = self.now.lock().expect("clock lock");
        if deadline > *now {
            *now = deadline;
        }
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeTargetResolver {
    controllers: Arc<Mutex<HashMap<String, ServiceEndpoint>>>,
    recorders: Arc<Mutex<HashMap<(String, String), FlightRecorder>>>,
    services: Arc<Mutex<HashMap<(String, String), ServiceEndpoint>>>,
    ready: Arc<Mutex<HashMap<(String, String), usize>>>,
}

impl FakeTargetResolver {
    pub fn set_controller(&self, namespace: &str, endpoint: ServiceEndpoint) {
        self.controllers
            .lock()
            .expect("controllers lock")
            .insert(namespace.to_string(), endpoint);
    }

    pub fn set_flight_recorder(&self, recorder: FlightRecorder) {
        self.recorders
            .lock()
            .expect("recorders lock")
            .insert((recorder.namespace.clone(), recorder.name.clone()), recorder);
    }

    pub fn set_service(&self, endpoint: ServiceEndpoint, ready_instances: usize) {
        let id = (endpoint.namespace.clone(), endpoint.name.clone());
        self.ready
            .lock()
            .expect("ready lock")
            .insert(id.clone(), ready_instances);
        self.services.lock().expect("services lock").insert(id, endpoint);
    }
}

impl TargetResolver for FakeTargetResolver {
    fn controller_service(
        &self,
        namespace: &str,
    ) -> Result<Option<ServiceEndpoint>, BlackboxError> {
        Ok(self
            .controllers
            .lock()
            .expect("controllers lock")
            .get(namespace)
            .cloned())
    }

    fn flight_recorder(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<FlightRecorder>, BlackboxError> {
        Ok(self
            .recorders
            .lock()
            .expect("recorders lock")
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    fn service(&self, target: &ServiceRef) -> Result<Option<ServiceEndpoint>, BlackboxError> {
        Ok(self
            .services
            .lock()
            .expect("services lock")
            .get(&(target.namespace.clone(), target.name.clone()))
            .cloned())
    }

    fn ready_instances(&self, target: &ServiceRef) -> Result<usize, BlackboxError> {
        Ok(self
            .ready
            .lock()
            .expect("ready lock")
            .get(&(target.namespace.clone(), target.name.clone()))
            .copied()
            .unwrap_or(0))
    }
}

struct LiveSession {
    name: String,
    state: RecordingState,
    start_time_ms: i64,
    duration_ms: i64,
    event_options: BTreeMap<String, String>,
}

#[derive(Default)]
struct AgentInner {
    live: Vec<LiveSession>,
    saved: Vec<SavedRecordingDescriptor>,
    attached: Option<String>,
}

/// In-process model of one remote profiling agent. Backs `remote.mode =
/// "simulated"` and the integration tests: timed sessions flip to STOPPED
/// once the clock passes their deadline, saves land in a saved-recordings
/// list with a synthetic download URL.
#[derive(Clone)]
pub struct SimulatedAgent {
    inner: Arc<Mutex<AgentInner>>,
    clock: Arc<dyn Clock>,
    base_url: String,
}

impl SimulatedAgent {
    pub fn new(clock: Arc<dyn Clock>, base_url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AgentInner::default())),
            clock,
            base_url: base_url.into(),
        }
    }

    pub fn attached_target(&self) -> Option<String> {
        self.inner.lock().expect("agent lock").attached.clone()
    }

    pub fn live_event_options(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.inner
            .lock()
            .expect("agent lock")
            .live
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.event_options.clone())
    }

    pub fn saved_files(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("agent lock")
            .saved
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    fn now_ms(&self) -> i64 {
        self.clock
            .now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    fn advance_states(inner: &mut AgentInner, now_ms: i64) {
        for session in &mut inner.live {
            let expired = session.duration_ms > 0
                && now_ms >= session.start_time_ms + session.duration_ms;
            if expired && session.state != RecordingState::Stopped {
                session.state = RecordingState::Stopped;
            }
        }
    }
}

impl SessionClient for SimulatedAgent {
    fn connect(&self, endpoint: &ServiceEndpoint, _port: u16) -> Result<(), BlackboxError> {
        let mut inner = self.inner.lock().expect("agent lock");
        inner.attached = Some(endpoint.identity());
        Ok(())
    }

    fn disconnect(&self) {
        let mut inner = self.inner.lock().expect("agent lock");
        inner.attached = None;
    }

    fn start_continuous(
        &self,
        name: &str,
        event_options: &BTreeMap<String, String>,
    ) -> Result<(), BlackboxError> {
        let now_ms = self.now_ms();
        let mut inner = self.inner.lock().expect("agent lock");
        if inner.live.iter().any(|s| s.name == name) {
            return Err(BlackboxError::Remote(format!(
                "recording {name} already exists"
            )));
        }
        inner.live.push(LiveSession {
            name: name.to_string(),
            state: RecordingState::Running,
            start_time_ms: now_ms,
            duration_ms: 0,
            event_options: event_options.clone(),
        });
        Ok(())
    }

    fn start_timed(
        &self,
        name: &str,
        duration_seconds: u64,
        event_options: &BTreeMap<String, String>,
    ) -> Result<(), BlackboxError> {
        let now_ms = self.now_ms();
        let mut inner = self.inner.lock().expect("agent lock");
        if inner.live.iter().any(|s| s.name == name) {
            return Err(BlackboxError::Remote(format!(
                "recording {name} already exists"
            )));
        }
        inner.live.push(LiveSession {
            name: name.to_string(),
            state: RecordingState::Running,
            start_time_ms: now_ms,
            duration_ms: (duration_seconds as i64).saturating_mul(1000),
            event_options: event_options.clone(),
        });
        Ok(())
    }

    fn stop(&self, name: &str) -> Result<(), BlackboxError> {
        let mut inner = self.inner.lock().expect("agent lock");
        let session = inner
            .live
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| BlackboxError::Remote(format!("no recording named {name}")))?;
        session.state = RecordingState::Stopped;
        Ok(())
    }

    fn list_live(&self) -> Result<Vec<RecordingDescriptor>, BlackboxError> {
        let now_ms = self.now_ms();
        let mut inner = self.inner.lock().expect("agent lock");
        SimulatedAgent::advance_states(&mut inner, now_ms);
        Ok(inner
            .live
            .iter()
            .map(|s| RecordingDescriptor {
                name: s.name.clone(),
                state: s.state.as_str().to_string(),
                start_time: s.start_time_ms,
                duration: s.duration_ms,
            })
            .collect())
    }

    fn save_to_storage(&self, name: &str) -> Result<String, BlackboxError> {
        let mut inner = self.inner.lock().expect("agent lock");
        if !inner.live.iter().any(|s| s.name == name) {
            return Err(BlackboxError::Remote(format!("no recording named {name}")));
        }
        let filename = format!("{name}.jfr");
        let download_url = format!("{}/{}", self.base_url, filename);
        if !inner.saved.iter().any(|s| s.name == filename) {
            inner.saved.push(SavedRecordingDescriptor {
                name: filename.clone(),
                download_url,
            });
        }
        Ok(filename)
    }

    fn list_saved(&self) -> Result<Vec<SavedRecordingDescriptor>, BlackboxError> {
        Ok(self.inner.lock().expect("agent lock").saved.clone())
    }

    fn delete_live(&self, name: &str) -> Result<(), BlackboxError> {
        let mut inner = self.inner.lock().expect("agent lock");
        let before = inner.live.len();
        inner.live.retain(|s| s.name != name);
        if inner.live.len() == before {
            return Err(BlackboxError::Remote(format!("no recording named {name}")));
        }
        Ok(())
    }

    fn delete_saved(&self, filename: &str) -> Result<(), BlackboxError> {
        let mut inner = self.inner.lock().expect("agent lock");
        let before = inner.saved.len();
        inner.saved.retain(|s| s.name != filename);
        if inner.saved.len() == before {
            return Err(BlackboxError::Remote(format!("no saved file {filename}")));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct SimulatedSessionFactory {
    agent: SimulatedAgent,
}

impl SimulatedSessionFactory {
    pub fn new(agent: SimulatedAgent) -> Self {
        Self { agent }
    }
}

impl SessionFactory for SimulatedSessionFactory {
    fn open(&self, _host: &ServiceEndpoint) -> Result<Box<dyn SessionClient>, BlackboxError> {
        Ok(Box::new(self.agent.clone()))
    }
}

/// Scripted stand-in for a session client: records every call, serves
/// canned descriptor lists, and fails the operations it is told to fail.
#[derive(Default, Clone)]
pub struct ScriptedSessionClient {
    calls: Arc<Mutex<Vec<String>>>,
    live: Arc<Mutex<Vec<RecordingDescriptor>>>,
    saved: Arc<Mutex<Vec<SavedRecordingDescriptor>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl ScriptedSessionClient {
    pub fn set_live(&self, descriptors: Vec<RecordingDescriptor>) {
        *self.live.lock().expect("live lock") = descriptors;
    }

    pub fn set_saved(&self, descriptors: Vec<SavedRecordingDescriptor>) {
        *self.saved.lock().expect("saved lock") = descriptors;
    }

    pub fn fail_on(&self, op: &str) {
        self.failing
            .lock()
            .expect("failing lock")
            .insert(op.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, call: String, op: &str) -> Result<(), BlackboxError> {
        self.calls.lock().expect("calls lock").push(call);
        if self.failing.lock().expect("failing lock").contains(op) {
            return Err(BlackboxError::Remote(format!("scripted failure: {op}")));
        }
        Ok(())
    }
}

impl SessionClient for ScriptedSessionClient {
    fn connect(&self, endpoint: &ServiceEndpoint, port: u16) -> Result<(), BlackboxError> {
        self.record(format!("connect {}:{port}", endpoint.identity()), "connect")
    }

    fn disconnect(&self) {
        self.calls
            .lock()
            .expect("calls lock")
            .push("disconnect".to_string());
    }

    fn start_continuous(
        &self,
        name: &str,
        _event_options: &BTreeMap<String, String>,
    ) -> Result<(), BlackboxError> {
        self.record(format!("start_continuous {name}"), "start_continuous")
    }

    fn start_timed(
        &self,
        name: &str,
        duration_seconds: u64,
        _event_options: &BTreeMap<String, String>,
    ) -> Result<(), BlackboxError> {
        self.record(
            format!("start_timed {name} {duration_seconds}"),
            "start_timed",
        )
    }

    fn stop(&self, name: &str) -> Result<(), BlackboxError> {
        self.record(format!("stop {name}"), "stop")
    }

    fn list_live(&self) -> Result<Vec<RecordingDescriptor>, BlackboxError> {
        self.record("list_live".to_string(), "list_live")?;
        Ok(self.live.lock().expect("live lock").clone())
    }

    fn save_to_storage(&self, name: &str) -> Result<String, BlackboxError> {
        self.record(format!("save {name}"), "save")?;
        Ok(format!("{name}.jfr"))
    }

    fn list_saved(&self) -> Result<Vec<SavedRecordingDescriptor>, BlackboxError> {
        self.record("list_saved".to_string(), "list_saved")?;
        Ok(self.saved.lock().expect("saved lock").clone())
    }

    fn delete_live(&self, name: &str) -> Result<(), BlackboxError> {
        self.record(format!("delete_live {name}"), "delete_live")
    }

    fn delete_saved(&self, filename: &str) -> Result<(), BlackboxError> {
        self.record(format!("delete_saved {filename}"), "delete_saved")
    }
}

#[derive(Clone)]
pub struct ScriptedSessionFactory {
    client: ScriptedSessionClient,
    opens: Arc<Mutex<u32>>,
    fail_open: Arc<Mutex<bool>>,
}

impl ScriptedSessionFactory {
    pub fn new(client: ScriptedSessionClient) -> Self {
        Self {
            client,
            opens: Arc::new(Mutex::new(0)),
            fail_open: Arc::new(Mutex::new(false)),
        }
    }

    pub fn open_count(&self) -> u32 {
        *self.opens.lock().expect("opens lock")
    }

    pub fn set_fail_open(&self, fail: bool) {
        *self.fail_open.lock().expect("fail lock") = fail;
    }
}

impl SessionFactory for ScriptedSessionFactory {
    fn open(&self, host: &ServiceEndpoint) -> Result<Box<dyn SessionClient>, BlackboxError> {
        *self.opens.lock().expect("opens lock") += 1;
        if *self.fail_open.lock().expect("fail lock") {
            return Err(BlackboxError::Remote(format!(
                "cannot reach controlling agent {}",
                host.identity()
            )));
        }
        Ok(Box::new(self.client.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, FakeClock, SessionClient, SimulatedAgent};
    use crate::types::ServiceEndpoint;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn endpoint(name: &str) -> ServiceEndpoint {
        ServiceEndpoint {
            namespace: "prod".to_string(),
            name: name.to_string(),
            host: "10.0.0.1".to_string(),
            port: 9091,
        }
    }

    #[test]
    fn timed_sessions_stop_once_the_clock_passes_their_deadline() {
        let clock = FakeClock::default();
        let agent = SimulatedAgent::new(Arc::new(clock.clone()), "https://agent/files");
        agent.connect(&endpoint("svc"), 9091).expect("connect");
        agent
            .start_timed("rec1", 30, &BTreeMap::new())
            .expect("start");

        let live = agent.list_live().expect("list");
        assert_eq!(live[0].state, "RUNNING");

        clock.advance(Duration::from_secs(31));
        let live = agent.list_live().expect("list");
        assert_eq!(live[0].state, "STOPPED");
        assert_eq!(live[0].duration, 30_000);
    }

    #[test]
    fn save_produces_a_download_url_and_is_idempotent() {
        let clock = FakeClock::default();
        let agent = SimulatedAgent::new(Arc::new(clock), "https://agent/files");
        agent
            .start_continuous("rec1", &BTreeMap::new())
            .expect("start");

        let filename = agent.save_to_storage("rec1").expect("save");
        assert_eq!(filename, "rec1.jfr");
        let again = agent.save_to_storage("rec1").expect("save again");
        assert_eq!(again, "rec1.jfr");

        let saved = agent.list_saved().expect("saved");
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].download_url, "https://agent/files/rec1.jfr");
    }

    #[test]
    fn stopping_an_unknown_session_is_a_remote_error() {
        let agent = SimulatedAgent::new(Arc::new(FakeClock::default()), "https://agent");
        let err = agent.stop("ghost").expect_err("must fail");
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn fake_clock_advances_to_sleep_deadlines() {
        let clock = FakeClock::default();
        let deadline = clock.now() + Duration::from_secs(5);
        clock.sleep_until(deadline).expect("sleep");
        assert_eq!(clock.now(), deadline);
        assert_eq!(clock.sleeps(), vec![deadline]);
    }
}
