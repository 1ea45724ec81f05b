use crate::errors::BlackboxError;
use crate::logging::append_run_log;
use crate::runtime::{SessionClient, SessionFactory};
use crate::types::ServiceEndpoint;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Registry of per-agent locks. Every span that attaches a session to a
/// target must hold the lock for the controlling agent it goes through; the
/// agent supports one effective caller at a time. Unrelated agents proceed
/// in parallel.
#[derive(Default)]
pub struct SessionLockRegistry {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, identity: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock registry poisoned");
        locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

struct CachedSession {
    client: Arc<dyn SessionClient>,
    healthy: bool,
}

/// Session handles cached per controlling agent. A handle is reused across
/// invocations until a remote failure marks it unhealthy; the next
/// acquisition re-opens through the factory instead of retrying the dead
/// handle in place.
#[derive(Default)]
pub struct SessionCache {
    sessions: Mutex<HashMap<String, CachedSession>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(
        &self,
        factory: &dyn SessionFactory,
        host: &ServiceEndpoint,
    ) -> Result<Arc<dyn SessionClient>, BlackboxError> {
        let identity = host.identity();
        let mut sessions = self.sessions.lock().expect("session cache poisoned");

        if let Some(cached) = sessions.get(&identity) {
            if cached.healthy {
                return Ok(cached.client.clone());
            }
        }

        let client: Arc<dyn SessionClient> = Arc::from(factory.open(host)?);
        append_run_log(
            "info",
            "session.opened",
            json!({ "agent": identity, "host": host.host, "port": host.port }),
        );
        sessions.insert(
            identity,
            CachedSession {
                client: client.clone(),
                healthy: true,
            },
        );
        Ok(client)
    }

    /// Marks the agent's cached handle unusable. Called on any remote
    /// operation failure.
    pub fn invalidate(&self, identity: &str) {
        let mut sessions = self.sessions.lock().expect("session cache poisoned");
        if let Some(cached) = sessions.get_mut(identity) {
            cached.healthy = false;
            append_run_log("warn", "session.invalidated", json!({ "agent": identity }));
        }
    }
}

/// Scoped target attachment: `connect` on construction, `disconnect` on
/// every exit path.
pub struct AttachGuard {
    client: Arc<dyn SessionClient>,
}

impl AttachGuard {
    pub fn attach(
        client: Arc<dyn SessionClient>,
        endpoint: &ServiceEndpoint,
        port: u16,
    ) -> Result<Self, BlackboxError> {
        client.connect(endpoint, port)?;
        Ok(Self { client })
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.client.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::{AttachGuard, SessionCache, SessionLockRegistry};
    use crate::runtime::{ScriptedSessionClient, ScriptedSessionFactory, SessionFactory};
    use crate::types::ServiceEndpoint;
    use std::sync::Arc;

    fn host() -> ServiceEndpoint {
        ServiceEndpoint {
            namespace: "prod".to_string(),
            name: "agent".to_string(),
            host: "10.0.0.2".to_string(),
            port: 8181,
        }
    }

    #[test]
    fn healthy_handles_are_reused_across_acquisitions() {
        let client = ScriptedSessionClient::default();
        let factory = ScriptedSessionFactory::new(client);
        let cache = SessionCache::new();

        cache.acquire(&factory, &host()).expect("first");
        cache.acquire(&factory, &host()).expect("second");
        assert_eq!(factory.open_count(), 1);
    }

    #[test]
    fn invalidation_forces_a_reopen_on_next_acquisition() {
        let client = ScriptedSessionClient::default();
        let factory = ScriptedSessionFactory::new(client);
        let cache = SessionCache::new();

        cache.acquire(&factory, &host()).expect("first");
        cache.invalidate(&host().identity());
        cache.acquire(&factory, &host()).expect("reopen");
        assert_eq!(factory.open_count(), 2);
    }

    #[test]
    fn failed_open_is_not_cached() {
        let client = ScriptedSessionClient::default();
        let factory = ScriptedSessionFactory::new(client);
        let cache = SessionCache::new();

        factory.set_fail_open(true);
        cache
            .acquire(&factory, &host())
            .map(|_| ())
            .expect_err("must fail");
        factory.set_fail_open(false);
        cache.acquire(&factory, &host()).expect("recovers");
        assert_eq!(factory.open_count(), 2);
    }

    #[test]
    fn attach_guard_disconnects_on_drop() {
        let client = ScriptedSessionClient::default();
        let factory = ScriptedSessionFactory::new(client.clone());
        let handle = factory.open(&host()).expect("open");

        {
            let _guard = AttachGuard::attach(Arc::from(handle), &host(), 9091).expect("attach");
        }

        let calls = client.calls();
        assert_eq!(calls.first().map(String::as_str), Some("connect prod/agent:9091"));
        assert_eq!(calls.last().map(String::as_str), Some("disconnect"));
    }

    #[test]
    fn registry_hands_out_one_lock_per_agent() {
        let registry = SessionLockRegistry::new();
        let a1 = registry.lock_for("prod/agent");
        let a2 = registry.lock_for("prod/agent");
        let b = registry.lock_for("staging/agent");

        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }
}
