use crate::errors::BlackboxError;
use crate::logging::append_run_log;
use crate::runtime::RecordingStore;
use crate::types::Recording;
use serde_json::json;
use std::sync::Arc;

/// Manages the cleanup marker that gates a Recording's removal from storage.
/// Value-level idempotent, but every call issues a store write; callers
/// check `has` first to limit store churn.
pub struct FinalizerGuard {
    store: Arc<dyn RecordingStore>,
    token: String,
}

impl FinalizerGuard {
    pub fn new(store: Arc<dyn RecordingStore>, token: impl Into<String>) -> Self {
        Self {
            store,
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn has(&self, recording: &Recording) -> bool {
        recording
            .meta
            .finalizers
            .iter()
            .any(|finalizer| finalizer == &self.token)
    }

    /// Appends the token if absent and persists. `recording` is replaced by
    /// the stored copy so later writes carry the current version.
    pub fn add(&self, recording: &mut Recording) -> Result<(), BlackboxError> {
        if !self.has(recording) {
            append_run_log(
                "info",
                "finalizer.added",
                json!({ "key": recording.key().to_string(), "token": self.token }),
            );
            recording.meta.finalizers.push(self.token.clone());
        }
        *recording = self.store.update(recording)?;
        Ok(())
    }

    /// Removes exactly one matching token (by value) and persists.
    pub fn remove(&self, recording: &mut Recording) -> Result<(), BlackboxError> {
        if let Some(idx) = recording
            .meta
            .finalizers
            .iter()
            .position(|finalizer| finalizer == &self.token)
        {
            recording.meta.finalizers.remove(idx);
            append_run_log(
                "info",
                "finalizer.removed",
                json!({ "key": recording.key().to_string(), "token": self.token }),
            );
        }
        *recording = self.store.update(recording)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::FinalizerGuard;
    use crate::runtime::RecordingStore;
    use crate::store::ClusterStore;
    use crate::types::{RecordingSpec, ResourceKey};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (Arc<ClusterStore>, FinalizerGuard, TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(ClusterStore::open(dir.path().join("cluster.sqlite")).expect("open"));
        let guard = FinalizerGuard::new(store.clone(), "recording.finalizer.test");
        (store, guard, dir)
    }

    fn seed(store: &ClusterStore) -> crate::types::Recording {
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
                    archive: false,
                },
            )
            .expect("seed")
    }

    #[test]
    fn add_is_idempotent_at_the_value_level_but_always_writes() {
        let (store, guard, _dir) = setup();
        let mut recording = seed(&store);

        guard.add(&mut recording).expect("first add");
        let first_version = recording.meta.resource_version;
        assert!(guard.has(&recording));

        guard.add(&mut recording).expect("second add");
        assert_eq!(
            recording.meta.finalizers,
            vec!["recording.finalizer.test".to_string()]
        );
        assert_eq!(recording.meta.resource_version, first_version + 1);
    }

    #[test]
    fn remove_deletes_exactly_one_matching_token() {
        let (store, guard, _dir) = setup();
        let mut recording = seed(&store);
        recording
            .meta
            .finalizers
            .push("recording.finalizer.test".to_string());
        recording
            .meta
            .finalizers
            .push("other.finalizer".to_string());
        recording = store.update(&recording).expect("seed finalizers");

        guard.remove(&mut recording).expect("remove");
        assert_eq!(
            recording.meta.finalizers,
            vec!["other.finalizer".to_string()]
        );

        guard.remove(&mut recording).expect("second remove");
        assert_eq!(
            recording.meta.finalizers,
            vec!["other.finalizer".to_string()]
        );
    }
}
