use crate::config::AppConfig;
use crate::errors::BlackboxError;
use crate::finalizer::FinalizerGuard;
use crate::logging::append_run_log;
use crate::phase::{plan, validate_transition, ReconcilePhase};
use crate::projector;
use crate::runtime::{RecordingStore, SessionClient, SessionFactory, TargetResolver};
use crate::session::{AttachGuard, SessionCache, SessionLockRegistry};
use crate::types::{
    FlightRecorder, Recording, RecordingDescriptor, RecordingState, ResourceKey,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Drives one Recording toward its declared state per invocation. Stateless
/// between invocations apart from the cached agent sessions; safe to share
/// across worker threads.
pub struct Reconciler {
    store: Arc<dyn RecordingStore>,
    resolver: Arc<dyn TargetResolver>,
    factory: Arc<dyn SessionFactory>,
    sessions: SessionCache,
    locks: SessionLockRegistry,
    finalizers: FinalizerGuard,
    active_requeue: Duration,
    target_wait_requeue: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RecordingStore>,
        resolver: Arc<dyn TargetResolver>,
        factory: Arc<dyn SessionFactory>,
        cfg: &AppConfig,
    ) -> Self {
        Self {
            finalizers: FinalizerGuard::new(store.clone(), cfg.remote.finalizer.clone()),
            store,
            resolver,
            factory,
            sessions: SessionCache::new(),
            locks: SessionLockRegistry::new(),
            active_requeue: Duration::from_secs(cfg.controller.active_requeue_seconds),
            target_wait_requeue: Duration::from_secs(cfg.controller.target_wait_requeue_seconds),
        }
    }

    /// Runs one reconciliation. `Ok(Some(d))` asks the queue to re-deliver
    /// the key after `d`; `Ok(None)` means at rest until the next external
    /// change. Every failure is surfaced; nothing is retried here.
    pub fn reconcile(&self, key: &ResourceKey) -> Result<Option<Duration>, BlackboxError> {
        append_run_log("info", "reconcile.started", json!({ "key": key.to_string() }));

        // The controlling agent service is a bootstrap dependency; without
        // it nothing in this namespace can be reconciled.
        let host = self.resolver.controller_service(&key.namespace)?.ok_or_else(|| {
            BlackboxError::Remote(format!(
                "no controlling agent service in namespace {}",
                key.namespace
            ))
        })?;
        let agent_id = host.identity();

        // Cached handle to the controlling agent; reopened only after a
        // failure tore the previous one down.
        let session = self.sessions.acquire(self.factory.as_ref(), &host)?;

        let Some(mut recording) = self.store.get(key)? else {
            append_run_log(
                "debug",
                "reconcile.resource_gone",
                json!({ "key": key.to_string() }),
            );
            return Ok(None);
        };

        let deleting = recording.meta.deletion_requested;
        let has_finalizer = self.finalizers.has(&recording);

        // A marked resource we no longer hold a finalizer on is somebody
        // else's wait; nothing to do and nothing to touch.
        if deleting && !has_finalizer {
            append_run_log(
                "debug",
                "reconcile.delete.no_finalizer",
                json!({ "key": key.to_string() }),
            );
            return Ok(None);
        }

        // Unwinding starts with the archived artifact, before any target
        // resolution can fail the invocation.
        if deleting {
            self.delete_archived_if_present(&recording, session.as_ref(), &agent_id)?;
        }

        let recorder = self.lookup_flight_recorder(&recording)?;
        let Some(recorder) = recorder else {
            if deleting {
                // No recorder means no remote session to clean up.
                append_run_log(
                    "info",
                    "reconcile.delete.no_recorder",
                    json!({ "key": key.to_string() }),
                );
                self.finalizers.remove(&mut recording)?;
            }
            return Ok(None);
        };

        let target_observed = recorder.status.target.is_some();
        let entry_phase = plan(true, target_observed, &recording);
        append_run_log(
            "debug",
            "reconcile.phase",
            json!({ "key": key.to_string(), "phase": entry_phase.as_str() }),
        );

        // A settled recording is at rest; re-observing it would only churn
        // the agent and the store.
        if entry_phase == ReconcilePhase::Settled && has_finalizer {
            append_run_log("debug", "reconcile.settled", json!({ "key": key.to_string() }));
            return Ok(None);
        }

        let Some(target_ref) = recorder.status.target.clone() else {
            // Recorder exists but has not reported a target yet.
            return Ok(Some(self.target_wait_requeue));
        };

        let endpoint = self.resolver.service(&target_ref)?.ok_or_else(|| {
            BlackboxError::Storage(format!(
                "service {}/{} not found",
                target_ref.namespace, target_ref.name
            ))
        })?;

        // With no live backing instance there is nothing to clean up on the
        // remote side; deletion must not wait for one to appear.
        if deleting && self.resolver.ready_instances(&target_ref)? == 0 {
            append_run_log(
                "info",
                "reconcile.delete.unreachable_target",
                json!({ "key": key.to_string(), "target": endpoint.identity() }),
            );
            self.finalizers.remove(&mut recording)?;
            return Ok(None);
        }

        // One caller at a time per agent: hold the agent's lock for the
        // whole attach-act-detach span.
        let gate = self.locks.lock_for(&agent_id);
        let _span = gate.lock().expect("agent lock poisoned");
        let _attach = match AttachGuard::attach(session.clone(), &endpoint, recorder.status.port) {
            Ok(guard) => guard,
            Err(e) => {
                self.sessions.invalidate(&agent_id);
                return Err(e);
            }
        };

        if deleting {
            if let Err(e) = self.delete_live_recording(&recording, session.as_ref(), &agent_id) {
                // Best-effort; the finalizer comes off regardless.
                append_run_log(
                    "warn",
                    "reconcile.delete.live_failed",
                    json!({ "key": key.to_string(), "error": e.to_string() }),
                );
            }
            self.finalizers.remove(&mut recording)?;
            return Ok(None);
        }

        // The finalizer lands before the first remote side effect so a crash
        // cannot orphan a session without its cleanup marker.
        if !has_finalizer {
            self.finalizers.add(&mut recording)?;
        }

        if recording.status.state.is_none() {
            let result = if recording.spec.duration_seconds == 0 {
                append_run_log(
                    "info",
                    "reconcile.create.continuous",
                    json!({
                        "key": key.to_string(),
                        "session": recording.spec.name,
                        "event_options": recording.spec.event_options,
                    }),
                );
                session.start_continuous(&recording.spec.name, &recording.spec.event_options)
            } else {
                append_run_log(
                    "info",
                    "reconcile.create.timed",
                    json!({
                        "key": key.to_string(),
                        "session": recording.spec.name,
                        "duration_seconds": recording.spec.duration_seconds,
                    }),
                );
                session.start_timed(
                    &recording.spec.name,
                    recording.spec.duration_seconds,
                    &recording.spec.event_options,
                )
            };
            if let Err(e) = result {
                self.sessions.invalidate(&agent_id);
                return Err(e);
            }
        } else if should_stop(&recording) {
            append_run_log(
                "info",
                "reconcile.stop",
                json!({ "key": key.to_string(), "session": recording.spec.name }),
            );
            if let Err(e) = session.stop(&recording.spec.name) {
                self.sessions.invalidate(&agent_id);
                return Err(e);
            }
        }

        // Absence from the live list is lag, not an error; status simply
        // stays as it was this round.
        let descriptor =
            self.find_descriptor(session.as_ref(), &agent_id, &recording.spec.name)?;
        if let Some(descriptor) = &descriptor {
            projector::project(&mut recording.status, descriptor)?;
        }

        let is_stopped = recording.status.state == Some(RecordingState::Stopped);
        if recording.spec.archive && recording.status.download_url.is_none() && is_stopped {
            let filename = match session.save_to_storage(&recording.spec.name) {
                Ok(filename) => filename,
                Err(e) => {
                    self.sessions.invalidate(&agent_id);
                    return Err(e);
                }
            };
            if let Some(url) = self.find_download_url(session.as_ref(), &agent_id, &filename)? {
                append_run_log(
                    "info",
                    "reconcile.archive.url_recorded",
                    json!({ "key": key.to_string(), "file": filename, "url": url }),
                );
                recording.status.record_download_url(url);
            }
        }

        recording = self.store.update_status(&recording)?;

        let exit_phase = plan(true, true, &recording);
        validate_transition(entry_phase, exit_phase)?;
        append_run_log(
            "info",
            "reconcile.completed",
            json!({ "key": key.to_string(), "phase": exit_phase.as_str() }),
        );

        if is_stopped {
            Ok(None)
        } else {
            Ok(Some(self.active_requeue))
        }
    }

    fn lookup_flight_recorder(
        &self,
        recording: &Recording,
    ) -> Result<Option<FlightRecorder>, BlackboxError> {
        let Some(name) = recording.spec.flight_recorder.as_deref().filter(|n| !n.is_empty())
        else {
            append_run_log(
                "info",
                "reconcile.recorder_ref_missing",
                json!({ "key": recording.key().to_string() }),
            );
            return Ok(None);
        };

        let recorder = self
            .resolver
            .flight_recorder(&recording.meta.namespace, name)?;
        if recorder.is_none() {
            append_run_log(
                "info",
                "reconcile.recorder_not_found",
                json!({ "key": recording.key().to_string(), "recorder": name }),
            );
        }
        Ok(recorder)
    }

    /// Drops the previously archived artifact, if any. Missing from the
    /// saved list means already gone; that is success.
    fn delete_archived_if_present(
        &self,
        recording: &Recording,
        session: &dyn SessionClient,
        agent_id: &str,
    ) -> Result<(), BlackboxError> {
        let Some(url) = recording.status.download_url.as_deref() else {
            return Ok(());
        };
        let filename = stored_filename(url);

        let saved = match session.list_saved() {
            Ok(saved) => saved,
            Err(e) => {
                self.sessions.invalidate(agent_id);
                return Err(e);
            }
        };
        if saved.iter().any(|entry| entry.name == filename) {
            if let Err(e) = session.delete_saved(&filename) {
                self.sessions.invalidate(agent_id);
                return Err(e);
            }
            append_run_log(
                "info",
                "reconcile.delete.saved_removed",
                json!({ "key": recording.key().to_string(), "file": filename }),
            );
        }
        Ok(())
    }

    fn delete_live_recording(
        &self,
        recording: &Recording,
        session: &dyn SessionClient,
        agent_id: &str,
    ) -> Result<(), BlackboxError> {
        let descriptor =
            self.find_descriptor(session, agent_id, &recording.spec.name)?;
        if descriptor.is_some() {
            if let Err(e) = session.delete_live(&recording.spec.name) {
                self.sessions.invalidate(agent_id);
                return Err(e);
            }
            append_run_log(
                "info",
                "reconcile.delete.live_removed",
                json!({ "key": recording.key().to_string(), "session": recording.spec.name }),
            );
        }
        Ok(())
    }

    fn find_descriptor(
        &self,
        session: &dyn SessionClient,
        agent_id: &str,
        name: &str,
    ) -> Result<Option<RecordingDescriptor>, BlackboxError> {
        let descriptors = match session.list_live() {
            Ok(descriptors) => descriptors,
            Err(e) => {
                self.sessions.invalidate(agent_id);
                return Err(e);
            }
        };
        Ok(descriptors.into_iter().find(|d| d.name == name))
    }

    fn find_download_url(
        &self,
        session: &dyn SessionClient,
        agent_id: &str,
        filename: &str,
    ) -> Result<Option<String>, BlackboxError> {
        let saved = match session.list_saved() {
            Ok(saved) => saved,
            Err(e) => {
                self.sessions.invalidate(agent_id);
                return Err(e);
            }
        };
        Ok(saved
            .into_iter()
            .find(|entry| entry.name == filename)
            .map(|entry| entry.download_url))
    }
}

/// Stop when a terminal state is requested and the session is not already
/// stopped or on its way there.
fn should_stop(recording: &Recording) -> bool {
    let (Some(requested), Some(current)) =
        (recording.spec.requested_state, recording.status.state)
    else {
        return false;
    };
    requested == RecordingState::Stopped
        && current != RecordingState::Stopped
        && current != RecordingState::Stopping
}

/// Last path segment of a download URL, query and fragment stripped.
fn stored_filename(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path).to_string()
}

#[cfg(test)]
mod tests {
    use super::{should_stop, stored_filename};
    use crate::types::{
        Recording, RecordingSpec, RecordingState, RecordingStatus, ResourceMeta,
    };
    use std::collections::BTreeMap;

    fn recording(
        requested: Option<RecordingState>,
        current: Option<RecordingState>,
    ) -> Recording {
        Recording {
            meta: ResourceMeta {
                namespace: "prod".to_string(),
                name: "rec1".to_string(),
                resource_version: 1,
                deletion_requested: false,
                finalizers: Vec::new(),
            },
            spec: RecordingSpec {
                flight_recorder: Some("jfr-1".to_string()),
                name: "rec1".to_string(),
                duration_seconds: 0,
                requested_state: requested,
                event_options: BTreeMap::new(),
                archive: false,
            },
            status: RecordingStatus {
                state: current,
                ..RecordingStatus::default()
            },
        }
    }

    #[test]
    fn stop_fires_only_from_active_states() {
        for current in [RecordingState::Created, RecordingState::Running] {
            assert!(should_stop(&recording(
                Some(RecordingState::Stopped),
                Some(current)
            )));
        }
        for current in [RecordingState::Stopping, RecordingState::Stopped] {
            assert!(!should_stop(&recording(
                Some(RecordingState::Stopped),
                Some(current)
            )));
        }
    }

    #[test]
    fn stop_requires_both_requested_and_observed_state() {
        assert!(!should_stop(&recording(None, Some(RecordingState::Running))));
        assert!(!should_stop(&recording(Some(RecordingState::Stopped), None)));
        assert!(!should_stop(&recording(None, None)));
    }

    #[test]
    fn stored_filename_takes_the_last_path_segment() {
        assert_eq!(
            stored_filename("https://agent:8181/files/rec1.jfr"),
            "rec1.jfr"
        );
        assert_eq!(
            stored_filename("https://agent/files/rec1.jfr?token=abc"),
            "rec1.jfr"
        );
        assert_eq!(stored_filename("rec1.jfr"), "rec1.jfr");
    }
}
