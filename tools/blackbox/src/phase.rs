use crate::errors::BlackboxError;
use crate::types::{Recording, RecordingState};
use serde::{Deserialize, Serialize};

/// The phases an invocation can find a Recording in. Classification is pure;
/// all side effects live in the reconciler's dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePhase {
    /// The namespace's controlling agent service has not been resolved.
    AwaitingHost,
    /// The referenced FlightRecorder has not reported a live target.
    AwaitingTarget,
    /// The deletion marker is set; remote cleanup and finalizer removal run.
    Deleting,
    /// The session is being created, stopped, or observed.
    Syncing,
    /// The session stopped but the requested archive has no download URL yet.
    Archiving,
    /// Nothing left to do until the next external change.
    Settled,
}

impl ReconcilePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingHost => "awaiting_host",
            Self::AwaitingTarget => "awaiting_target",
            Self::Deleting => "deleting",
            Self::Syncing => "syncing",
            Self::Archiving => "archiving",
            Self::Settled => "settled",
        }
    }
}

/// Classifies the phase for one invocation from what has been observed so
/// far. Deletion outranks everything except a missing host; a stopped
/// session with a satisfied (or unrequested) archive is at rest.
pub fn plan(host_available: bool, target_observed: bool, recording: &Recording) -> ReconcilePhase {
    if !host_available {
        return ReconcilePhase::AwaitingHost;
    }
    if recording.meta.deletion_requested {
        return ReconcilePhase::Deleting;
    }
    if !target_observed {
        return ReconcilePhase::AwaitingTarget;
    }
    match recording.status.state {
        Some(RecordingState::Stopped) => {
            if recording.spec.archive && recording.status.download_url.is_none() {
                ReconcilePhase::Archiving
            } else {
                ReconcilePhase::Settled
            }
        }
        _ => ReconcilePhase::Syncing,
    }
}

/// Checks one phase edge. Repeating a phase across invocations is always
/// legal; `Deleting` is terminal.
pub fn validate_transition(
    from: ReconcilePhase,
    to: ReconcilePhase,
) -> Result<(), BlackboxError> {
    use ReconcilePhase as P;

    if from == to {
        return Ok(());
    }

    let allowed = match from {
        P::AwaitingHost => matches!(to, P::AwaitingTarget | P::Deleting | P::Syncing),
        P::AwaitingTarget => matches!(to, P::AwaitingHost | P::Deleting | P::Syncing),
        P::Syncing => matches!(
            to,
            P::AwaitingHost | P::AwaitingTarget | P::Deleting | P::Archiving | P::Settled
        ),
        // A stale stopped status can regress to an observed live state.
        P::Archiving => matches!(to, P::Deleting | P::Settled | P::Syncing),
        P::Settled => matches!(to, P::Deleting),
        P::Deleting => false,
    };

    if !allowed {
        return Err(BlackboxError::Validation(format!(
            "illegal phase transition: {} -> {}",
            from.as_str(),
            to.as_str()
        )));
    }
    Ok(())
}
