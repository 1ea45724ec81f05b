use crate::errors::BlackboxError;
use crate::types::{RecordingDescriptor, RecordingState, RecordingStatus};

/// Maps a raw remote state string through the fixed enumeration. Anything
/// outside the allow-list is a hard validation failure, never coerced.
pub fn validate_state(raw: &str) -> Result<RecordingState, BlackboxError> {
    RecordingState::parse_raw(raw)
        .ok_or_else(|| BlackboxError::Validation(format!("unknown recording state {raw}")))
}

/// Overwrites the observed fields of `status` from a live descriptor. The
/// download URL is owned by the archive flow and is never touched here. On a
/// validation failure `status` is left exactly as it was.
pub fn project(
    status: &mut RecordingStatus,
    descriptor: &RecordingDescriptor,
) -> Result<RecordingState, BlackboxError> {
    let state = validate_state(&descriptor.state)?;
    status.state = Some(state);
    status.start_time_ms = Some(descriptor.start_time);
    status.duration_ms = Some(descriptor.duration);
    Ok(state)
}
