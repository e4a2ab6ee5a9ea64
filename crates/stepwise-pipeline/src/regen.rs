use stepwise_core::{GuidanceTarget, JobPayload, StepwiseError};

use crate::store::Store;

/// Validate a guidance regeneration request and return the payload to
/// re-enqueue.
///
/// Only the user who created the session may regenerate its guidance; the
/// previous record stays visible until the replacement is persisted.
///
/// # Errors
///
/// [`StepwiseError::Unauthorized`] when `requested_by` is not the session
/// creator, [`StepwiseError::NotFound`] when the target does not resolve
/// to a known session or step.
pub fn request_regeneration<S: Store>(
    store: &S,
    requested_by: &str,
    target: GuidanceTarget,
) -> Result<JobPayload, StepwiseError> {
    let session_id = match target {
        GuidanceTarget::Session(id) => id,
        GuidanceTarget::Step(step_id) => store.step(step_id)?.session_id,
    };
    let session = store.session(session_id)?;
    if session.created_by != requested_by {
        return Err(StepwiseError::Unauthorized(format!(
            "only {} may regenerate guidance for session {}",
            session.created_by, session.id
        )));
    }
    Ok(JobPayload::GenerateAiGuidance { target })
}
