use chrono::Utc;
use uuid::Uuid;

use stepwise_core::{ContextPack, Guidance, GuidanceTarget, ReviewStep, RiskLevel, StepwiseError};

use crate::client::GuidanceModel;
use crate::prompt;

/// Summary recorded when the model never produced a usable reply.
const UNAVAILABLE_SUMMARY: &str = "AI guidance unavailable";

/// Generate guidance for one step.
///
/// The model gets the step's diff plus its context pack. A malformed reply
/// is retried once with a reformat instruction; if that reply is malformed
/// too, a placeholder guidance with [`RiskLevel::Unknown`] is returned.
/// Transport failures still surface as errors so the job queue can retry
/// the whole stage.
///
/// # Errors
///
/// Returns [`StepwiseError::ModelUnavailable`] only for transport-level
/// failures (connection, timeout, HTTP error status).
pub async fn generate_step_guidance<M: GuidanceModel>(
    model: &M,
    step: &ReviewStep,
    pack: Option<&ContextPack>,
) -> Result<Guidance, StepwiseError> {
    let user = prompt::build_step_prompt(step, pack);
    complete_with_retry(
        model,
        prompt::step_system_prompt(),
        &user,
        GuidanceTarget::Step(step.id),
    )
    .await
}

/// Generate the session-level wrap-up from the per-step guidance.
///
/// Same retry and fallback behavior as [`generate_step_guidance`].
///
/// # Errors
///
/// Returns [`StepwiseError::ModelUnavailable`] only for transport-level
/// failures.
pub async fn generate_session_guidance<M: GuidanceModel>(
    model: &M,
    session_id: Uuid,
    steps: &[ReviewStep],
    step_guidances: &[Guidance],
) -> Result<Guidance, StepwiseError> {
    let user = prompt::build_session_prompt(steps, step_guidances);
    complete_with_retry(
        model,
        prompt::session_system_prompt(),
        &user,
        GuidanceTarget::Session(session_id),
    )
    .await
}

/// Placeholder guidance recorded when the model cannot be reached at all,
/// after queue-level retries are exhausted.
pub fn unavailable_guidance(target: GuidanceTarget, model_name: &str) -> Guidance {
    Guidance {
        id: Uuid::new_v4(),
        target,
        risk_level: RiskLevel::Unknown,
        summary: UNAVAILABLE_SUMMARY.to_string(),
        checklist: Vec::new(),
        model: model_name.to_string(),
        generated_at: Utc::now(),
    }
}

async fn complete_with_retry<M: GuidanceModel>(
    model: &M,
    system: &str,
    user: &str,
    target: GuidanceTarget,
) -> Result<Guidance, StepwiseError> {
    let first = model.complete(system, user).await?;
    let payload = match prompt::parse_guidance_response(&first) {
        Ok(payload) => Some(payload),
        Err(error) => {
            tracing::warn!(%error, "guidance reply malformed, retrying once");
            let retry_user = format!("{user}\n\n{}", prompt::reformat_instruction());
            let second = model.complete(system, &retry_user).await?;
            prompt::parse_guidance_response(&second).ok()
        }
    };

    let guidance = match payload {
        Some(payload) => Guidance {
            id: Uuid::new_v4(),
            target,
            risk_level: payload.risk(),
            summary: payload.summary,
            checklist: payload.checklist,
            model: model.name().to_string(),
            generated_at: Utc::now(),
        },
        None => {
            tracing::warn!("guidance reply malformed twice, recording placeholder");
            unavailable_guidance(target, model.name())
        }
    };
    Ok(guidance)
}
