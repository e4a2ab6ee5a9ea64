use serde::Deserialize;

use stepwise_core::{ContextPack, Guidance, ReviewStep, RiskLevel, StepwiseError};

const STEP_SYSTEM_PROMPT: &str = "\
You are Stepwise, an expert code review guide. You are given one reviewable \
step of a pull request: a cohesive slice of the diff plus cross-repository \
context about the symbols it touches. Rate how risky the change is and tell \
the reviewer what to verify.

Rules:
- Judge only what the diff and context show; do not speculate
- riskLevel is one of: low, medium, high
- The summary is 1-3 sentences about what the step changes
- Checklist items are concrete things a reviewer should check, most
  important first
- 3 to 7 checklist items

Respond with a JSON object:
{
  \"riskLevel\": \"low\" | \"medium\" | \"high\",
  \"summary\": \"What this step changes\",
  \"checklist\": [\"First thing to verify\", \"Second thing\"]
}";

const SESSION_SYSTEM_PROMPT: &str = "\
You are Stepwise, an expert code review guide. You are given the per-step \
risk ratings and summaries for an entire pull request. Produce one overall \
assessment of the pull request.

Rules:
- riskLevel reflects the riskiest parts of the change, not an average
- The summary describes the intent of the whole pull request in 1-3 sentences
- Checklist items are cross-cutting concerns spanning multiple steps
- 3 to 7 checklist items

Respond with a JSON object:
{
  \"riskLevel\": \"low\" | \"medium\" | \"high\",
  \"summary\": \"What this pull request does\",
  \"checklist\": [\"Cross-cutting concern to verify\"]
}";

/// Appended to the user prompt on the single retry after a malformed reply.
const REFORMAT_INSTRUCTION: &str = "\
Your previous reply was not valid JSON of the requested shape. Respond again \
with ONLY the JSON object, no prose and no markdown fences.";

/// System prompt for per-step guidance.
pub fn step_system_prompt() -> &'static str {
    STEP_SYSTEM_PROMPT
}

/// System prompt for the session-level wrap-up.
pub fn session_system_prompt() -> &'static str {
    SESSION_SYSTEM_PROMPT
}

/// Reformat instruction used on the retry attempt.
pub fn reformat_instruction() -> &'static str {
    REFORMAT_INSTRUCTION
}

/// Build the user prompt for one step.
///
/// Includes the step's diff and, when a context pack is available, the
/// symbol definitions, reference counts, and related tests it gathered.
///
/// # Examples
///
/// ```no_run
/// # fn demo(step: &stepwise_core::ReviewStep) {
/// let prompt = stepwise_guidance::prompt::build_step_prompt(step, None);
/// assert!(prompt.contains("```diff"));
/// # }
/// ```
pub fn build_step_prompt(step: &ReviewStep, pack: Option<&ContextPack>) -> String {
    let mut prompt = format!(
        "Step {}: {}\n\nDiff:\n```diff\n{}```\n",
        step.order_index + 1,
        step.title,
        step.diff_text()
    );

    if let Some(pack) = pack {
        if !pack.symbols.is_empty() {
            prompt.push_str("\nCross-repository context:\n");
            for symbol in &pack.symbols {
                prompt.push_str(&format!("- {}", symbol.name));
                if let Some(def) = &symbol.definition {
                    prompt.push_str(&format!(
                        " (defined at {}:{})",
                        def.path.display(),
                        def.line
                    ));
                }
                if !symbol.references.is_empty() {
                    prompt.push_str(&format!(", {} reference site(s)", symbol.references.len()));
                }
                if !symbol.related_tests.is_empty() {
                    let tests: Vec<String> = symbol
                        .related_tests
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect();
                    prompt.push_str(&format!(", tests: {}", tests.join(", ")));
                }
                prompt.push('\n');
            }
        }
        if pack.index_truncated {
            prompt.push_str(
                "\nNote: the repository index was truncated; context may be incomplete.\n",
            );
        }
    }

    prompt
}

/// Build the user prompt for the session wrap-up from per-step guidance.
pub fn build_session_prompt(steps: &[ReviewStep], guidances: &[Guidance]) -> String {
    let mut prompt = String::from("Per-step assessments of this pull request:\n\n");
    for step in steps {
        let guidance = guidances
            .iter()
            .find(|g| matches!(g.target, stepwise_core::GuidanceTarget::Step(id) if id == step.id));
        match guidance {
            Some(g) => prompt.push_str(&format!(
                "Step {}: {} [risk: {}]\n  {}\n",
                step.order_index + 1,
                step.title,
                g.risk_level,
                g.summary
            )),
            None => prompt.push_str(&format!(
                "Step {}: {} [risk: unknown]\n",
                step.order_index + 1,
                step.title
            )),
        }
    }
    prompt
}

/// Parsed model reply for one guidance request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuidancePayload {
    /// Risk rating; unrecognized values fall back to `unknown`.
    pub risk_level: String,
    /// Short prose summary.
    pub summary: String,
    /// Reviewer checklist, most important first.
    pub checklist: Vec<String>,
}

impl GuidancePayload {
    /// Risk level as the typed enum, `Unknown` for unrecognized strings.
    pub fn risk(&self) -> RiskLevel {
        self.risk_level.parse().unwrap_or(RiskLevel::Unknown)
    }
}

/// Parse a model reply into a [`GuidancePayload`].
///
/// Handles markdown code fences around the JSON. Shape violations are
/// errors; an unexpected `riskLevel` string is tolerated and mapped to
/// `unknown` by [`GuidancePayload::risk`].
///
/// # Errors
///
/// Returns [`StepwiseError::ModelUnavailable`] when the reply is not a
/// JSON object of the requested shape.
pub fn parse_guidance_response(response: &str) -> Result<GuidancePayload, StepwiseError> {
    let cleaned = strip_code_fences(response);
    serde_json::from_str(cleaned).map_err(|e| {
        StepwiseError::ModelUnavailable(format!("malformed guidance reply: {e}"))
    })
}

fn strip_code_fences(s: &str) -> &str {
    let trimmed = s.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        if let Some(inner) = rest.strip_suffix("```") {
            return inner.trim();
        }
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        if let Some(inner) = rest.strip_suffix("```") {
            return inner.trim();
        }
    }
    trimmed
}
