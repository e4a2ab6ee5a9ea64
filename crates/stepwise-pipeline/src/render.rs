use std::fmt::Write;

use serde::Serialize;
use uuid::Uuid;

use stepwise_core::{
    ContextPack, Guidance, GuidanceTarget, OutputFormat, ReviewSession, ReviewStep, StepwiseError,
};

use crate::store::Store;

/// One step with its attached context and guidance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
    /// The step itself.
    pub step: ReviewStep,
    /// Context pack, when built.
    pub pack: Option<ContextPack>,
    /// Per-step guidance, when generated.
    pub guidance: Option<Guidance>,
}

/// A full session as presented to the reviewer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    /// The session record.
    pub session: ReviewSession,
    /// Steps in walkthrough order.
    pub steps: Vec<StepView>,
    /// Session-level wrap-up guidance, when generated.
    pub session_guidance: Option<Guidance>,
}

/// Assemble the renderable view of a session from the store.
///
/// # Errors
///
/// [`StepwiseError::NotFound`] when the session does not exist.
pub fn collect_view<S: Store>(store: &S, session_id: Uuid) -> Result<SessionView, StepwiseError> {
    let session = store.session(session_id)?;
    let mut steps = Vec::new();
    for step in store.steps_for_session(session_id)? {
        let pack = store.pack_for_step(step.id)?;
        let guidance = store.guidance_for(GuidanceTarget::Step(step.id))?;
        steps.push(StepView {
            step,
            pack,
            guidance,
        });
    }
    let session_guidance = store.guidance_for(GuidanceTarget::Session(session_id))?;
    Ok(SessionView {
        session,
        steps,
        session_guidance,
    })
}

/// Render a session view in the requested output format.
pub fn render(view: &SessionView, format: OutputFormat) -> Result<String, StepwiseError> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(view)?),
        OutputFormat::Text => Ok(render_text(view)),
        OutputFormat::Markdown => Ok(render_markdown(view)),
    }
}

fn risk_tag(guidance: Option<&Guidance>) -> String {
    match guidance {
        Some(g) => g.risk_level.to_string(),
        None => "unknown".into(),
    }
}

fn render_text(view: &SessionView) -> String {
    let mut out = String::new();
    let session = &view.session;
    let _ = writeln!(
        out,
        "{}#{} — {} step(s), status: {}",
        session.repo,
        session.pr_number,
        view.steps.len(),
        session.status
    );
    if let Some(reason) = &session.error_reason {
        let _ = writeln!(out, "error: {reason}");
    }
    if let Some(guidance) = &view.session_guidance {
        let _ = writeln!(out, "overall risk: {}", guidance.risk_level);
        let _ = writeln!(out, "{}", guidance.summary);
    }
    for entry in &view.steps {
        let step = &entry.step;
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{}. {} [{}] ({} changed lines)",
            step.order_index + 1,
            step.title,
            risk_tag(entry.guidance.as_ref()),
            step.changed_lines
        );
        for scope in &step.scope {
            let _ = writeln!(
                out,
                "   {}:{}-{}",
                scope.path.display(),
                scope.range.start,
                scope.range.end
            );
        }
        if let Some(guidance) = &entry.guidance {
            if !guidance.summary.is_empty() {
                let _ = writeln!(out, "   {}", guidance.summary);
            }
            for item in &guidance.checklist {
                let _ = writeln!(out, "   - [ ] {item}");
            }
        }
        if let Some(pack) = &entry.pack {
            if pack.index_truncated {
                let _ = writeln!(out, "   (context incomplete: repository index truncated)");
            }
        }
    }
    out
}

fn render_markdown(view: &SessionView) -> String {
    let mut out = String::new();
    let session = &view.session;
    let _ = writeln!(
        out,
        "# Review walkthrough: {}#{}\n",
        session.repo, session.pr_number
    );
    let _ = writeln!(out, "Status: `{}`", session.status);
    if let Some(guidance) = &view.session_guidance {
        let _ = writeln!(out, "\nOverall risk: **{}**\n", guidance.risk_level);
        let _ = writeln!(out, "{}", guidance.summary);
    }
    for entry in &view.steps {
        let step = &entry.step;
        let _ = writeln!(
            out,
            "\n## Step {}: {} ({})",
            step.order_index + 1,
            step.title,
            risk_tag(entry.guidance.as_ref())
        );
        for scope in &step.scope {
            let _ = writeln!(
                out,
                "- `{}` lines {}-{}",
                scope.path.display(),
                scope.range.start,
                scope.range.end
            );
        }
        if let Some(guidance) = &entry.guidance {
            let _ = writeln!(out, "\n{}", guidance.summary);
            if !guidance.checklist.is_empty() {
                let _ = writeln!(out, "\nChecklist:");
                for item in &guidance.checklist {
                    let _ = writeln!(out, "- [ ] {item}");
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use stepwise_core::{LineRange, RiskLevel, ScopeEntry, StepStatus};

    fn seeded_view() -> SessionView {
        let store = MemoryStore::new();
        let session = ReviewSession::new("acme/api", 12, "mona");
        let step = ReviewStep {
            id: Uuid::new_v4(),
            session_id: session.id,
            order_index: 0,
            title: "auth.py (check_password)".into(),
            scope: vec![ScopeEntry {
                path: "src/auth.py".into(),
                range: LineRange { start: 10, end: 42 },
            }],
            hunks: vec![],
            changed_lines: 18,
            status: StepStatus::Ready,
        };
        store.put_session(session.clone()).unwrap();
        store.replace_steps(session.id, vec![step.clone()]).unwrap();
        store
            .put_guidance(Guidance {
                id: Uuid::new_v4(),
                target: GuidanceTarget::Step(step.id),
                risk_level: RiskLevel::Medium,
                summary: "Tightens password checks.".into(),
                checklist: vec!["Verify lockout still triggers".into()],
                model: "m".into(),
                generated_at: Utc::now(),
            })
            .unwrap();
        collect_view(&store, session.id).unwrap()
    }

    #[test]
    fn text_lists_steps_with_risk_and_checklist() {
        let out = render(&seeded_view(), OutputFormat::Text).unwrap();
        assert!(out.contains("acme/api#12"));
        assert!(out.contains("1. auth.py (check_password) [medium]"));
        assert!(out.contains("- [ ] Verify lockout still triggers"));
    }

    #[test]
    fn markdown_has_step_headings() {
        let out = render(&seeded_view(), OutputFormat::Markdown).unwrap();
        assert!(out.contains("# Review walkthrough: acme/api#12"));
        assert!(out.contains("## Step 1: auth.py (check_password) (medium)"));
    }

    #[test]
    fn json_is_machine_readable() {
        let out = render(&seeded_view(), OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["session"]["repo"], "acme/api");
        assert_eq!(value["steps"][0]["guidance"]["riskLevel"], "medium");
    }
}
