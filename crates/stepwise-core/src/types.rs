use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a review session, from creation to a walkable review.
///
/// The dispatcher owns all transitions; stage logic never writes statuses.
///
/// # Examples
///
/// ```
/// use stepwise_core::SessionStatus;
///
/// let s: SessionStatus = serde_json::from_str("\"building_context\"").unwrap();
/// assert_eq!(s, SessionStatus::BuildingContext);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, nothing enqueued yet.
    Pending,
    /// `ingest_pr` is running.
    Ingesting,
    /// `generate_steps` is running.
    Clustering,
    /// Steps exist; context packs and guidance are being built.
    BuildingContext,
    /// Every step is ready for a human walkthrough.
    Ready,
    /// A terminal failure occurred; see `error_reason`.
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Ingesting => "ingesting",
            SessionStatus::Clustering => "clustering",
            SessionStatus::BuildingContext => "building_context",
            SessionStatus::Ready => "ready",
            SessionStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle of a single review step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Created by clustering, no context yet.
    Pending,
    /// `build_context_pack` is running for this step.
    ContextBuilding,
    /// Context pack (and possibly guidance) are available.
    Ready,
    /// The step's context or guidance stage failed terminally.
    Error,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::ContextBuilding => "context_building",
            StepStatus::Ready => "ready",
            StepStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// One review attempt over one pull request.
///
/// Owned by the creating user; concurrent sessions over the same PR are
/// allowed and fully independent. Re-ingestion creates a new session rather
/// than mutating this one.
///
/// # Examples
///
/// ```
/// use stepwise_core::ReviewSession;
///
/// let session = ReviewSession::new("acme/api", 42, "user-1");
/// assert_eq!(session.pr_number, 42);
/// assert_eq!(session.status, stepwise_core::SessionStatus::Pending);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewSession {
    /// Session id.
    pub id: Uuid,
    /// Repository the PR belongs to, as `owner/name`.
    pub repo: String,
    /// Pull request number on the host.
    pub pr_number: u64,
    /// User who created the session; only they may trigger regeneration.
    pub created_by: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Machine-readable reason when `status == Error`.
    pub error_reason: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status transition time.
    pub updated_at: DateTime<Utc>,
}

impl ReviewSession {
    /// Create a fresh pending session.
    pub fn new(repo: impl Into<String>, pr_number: u64, created_by: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            repo: repo.into(),
            pr_number,
            created_by: created_by.into(),
            status: SessionStatus::Pending,
            error_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Immutable capture of a pull request's diff at ingestion time.
///
/// Never mutated; a re-ingestion creates a new snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestSnapshot {
    /// Snapshot id.
    pub id: Uuid,
    /// Owning session.
    pub session_id: Uuid,
    /// Repository as `owner/name`.
    pub repo: String,
    /// Pull request number.
    pub pr_number: u64,
    /// Merge-base commit of the PR.
    pub base_sha: String,
    /// Head commit of the PR; context indexing keys off this.
    pub head_sha: String,
    /// Raw unified diff text as fetched from the host.
    pub diff_text: String,
    /// Changed-file list reported by the host.
    pub changed_files: Vec<PathBuf>,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
}

/// Classification of a diff hunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// New file or purely added lines.
    Add,
    /// Deleted file or purely removed lines.
    Delete,
    /// Lines changed in place.
    Modify,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Add => write!(f, "add"),
            ChangeType::Delete => write!(f, "delete"),
            ChangeType::Modify => write!(f, "modify"),
        }
    }
}

/// An inclusive 1-based line range within one file.
///
/// # Examples
///
/// ```
/// use stepwise_core::LineRange;
///
/// let a = LineRange { start: 10, end: 15 };
/// let b = LineRange { start: 20, end: 25 };
/// assert_eq!(a.gap_to(&b), 4);
/// assert_eq!(b.gap_to(&a), 4);
/// assert_eq!(a.gap_to(&LineRange { start: 12, end: 30 }), 0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineRange {
    /// First line of the range.
    pub start: u32,
    /// Last line of the range (>= start).
    pub end: u32,
}

impl LineRange {
    /// Number of lines strictly between the two ranges, or 0 when they
    /// touch or overlap.
    pub fn gap_to(&self, other: &LineRange) -> u32 {
        if self.end < other.start {
            other.start - self.end - 1
        } else if other.end < self.start {
            self.start - other.end - 1
        } else {
            0
        }
    }

    /// Smallest range covering both inputs.
    pub fn union(&self, other: &LineRange) -> LineRange {
        LineRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// An atomic diff fragment: one `@@` block of a unified diff.
///
/// Hunks are derived from a snapshot and consumed directly by clustering;
/// they are never persisted on their own.
///
/// # Examples
///
/// ```
/// use std::path::PathBuf;
/// use stepwise_core::{ChangeType, Hunk};
///
/// let hunk = Hunk {
///     file_path: PathBuf::from("src/auth.py"),
///     old_start: 10,
///     old_lines: 3,
///     new_start: 10,
///     new_lines: 5,
///     patch: "+import hmac\n context\n+verify()\n".into(),
///     change_type: ChangeType::Modify,
/// };
/// assert_eq!(hunk.changed_line_count(), 2);
/// assert_eq!(hunk.new_range().end, 14);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hunk {
    /// Path to the affected file (new path, or old path for deletions).
    pub file_path: PathBuf,
    /// Starting line in the old version.
    pub old_start: u32,
    /// Line count in the old version.
    pub old_lines: u32,
    /// Starting line in the new version.
    pub new_start: u32,
    /// Line count in the new version.
    pub new_lines: u32,
    /// Raw `+`/`-`/context lines for this hunk.
    pub patch: String,
    /// Classification of the change.
    pub change_type: ChangeType,
}

impl Hunk {
    /// Count of added plus removed lines in the patch text.
    pub fn changed_line_count(&self) -> u32 {
        self.patch
            .lines()
            .filter(|l| l.starts_with('+') || l.starts_with('-'))
            .count() as u32
    }

    /// Range this hunk spans in the new version of the file.
    ///
    /// For pure deletions (`new_lines == 0`) the range collapses to the
    /// anchor line.
    pub fn new_range(&self) -> LineRange {
        let end = self.new_start + self.new_lines.saturating_sub(1);
        LineRange {
            start: self.new_start,
            end: end.max(self.new_start),
        }
    }

    /// Range this hunk spans in the old version of the file.
    pub fn old_range(&self) -> LineRange {
        let end = self.old_start + self.old_lines.saturating_sub(1);
        LineRange {
            start: self.old_start,
            end: end.max(self.old_start),
        }
    }

    /// The range reviewers should anchor on: new side for additions and
    /// modifications, old side for pure deletions.
    pub fn anchor_range(&self) -> LineRange {
        if self.change_type == ChangeType::Delete {
            self.old_range()
        } else {
            self.new_range()
        }
    }
}

/// A (path, line-range) pair inside a step's file scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeEntry {
    /// File the range belongs to.
    pub path: PathBuf,
    /// Covered line range.
    pub range: LineRange,
}

/// One reviewable change unit produced by clustering.
///
/// Every hunk of the snapshot belongs to exactly one step; the steps'
/// scopes form an exact partition of the diff. Steps are never deleted —
/// a re-ingestion supersedes them with a fresh session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewStep {
    /// Step id.
    pub id: Uuid,
    /// Owning session.
    pub session_id: Uuid,
    /// 0-based traversal order.
    pub order_index: u32,
    /// Heuristic (non-AI) label summarizing the step's scope.
    pub title: String,
    /// The (path, range) pairs this step covers.
    pub scope: Vec<ScopeEntry>,
    /// The hunks assigned to this step.
    pub hunks: Vec<Hunk>,
    /// Total added plus removed lines across the step's hunks.
    pub changed_lines: u32,
    /// Current lifecycle status.
    pub status: StepStatus,
}

impl ReviewStep {
    /// Render the step's hunks back into unified-diff text for prompts.
    pub fn diff_text(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for hunk in &self.hunks {
            let _ = writeln!(out, "--- a/{}", hunk.file_path.display());
            let _ = writeln!(out, "+++ b/{}", hunk.file_path.display());
            let _ = writeln!(
                out,
                "@@ -{},{} +{},{} @@",
                hunk.old_start, hunk.old_lines, hunk.new_start, hunk.new_lines
            );
            out.push_str(&hunk.patch);
        }
        out
    }
}

/// A definition or reference site in the repository tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    /// Path relative to the repository root.
    pub path: PathBuf,
    /// 1-based line number.
    pub line: u32,
}

/// Context gathered for one symbol touched by a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolContext {
    /// Symbol name as it appears in source.
    pub name: String,
    /// Definition site, when the index found one.
    pub definition: Option<Location>,
    /// Reference sites elsewhere in the tree.
    pub references: Vec<Location>,
    /// Test files whose name or content relates to the symbol.
    pub related_tests: Vec<PathBuf>,
    /// Whether the symbol appears in the step's own diff (as opposed to
    /// being transitively discovered).
    pub from_diff: bool,
}

/// The symbol bundle assembled for one step (1:1 by step id).
///
/// Rebuilding always replaces the previous pack for the same step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextPack {
    /// Pack id.
    pub id: Uuid,
    /// Step this pack belongs to.
    pub step_id: Uuid,
    /// Ordered symbol contexts, diff-local symbols first.
    pub symbols: Vec<SymbolContext>,
    /// True when the underlying repo index was truncated; consumers should
    /// treat coverage as partial.
    pub index_truncated: bool,
    /// Build time.
    pub generated_at: DateTime<Utc>,
}

/// Risk assessment level produced by the guidance model.
///
/// # Examples
///
/// ```
/// use stepwise_core::RiskLevel;
///
/// assert_eq!("high".parse::<RiskLevel>().unwrap(), RiskLevel::High);
/// assert_eq!(RiskLevel::Unknown.to_string(), "unknown");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Routine change.
    Low,
    /// Deserves attention.
    Medium,
    /// Review carefully.
    High,
    /// The model's answer could not be parsed.
    Unknown,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "unknown" => Ok(RiskLevel::Unknown),
            other => Err(format!("unknown risk level: {other}")),
        }
    }
}

/// What a guidance record is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum GuidanceTarget {
    /// Per-step risk/checklist guidance.
    Step(Uuid),
    /// Session-level wrap-up summary over all steps.
    Session(Uuid),
}

/// AI-generated risk summary and checklist for a step or session.
///
/// Regenerable on demand; a regeneration replaces the previous record for
/// the same target rather than appending.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Guidance {
    /// Guidance id.
    pub id: Uuid,
    /// Step or session this guidance describes.
    pub target: GuidanceTarget,
    /// Model-assessed risk, `Unknown` when parsing failed.
    pub risk_level: RiskLevel,
    /// Prose summary of the change unit.
    pub summary: String,
    /// Ordered reviewer checklist questions.
    pub checklist: Vec<String>,
    /// Identifier of the model that produced this guidance.
    pub model: String,
    /// Generation time.
    pub generated_at: DateTime<Utc>,
}

/// The five pipeline stage names.
///
/// # Examples
///
/// ```
/// use stepwise_core::JobType;
///
/// assert_eq!(JobType::IngestPr.to_string(), "ingest_pr");
/// assert_eq!("generate_steps".parse::<JobType>().unwrap(), JobType::GenerateSteps);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    IngestPr,
    GenerateSteps,
    BuildContextPack,
    GatherRepoContext,
    GenerateAiGuidance,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobType::IngestPr => "ingest_pr",
            JobType::GenerateSteps => "generate_steps",
            JobType::BuildContextPack => "build_context_pack",
            JobType::GatherRepoContext => "gather_repo_context",
            JobType::GenerateAiGuidance => "generate_ai_guidance",
        };
        write!(f, "{s}")
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingest_pr" => Ok(JobType::IngestPr),
            "generate_steps" => Ok(JobType::GenerateSteps),
            "build_context_pack" => Ok(JobType::BuildContextPack),
            "gather_repo_context" => Ok(JobType::GatherRepoContext),
            "generate_ai_guidance" => Ok(JobType::GenerateAiGuidance),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// Stage-specific job payload.
///
/// Stage inputs are ids only; bulk data (diff text, file lists) lives in
/// the persisted snapshot, which the store guarantees is readable by the
/// time the next stage runs.
///
/// # Examples
///
/// ```
/// use stepwise_core::JobPayload;
/// use uuid::Uuid;
///
/// let session = Uuid::new_v4();
/// let payload = JobPayload::IngestPr { session_id: session };
/// assert_eq!(payload.dedupe_key(), format!("ingest_pr:{session}"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum JobPayload {
    /// Fetch and normalize the PR diff for a session.
    IngestPr { session_id: Uuid },
    /// Cluster the latest snapshot's hunks into steps.
    GenerateSteps { session_id: Uuid },
    /// Assemble the context pack for one step.
    BuildContextPack { step_id: Uuid },
    /// Build (or warm) the repo context index for a commit.
    GatherRepoContext { repo: String, commit: String },
    /// Generate guidance for a step or a session wrap-up.
    GenerateAiGuidance { target: GuidanceTarget },
}

impl JobPayload {
    /// The stage this payload belongs to.
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::IngestPr { .. } => JobType::IngestPr,
            JobPayload::GenerateSteps { .. } => JobType::GenerateSteps,
            JobPayload::BuildContextPack { .. } => JobType::BuildContextPack,
            JobPayload::GatherRepoContext { .. } => JobType::GatherRepoContext,
            JobPayload::GenerateAiGuidance { .. } => JobType::GenerateAiGuidance,
        }
    }

    /// Idempotency key for duplicate suppression: one effective execution
    /// per (unit of work, stage).
    pub fn dedupe_key(&self) -> String {
        match self {
            JobPayload::IngestPr { session_id } => format!("ingest_pr:{session_id}"),
            JobPayload::GenerateSteps { session_id } => format!("generate_steps:{session_id}"),
            JobPayload::BuildContextPack { step_id } => format!("build_context_pack:{step_id}"),
            JobPayload::GatherRepoContext { repo, commit } => {
                format!("gather_repo_context:{repo}@{commit}")
            }
            JobPayload::GenerateAiGuidance { target } => match target {
                GuidanceTarget::Step(id) => format!("generate_ai_guidance:step:{id}"),
                GuidanceTarget::Session(id) => format!("generate_ai_guidance:session:{id}"),
            },
        }
    }
}

/// Lifecycle of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker.
    Queued,
    /// Claimed by a worker.
    Active,
    /// Handler returned success.
    Completed,
    /// Terminal error or retry budget exhausted.
    Failed,
}

/// A unit of work tracked by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Job id.
    pub id: Uuid,
    /// Stage-specific payload.
    pub payload: JobPayload,
    /// Current queue status.
    pub status: JobStatus,
    /// Delivery attempts so far.
    pub attempts: u32,
    /// Message from the most recent failure, if any.
    pub last_error: Option<String>,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a freshly queued job for `payload`.
    pub fn new(payload: JobPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            status: JobStatus::Queued,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}

/// Output format for CLI subcommands.
///
/// # Examples
///
/// ```
/// use stepwise_core::OutputFormat;
///
/// let fmt: OutputFormat = "md".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Markdown);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable summaries.
    #[default]
    Text,
    /// Machine-readable JSON with camelCase keys.
    Json,
    /// Markdown-formatted output.
    Markdown,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Markdown => write!(f, "markdown"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}
