use std::collections::BTreeMap;

use chrono::Utc;
use uuid::Uuid;

use stepwise_cluster::{cluster_hunks, ClusterOptions};
use stepwise_context::{
    build_context_pack, IndexCache, IndexOptions, PackOptions, RepoContextIndex, TreeSource,
};
use stepwise_core::{
    Guidance, GuidanceTarget, JobPayload, PullRequestSnapshot, ReviewSession, SessionStatus,
    StepStatus, StepwiseConfig, StepwiseError,
};
use stepwise_diff::{flatten_hunks, parse_unified_diff, LexicalExtractor};
use stepwise_guidance::{
    generate_session_guidance, generate_step_guidance, unavailable_guidance, GuidanceModel,
};
use stepwise_queue::{StageRunner, StatusSink};

use crate::host::RepoHost;
use crate::store::Store;

/// Orchestrates the five pipeline stages over a store, a repository host,
/// and a guidance model.
///
/// One `Pipeline` serves every session; per-commit index state lives in
/// the embedded [`IndexCache`]. The pipeline is the dispatcher's
/// [`StageRunner`]: stages return follow-up payloads instead of enqueueing
/// directly.
pub struct Pipeline<S, H, M> {
    store: S,
    host: H,
    model: M,
    cache: IndexCache,
    extractor: LexicalExtractor,
    cluster_options: ClusterOptions,
    index_options: IndexOptions,
    pack_options: PackOptions,
}

impl<S, H, M> Pipeline<S, H, M>
where
    S: Store,
    H: RepoHost + TreeSource,
    M: GuidanceModel,
{
    /// Wire a pipeline from its collaborators and configuration.
    pub fn new(store: S, host: H, model: M, config: &StepwiseConfig) -> Self {
        Self {
            store,
            host,
            model,
            cache: IndexCache::new(),
            extractor: LexicalExtractor::default(),
            cluster_options: ClusterOptions::from(&config.cluster),
            index_options: IndexOptions::from(&config.context),
            pack_options: PackOptions::from(&config.context),
        }
    }

    /// The persistence layer, for rendering and regeneration checks.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create a pending session and return the payload that starts its
    /// pipeline. The caller enqueues the payload.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn start_session(
        &self,
        repo: &str,
        pr_number: u64,
        created_by: &str,
    ) -> Result<(ReviewSession, JobPayload), StepwiseError> {
        let session = ReviewSession::new(repo, pr_number, created_by);
        let payload = JobPayload::IngestPr {
            session_id: session.id,
        };
        self.store.put_session(session.clone())?;
        tracing::info!(session_id = %session.id, repo, pr_number, "session created");
        Ok((session, payload))
    }

    async fn run_ingest(&self, session_id: Uuid) -> Result<Vec<JobPayload>, StepwiseError> {
        let session = self.store.session(session_id)?;
        let info = self.host.pull_request(&session.repo, session.pr_number).await?;
        let diff_text = self.host.fetch_diff(&session.repo, session.pr_number).await?;

        let files = parse_unified_diff(&diff_text)?;
        let hunks = flatten_hunks(&files);
        if hunks.iter().map(|h| h.changed_line_count()).sum::<u32>() == 0 {
            return Err(StepwiseError::EmptyDiff);
        }

        let changed_files = files
            .iter()
            .map(|f| {
                if f.is_deleted_file {
                    f.old_path.clone()
                } else {
                    f.new_path.clone()
                }
            })
            .collect();

        self.store.put_snapshot(PullRequestSnapshot {
            id: Uuid::new_v4(),
            session_id,
            repo: session.repo.clone(),
            pr_number: session.pr_number,
            base_sha: info.base_sha,
            head_sha: info.head_sha,
            diff_text,
            changed_files,
            created_at: Utc::now(),
        })?;

        Ok(vec![JobPayload::GenerateSteps { session_id }])
    }

    async fn run_generate_steps(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<JobPayload>, StepwiseError> {
        let snapshot = self.store.snapshot_for_session(session_id)?;
        let files = parse_unified_diff(&snapshot.diff_text)?;
        let hunks = flatten_hunks(&files);

        let steps = cluster_hunks(session_id, &hunks, &self.cluster_options, &self.extractor)?;
        tracing::info!(session_id = %session_id, steps = steps.len(), "steps generated");

        // Warm the index once; the per-step pack builds single-flight on it.
        let mut next = vec![JobPayload::GatherRepoContext {
            repo: snapshot.repo.clone(),
            commit: snapshot.head_sha.clone(),
        }];
        next.extend(steps.iter().map(|step| JobPayload::BuildContextPack {
            step_id: step.id,
        }));

        self.store.replace_steps(session_id, steps)?;
        Ok(next)
    }

    async fn run_build_context_pack(
        &self,
        step_id: Uuid,
    ) -> Result<Vec<JobPayload>, StepwiseError> {
        let step = self.store.step(step_id)?;
        let snapshot = self.store.snapshot_for_session(step.session_id)?;
        self.store
            .update_step_status(step_id, StepStatus::ContextBuilding)?;

        let index = match self
            .cache
            .get_or_build(
                &self.host,
                &snapshot.repo,
                &snapshot.head_sha,
                &self.extractor,
                &self.index_options,
            )
            .await
        {
            Ok(index) => index,
            Err(StepwiseError::RepoTooLarge { repo }) => {
                // Degrade instead of failing the step: the pack still lists
                // the diff's own symbols, flagged as incomplete.
                tracing::warn!(%repo, "repository not indexable, building degraded pack");
                std::sync::Arc::new(RepoContextIndex {
                    repo,
                    commit: snapshot.head_sha.clone(),
                    symbols: BTreeMap::new(),
                    files: Vec::new(),
                    truncated: true,
                })
            }
            Err(e) if e.is_retryable() => {
                return Err(StepwiseError::IndexUnavailable(e.to_string()));
            }
            Err(e) => return Err(e),
        };

        let pack = build_context_pack(&step, &index, &self.extractor, &self.pack_options);
        self.store.put_pack(pack)?;
        self.store.update_step_status(step_id, StepStatus::Ready)?;

        Ok(vec![JobPayload::GenerateAiGuidance {
            target: GuidanceTarget::Step(step_id),
        }])
    }

    async fn run_gather(&self, repo: &str, commit: &str) -> Result<Vec<JobPayload>, StepwiseError> {
        self.cache
            .get_or_build(&self.host, repo, commit, &self.extractor, &self.index_options)
            .await?;
        Ok(Vec::new())
    }

    async fn run_guidance(
        &self,
        target: GuidanceTarget,
    ) -> Result<Vec<JobPayload>, StepwiseError> {
        match target {
            GuidanceTarget::Step(step_id) => {
                let step = self.store.step(step_id)?;
                let pack = self.store.pack_for_step(step_id)?;
                let guidance =
                    generate_step_guidance(&self.model, &step, pack.as_ref()).await?;
                self.store.put_guidance(guidance)?;

                // Once the last step has guidance, wrap up the session.
                if self.all_steps_guided(step.session_id)? {
                    Ok(vec![JobPayload::GenerateAiGuidance {
                        target: GuidanceTarget::Session(step.session_id),
                    }])
                } else {
                    Ok(Vec::new())
                }
            }
            GuidanceTarget::Session(session_id) => {
                let steps = self.store.steps_for_session(session_id)?;
                let mut step_guidances: Vec<Guidance> = Vec::new();
                for step in &steps {
                    if let Some(g) = self.store.guidance_for(GuidanceTarget::Step(step.id))? {
                        step_guidances.push(g);
                    }
                }
                let guidance =
                    generate_session_guidance(&self.model, session_id, &steps, &step_guidances)
                        .await?;
                self.store.put_guidance(guidance)?;
                self.rollup_session(session_id)?;
                Ok(Vec::new())
            }
        }
    }

    /// Recompute a session's status from its steps. An `Error` recorded by
    /// a failed stage is sticky and never overwritten here.
    fn rollup_session(&self, session_id: Uuid) -> Result<(), StepwiseError> {
        let session = self.store.session(session_id)?;
        if session.status == SessionStatus::Error {
            return Ok(());
        }
        let steps = self.store.steps_for_session(session_id)?;
        if steps.iter().any(|s| s.status == StepStatus::Error) {
            return self.store.update_session_status(
                session_id,
                SessionStatus::Error,
                Some("step_failed".into()),
            );
        }
        let status = if steps.iter().all(|s| s.status == StepStatus::Ready) {
            SessionStatus::Ready
        } else {
            SessionStatus::BuildingContext
        };
        self.store.update_session_status(session_id, status, None)
    }

    fn record_session_error(&self, session_id: Uuid, error: &StepwiseError) {
        if let Err(store_error) = self.store.update_session_status(
            session_id,
            SessionStatus::Error,
            Some(error.reason_code().to_string()),
        ) {
            tracing::error!(%session_id, %store_error, "failed to record session error");
        }
    }

    fn set_session_status(&self, session_id: Uuid, status: SessionStatus) {
        // A recorded error is sticky: a sibling step starting later must
        // not clobber it back to an in-progress status.
        match self.store.session(session_id) {
            Ok(session) if session.status == SessionStatus::Error => return,
            Ok(_) => {}
            Err(store_error) => {
                tracing::error!(%session_id, %store_error, "failed to load session for status");
                return;
            }
        }
        if let Err(store_error) = self.store.update_session_status(session_id, status, None) {
            tracing::error!(%session_id, %store_error, "failed to update session status");
        }
    }

    fn all_steps_guided(&self, session_id: Uuid) -> Result<bool, StepwiseError> {
        let steps = self.store.steps_for_session(session_id)?;
        for step in &steps {
            if self
                .store
                .guidance_for(GuidanceTarget::Step(step.id))?
                .is_none()
            {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl<S, H, M> StageRunner for Pipeline<S, H, M>
where
    S: Store,
    H: RepoHost + TreeSource,
    M: GuidanceModel,
{
    async fn run(&self, payload: &JobPayload) -> Result<Vec<JobPayload>, StepwiseError> {
        match payload {
            JobPayload::IngestPr { session_id } => self.run_ingest(*session_id).await,
            JobPayload::GenerateSteps { session_id } => {
                self.run_generate_steps(*session_id).await
            }
            JobPayload::BuildContextPack { step_id } => {
                self.run_build_context_pack(*step_id).await
            }
            JobPayload::GatherRepoContext { repo, commit } => {
                self.run_gather(repo, commit).await
            }
            JobPayload::GenerateAiGuidance { target } => self.run_guidance(*target).await,
        }
    }
}

impl<S, H, M> StatusSink for Pipeline<S, H, M>
where
    S: Store,
    H: RepoHost + TreeSource,
    M: GuidanceModel,
{
    fn on_started(&self, payload: &JobPayload, attempt: u32) {
        tracing::debug!(job_type = %payload.job_type(), attempt, "stage started");
        match payload {
            JobPayload::IngestPr { session_id } => {
                self.set_session_status(*session_id, SessionStatus::Ingesting);
            }
            JobPayload::GenerateSteps { session_id } => {
                self.set_session_status(*session_id, SessionStatus::Clustering);
            }
            JobPayload::BuildContextPack { step_id } => {
                if let Ok(step) = self.store.step(*step_id) {
                    self.set_session_status(step.session_id, SessionStatus::BuildingContext);
                }
            }
            JobPayload::GatherRepoContext { .. } | JobPayload::GenerateAiGuidance { .. } => {}
        }
    }

    fn on_completed(&self, payload: &JobPayload) {
        tracing::debug!(job_type = %payload.job_type(), "stage completed");
    }

    fn on_failed(&self, payload: &JobPayload, error: &StepwiseError) -> Vec<JobPayload> {
        match payload {
            JobPayload::IngestPr { session_id } | JobPayload::GenerateSteps { session_id } => {
                self.record_session_error(*session_id, error);
            }
            JobPayload::BuildContextPack { step_id } => {
                if let Err(store_error) =
                    self.store.update_step_status(*step_id, StepStatus::Error)
                {
                    tracing::error!(%step_id, %store_error, "failed to mark step errored");
                }
                if let Ok(step) = self.store.step(*step_id) {
                    self.record_session_error(step.session_id, error);
                }
            }
            JobPayload::GatherRepoContext { repo, commit } => {
                // Warming is best-effort; pack builds will retry on demand.
                tracing::warn!(repo, commit, %error, "index warm-up failed");
            }
            JobPayload::GenerateAiGuidance { target } => {
                // Guidance is advisory: record a placeholder and let the
                // session finish instead of erroring it.
                let placeholder = unavailable_guidance(*target, self.model.name());
                if let Err(store_error) = self.store.put_guidance(placeholder) {
                    tracing::error!(%store_error, "failed to record placeholder guidance");
                }
                match target {
                    GuidanceTarget::Session(session_id) => {
                        if let Err(store_error) = self.rollup_session(*session_id) {
                            tracing::error!(session_id = %session_id, %store_error, "rollup after guidance failure");
                        }
                    }
                    GuidanceTarget::Step(step_id) => {
                        // The placeholder counts as guidance; if this was the
                        // last step waiting, chain the session wrap-up just
                        // like the success path does.
                        let session_id = match self.store.step(*step_id) {
                            Ok(step) => step.session_id,
                            Err(store_error) => {
                                tracing::error!(%step_id, %store_error, "failed to load step after guidance failure");
                                return Vec::new();
                            }
                        };
                        match self.all_steps_guided(session_id) {
                            Ok(true) => {
                                return vec![JobPayload::GenerateAiGuidance {
                                    target: GuidanceTarget::Session(session_id),
                                }];
                            }
                            Ok(false) => {}
                            Err(store_error) => {
                                tracing::error!(%session_id, %store_error, "failed to check step guidance");
                            }
                        }
                    }
                }
            }
        }
        Vec::new()
    }
}
