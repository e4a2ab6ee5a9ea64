use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use uuid::Uuid;

use stepwise_core::{
    ContextPack, Guidance, GuidanceTarget, PullRequestSnapshot, ReviewSession, ReviewStep,
    SessionStatus, StepStatus, StepwiseError,
};

/// Persistence for sessions, snapshots, steps, packs, and guidance.
///
/// Writes are read-your-writes: a record persisted by one stage is visible
/// to the next stage of the same session. Packs replace by step id and
/// guidance replaces by target, so regeneration never appends.
pub trait Store: Send + Sync {
    /// Insert or overwrite a session.
    fn put_session(&self, session: ReviewSession) -> Result<(), StepwiseError>;

    /// Load a session.
    ///
    /// # Errors
    ///
    /// [`StepwiseError::NotFound`] when the id is unknown.
    fn session(&self, id: Uuid) -> Result<ReviewSession, StepwiseError>;

    /// Transition a session's status, stamping `updated_at`.
    fn update_session_status(
        &self,
        id: Uuid,
        status: SessionStatus,
        error_reason: Option<String>,
    ) -> Result<(), StepwiseError>;

    /// Persist the immutable diff snapshot for a session.
    fn put_snapshot(&self, snapshot: PullRequestSnapshot) -> Result<(), StepwiseError>;

    /// Latest snapshot for a session.
    fn snapshot_for_session(&self, session_id: Uuid)
        -> Result<PullRequestSnapshot, StepwiseError>;

    /// Replace the full step list of a session.
    fn replace_steps(&self, session_id: Uuid, steps: Vec<ReviewStep>)
        -> Result<(), StepwiseError>;

    /// Steps of a session in `order_index` order.
    fn steps_for_session(&self, session_id: Uuid) -> Result<Vec<ReviewStep>, StepwiseError>;

    /// Load one step.
    fn step(&self, id: Uuid) -> Result<ReviewStep, StepwiseError>;

    /// Transition a step's status.
    fn update_step_status(&self, id: Uuid, status: StepStatus) -> Result<(), StepwiseError>;

    /// Persist a context pack, replacing any previous pack for the step.
    fn put_pack(&self, pack: ContextPack) -> Result<(), StepwiseError>;

    /// Context pack for a step, if one has been built.
    fn pack_for_step(&self, step_id: Uuid) -> Result<Option<ContextPack>, StepwiseError>;

    /// Persist guidance, replacing any previous record for the target.
    fn put_guidance(&self, guidance: Guidance) -> Result<(), StepwiseError>;

    /// Guidance for a target, if generated.
    fn guidance_for(&self, target: GuidanceTarget) -> Result<Option<Guidance>, StepwiseError>;
}

#[derive(Default)]
struct StoreState {
    sessions: HashMap<Uuid, ReviewSession>,
    snapshots: HashMap<Uuid, PullRequestSnapshot>,
    steps: HashMap<Uuid, ReviewStep>,
    packs: HashMap<Uuid, ContextPack>,
    guidance: HashMap<GuidanceTarget, Guidance>,
}

/// In-memory [`Store`] backing the CLI and tests.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn put_session(&self, session: ReviewSession) -> Result<(), StepwiseError> {
        let mut state = self.state.lock().expect("store poisoned");
        state.sessions.insert(session.id, session);
        Ok(())
    }

    fn session(&self, id: Uuid) -> Result<ReviewSession, StepwiseError> {
        self.state
            .lock()
            .expect("store poisoned")
            .sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| StepwiseError::NotFound(format!("session {id}")))
    }

    fn update_session_status(
        &self,
        id: Uuid,
        status: SessionStatus,
        error_reason: Option<String>,
    ) -> Result<(), StepwiseError> {
        let mut state = self.state.lock().expect("store poisoned");
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or_else(|| StepwiseError::NotFound(format!("session {id}")))?;
        session.status = status;
        session.error_reason = error_reason;
        session.updated_at = Utc::now();
        Ok(())
    }

    fn put_snapshot(&self, snapshot: PullRequestSnapshot) -> Result<(), StepwiseError> {
        let mut state = self.state.lock().expect("store poisoned");
        state.snapshots.insert(snapshot.session_id, snapshot);
        Ok(())
    }

    fn snapshot_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<PullRequestSnapshot, StepwiseError> {
        self.state
            .lock()
            .expect("store poisoned")
            .snapshots
            .get(&session_id)
            .cloned()
            .ok_or_else(|| StepwiseError::NotFound(format!("snapshot for session {session_id}")))
    }

    fn replace_steps(
        &self,
        session_id: Uuid,
        steps: Vec<ReviewStep>,
    ) -> Result<(), StepwiseError> {
        let mut state = self.state.lock().expect("store poisoned");
        state.steps.retain(|_, s| s.session_id != session_id);
        for step in steps {
            state.steps.insert(step.id, step);
        }
        Ok(())
    }

    fn steps_for_session(&self, session_id: Uuid) -> Result<Vec<ReviewStep>, StepwiseError> {
        let state = self.state.lock().expect("store poisoned");
        let mut steps: Vec<ReviewStep> = state
            .steps
            .values()
            .filter(|s| s.session_id == session_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.order_index);
        Ok(steps)
    }

    fn step(&self, id: Uuid) -> Result<ReviewStep, StepwiseError> {
        self.state
            .lock()
            .expect("store poisoned")
            .steps
            .get(&id)
            .cloned()
            .ok_or_else(|| StepwiseError::NotFound(format!("step {id}")))
    }

    fn update_step_status(&self, id: Uuid, status: StepStatus) -> Result<(), StepwiseError> {
        let mut state = self.state.lock().expect("store poisoned");
        let step = state
            .steps
            .get_mut(&id)
            .ok_or_else(|| StepwiseError::NotFound(format!("step {id}")))?;
        step.status = status;
        Ok(())
    }

    fn put_pack(&self, pack: ContextPack) -> Result<(), StepwiseError> {
        let mut state = self.state.lock().expect("store poisoned");
        state.packs.insert(pack.step_id, pack);
        Ok(())
    }

    fn pack_for_step(&self, step_id: Uuid) -> Result<Option<ContextPack>, StepwiseError> {
        Ok(self
            .state
            .lock()
            .expect("store poisoned")
            .packs
            .get(&step_id)
            .cloned())
    }

    fn put_guidance(&self, guidance: Guidance) -> Result<(), StepwiseError> {
        let mut state = self.state.lock().expect("store poisoned");
        state.guidance.insert(guidance.target, guidance);
        Ok(())
    }

    fn guidance_for(&self, target: GuidanceTarget) -> Result<Option<Guidance>, StepwiseError> {
        Ok(self
            .state
            .lock()
            .expect("store poisoned")
            .guidance
            .get(&target)
            .cloned())
    }
}
