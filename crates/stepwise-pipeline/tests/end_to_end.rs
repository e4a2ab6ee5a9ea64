use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use uuid::Uuid;

use stepwise_context::{TreeListing, TreeSource};
use stepwise_core::{
    GuidanceTarget, JobStatus, RiskLevel, SessionStatus, StepStatus, StepwiseConfig,
    StepwiseError,
};
use stepwise_guidance::GuidanceModel;
use stepwise_pipeline::{request_regeneration, MemoryStore, Pipeline, PrInfo, RepoHost, Store};
use stepwise_queue::{Dispatcher, QueueOptions};

const DIFF: &str = "\
diff --git a/src/auth.py b/src/auth.py
--- a/src/auth.py
+++ b/src/auth.py
@@ -10,2 +10,2 @@
-def check_password(user, password):
-    return hash_of(password) == user.stored
+def check_password(user, password):
+    return secure_compare(hash_of(password), user.stored)
diff --git a/tests/auth_test.py b/tests/auth_test.py
--- a/tests/auth_test.py
+++ b/tests/auth_test.py
@@ -1,2 +1,3 @@
 def test_check_password():
+    assert check_password(make_user(), \"pw\")

diff --git a/src/billing.py b/src/billing.py
--- a/src/billing.py
+++ b/src/billing.py
@@ -5,2 +5,2 @@
 def charge(invoice):
-    amount = invoice.subtotal
+    amount = invoice.total_due
";

struct FakeHost {
    diff: String,
    tree: Vec<(PathBuf, String)>,
    fail_lists: AtomicU32,
}

impl FakeHost {
    fn with_sample_repo(diff: &str) -> Self {
        let tree = vec![
            (
                PathBuf::from("src/auth.py"),
                "def check_password(user, password):\n    return secure_compare(hash_of(password), user.stored)\n"
                    .to_string(),
            ),
            (
                PathBuf::from("src/billing.py"),
                "def charge(invoice):\n    amount = invoice.total_due\n".to_string(),
            ),
            (
                PathBuf::from("tests/auth_test.py"),
                "def test_check_password():\n    assert check_password(make_user(), \"pw\")\n"
                    .to_string(),
            ),
        ];
        Self {
            diff: diff.to_string(),
            tree,
            fail_lists: AtomicU32::new(0),
        }
    }

    /// Make the next `times` tree listings fail with a retryable host error.
    fn fail_next_lists(self, times: u32) -> Self {
        self.fail_lists.store(times, Ordering::SeqCst);
        self
    }
}

impl RepoHost for FakeHost {
    async fn pull_request(&self, _repo: &str, _number: u64) -> Result<PrInfo, StepwiseError> {
        Ok(PrInfo {
            base_sha: "base000".into(),
            head_sha: "head111".into(),
        })
    }

    async fn fetch_diff(&self, _repo: &str, _number: u64) -> Result<String, StepwiseError> {
        Ok(self.diff.clone())
    }
}

impl TreeSource for FakeHost {
    async fn list_tree(&self, _repo: &str, _commit: &str) -> Result<TreeListing, StepwiseError> {
        if self
            .fail_lists
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StepwiseError::UpstreamFetch {
                message: "503 from host".into(),
                retryable: true,
            });
        }
        Ok(TreeListing {
            paths: self.tree.iter().map(|(p, _)| p.clone()).collect(),
            truncated: false,
        })
    }

    async fn fetch_file(
        &self,
        _repo: &str,
        _commit: &str,
        path: &Path,
    ) -> Result<String, StepwiseError> {
        self.tree
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, c)| c.clone())
            .ok_or_else(|| StepwiseError::NotFound(path.display().to_string()))
    }
}

/// Always replies with the same text; counts calls. `unreachable()` fails
/// every call at the transport level instead.
struct FakeModel {
    reply: Option<String>,
    calls: Mutex<u32>,
}

impl FakeModel {
    fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            calls: Mutex::new(0),
        }
    }

    fn unreachable() -> Self {
        Self {
            reply: None,
            calls: Mutex::new(0),
        }
    }
}

impl GuidanceModel for FakeModel {
    fn name(&self) -> &str {
        "fake-model"
    }

    async fn complete(&self, _system: &str, _user: &str) -> Result<String, StepwiseError> {
        *self.calls.lock().unwrap() += 1;
        match &self.reply {
            Some(reply) => Ok(reply.clone()),
            None => Err(StepwiseError::ModelUnavailable(
                "connection refused".into(),
            )),
        }
    }
}

fn valid_reply() -> &'static str {
    r#"{"riskLevel":"medium","summary":"Adjusts authentication.","checklist":["Check hashing"]}"#
}

fn dispatcher_for(
    host: FakeHost,
    model: FakeModel,
) -> Dispatcher<Pipeline<MemoryStore, FakeHost, FakeModel>> {
    let pipeline = Pipeline::new(MemoryStore::new(), host, model, &StepwiseConfig::default());
    let options = QueueOptions {
        max_attempts: 3,
        backoff_base_ms: 1,
        backoff_cap_ms: 4,
    };
    Dispatcher::new(pipeline, options)
}

#[tokio::test]
async fn full_pipeline_produces_ready_session() {
    let dispatcher = dispatcher_for(
        FakeHost::with_sample_repo(DIFF),
        FakeModel::replying(valid_reply()),
    );
    let (session, payload) = dispatcher
        .runner()
        .start_session("acme/api", 12, "mona")
        .unwrap();
    dispatcher.enqueue(payload).unwrap();
    dispatcher.run_until_idle().await;

    let store = dispatcher.runner().store();
    let loaded = store.session(session.id).unwrap();
    assert_eq!(loaded.status, SessionStatus::Ready);

    let steps = store.steps_for_session(session.id).unwrap();
    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|s| s.status == StepStatus::Ready));
    // auth.py and its shadow test share a symbol, billing stands alone.
    assert!(steps[0].title.contains("auth"));
    assert!(steps[1].title.contains("billing"));

    for step in &steps {
        let pack = store.pack_for_step(step.id).unwrap().unwrap();
        assert!(!pack.index_truncated);
        let guidance = store
            .guidance_for(GuidanceTarget::Step(step.id))
            .unwrap()
            .unwrap();
        assert_eq!(guidance.risk_level, RiskLevel::Medium);
    }

    let wrap_up = store
        .guidance_for(GuidanceTarget::Session(session.id))
        .unwrap()
        .unwrap();
    assert_eq!(wrap_up.model, "fake-model");

    let auth_pack = store.pack_for_step(steps[0].id).unwrap().unwrap();
    let checked = auth_pack
        .symbols
        .iter()
        .find(|s| s.name == "check_password")
        .expect("diff symbol indexed");
    assert!(checked.from_diff);
    assert!(checked
        .related_tests
        .contains(&PathBuf::from("tests/auth_test.py")));
}

#[tokio::test]
async fn unparseable_model_degrades_to_unknown_guidance() {
    let dispatcher = dispatcher_for(
        FakeHost::with_sample_repo(DIFF),
        FakeModel::replying("I would rather chat about the weather."),
    );
    let (session, payload) = dispatcher
        .runner()
        .start_session("acme/api", 12, "mona")
        .unwrap();
    dispatcher.enqueue(payload).unwrap();
    dispatcher.run_until_idle().await;

    let store = dispatcher.runner().store();
    assert_eq!(
        store.session(session.id).unwrap().status,
        SessionStatus::Ready
    );
    for step in store.steps_for_session(session.id).unwrap() {
        let guidance = store
            .guidance_for(GuidanceTarget::Step(step.id))
            .unwrap()
            .unwrap();
        assert_eq!(guidance.risk_level, RiskLevel::Unknown);
        assert_eq!(guidance.summary, "AI guidance unavailable");
    }
}

#[tokio::test]
async fn errored_session_is_not_revived_by_a_later_step() {
    // Eight failing tree listings: the index warm-up burns three attempts,
    // the first pack build exhausts its three and errors the session, the
    // second pack build fails twice more and then succeeds.
    let dispatcher = dispatcher_for(
        FakeHost::with_sample_repo(DIFF).fail_next_lists(8),
        FakeModel::replying(valid_reply()),
    );
    let (session, payload) = dispatcher
        .runner()
        .start_session("acme/api", 12, "mona")
        .unwrap();
    dispatcher.enqueue(payload).unwrap();
    dispatcher.run_until_idle().await;

    let store = dispatcher.runner().store();
    let loaded = store.session(session.id).unwrap();
    assert_eq!(loaded.status, SessionStatus::Error);
    assert_eq!(loaded.error_reason.as_deref(), Some("index_unavailable"));

    // The sibling step still finished on its own.
    let steps = store.steps_for_session(session.id).unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].status, StepStatus::Error);
    assert_eq!(steps[1].status, StepStatus::Ready);
}

#[tokio::test]
async fn unreachable_model_still_wraps_up_the_session() {
    let dispatcher = dispatcher_for(
        FakeHost::with_sample_repo(DIFF),
        FakeModel::unreachable(),
    );
    let (session, payload) = dispatcher
        .runner()
        .start_session("acme/api", 12, "mona")
        .unwrap();
    dispatcher.enqueue(payload).unwrap();
    dispatcher.run_until_idle().await;

    let store = dispatcher.runner().store();
    assert_eq!(
        store.session(session.id).unwrap().status,
        SessionStatus::Ready
    );
    for step in store.steps_for_session(session.id).unwrap() {
        let guidance = store
            .guidance_for(GuidanceTarget::Step(step.id))
            .unwrap()
            .unwrap();
        assert_eq!(guidance.risk_level, RiskLevel::Unknown);
        assert_eq!(guidance.summary, "AI guidance unavailable");
    }

    // The last step's placeholder chains the wrap-up, which gets its own
    // placeholder once the model stays down.
    let wrap_up = store
        .guidance_for(GuidanceTarget::Session(session.id))
        .unwrap()
        .unwrap();
    assert_eq!(wrap_up.risk_level, RiskLevel::Unknown);
    assert_eq!(wrap_up.summary, "AI guidance unavailable");
}

#[tokio::test]
async fn empty_diff_fails_the_session_terminally() {
    let dispatcher = dispatcher_for(
        FakeHost::with_sample_repo(""),
        FakeModel::replying(valid_reply()),
    );
    let (session, payload) = dispatcher
        .runner()
        .start_session("acme/api", 12, "mona")
        .unwrap();
    let job_id = dispatcher.enqueue(payload).unwrap().unwrap();
    dispatcher.run_until_idle().await;

    let store = dispatcher.runner().store();
    let loaded = store.session(session.id).unwrap();
    assert_eq!(loaded.status, SessionStatus::Error);
    assert_eq!(loaded.error_reason.as_deref(), Some("empty_diff"));
    assert!(store.steps_for_session(session.id).unwrap().is_empty());

    // Terminal input error, not retried.
    let job = dispatcher.job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn creator_can_regenerate_guidance_others_cannot() {
    let dispatcher = dispatcher_for(
        FakeHost::with_sample_repo(DIFF),
        FakeModel::replying(valid_reply()),
    );
    let (session, payload) = dispatcher
        .runner()
        .start_session("acme/api", 12, "mona")
        .unwrap();
    dispatcher.enqueue(payload).unwrap();
    dispatcher.run_until_idle().await;

    let store = dispatcher.runner().store();
    let target = GuidanceTarget::Session(session.id);
    let before = store.guidance_for(target).unwrap().unwrap();

    let err = request_regeneration(store, "rival", target).unwrap_err();
    assert!(matches!(err, StepwiseError::Unauthorized(_)));

    let regen = request_regeneration(store, "mona", target).unwrap();
    dispatcher.reenqueue(regen).unwrap();
    dispatcher.run_until_idle().await;

    let after = dispatcher
        .runner()
        .store()
        .guidance_for(target)
        .unwrap()
        .unwrap();
    assert_ne!(before.id, after.id);
}

#[tokio::test]
async fn duplicate_ingest_is_suppressed_by_dedupe() {
    let dispatcher = dispatcher_for(
        FakeHost::with_sample_repo(DIFF),
        FakeModel::replying(valid_reply()),
    );
    let (_session, payload) = dispatcher
        .runner()
        .start_session("acme/api", 12, "mona")
        .unwrap();
    assert!(dispatcher.enqueue(payload.clone()).unwrap().is_some());
    assert!(dispatcher.enqueue(payload).unwrap().is_none());
}
