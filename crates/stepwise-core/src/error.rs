/// Errors that can occur across the Stepwise pipeline.
///
/// Each variant maps to one failure domain. Library crates use this type
/// directly; the binary crate converts to `miette` diagnostics at the
/// boundary. The dispatcher consults [`StepwiseError::is_retryable`] to
/// decide between backoff-and-retry and marking a job failed.
///
/// # Examples
///
/// ```
/// use stepwise_core::StepwiseError;
///
/// let err = StepwiseError::EmptyDiff;
/// assert!(!err.is_retryable());
/// assert_eq!(err.reason_code(), "empty_diff");
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StepwiseError {
    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// The job broker cannot accept work (shut down or out of capacity).
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Repository host fetch failure. `retryable` is `true` for 5xx and
    /// timeouts, `false` for non-auth 4xx responses.
    #[error("upstream fetch error: {message}")]
    UpstreamFetch { message: String, retryable: bool },

    /// The pull request has zero changed lines; there is nothing to review.
    #[error("pull request diff is empty")]
    EmptyDiff,

    /// Malformed hunk input reached the clustering engine.
    #[error("clustering error: {0}")]
    Clustering(String),

    /// The repository context index could not be built.
    #[error("context index unavailable: {0}")]
    IndexUnavailable(String),

    /// The host refused to enumerate the repository tree at all.
    #[error("repository {repo} is too large to index")]
    RepoTooLarge { repo: String },

    /// Transport or timeout failure from the reasoning-model provider.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// A referenced record does not exist in the store.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller is not allowed to perform this action.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Persistence collaborator failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl StepwiseError {
    /// Whether the dispatcher should retry a job that failed with this error.
    ///
    /// Retryable-transient errors (upstream 5xx/timeouts, model transport
    /// failures, broker hiccups, index build failures) are retried with
    /// exponential backoff; everything else is terminal for the job.
    ///
    /// # Examples
    ///
    /// ```
    /// use stepwise_core::StepwiseError;
    ///
    /// let transient = StepwiseError::ModelUnavailable("timeout".into());
    /// assert!(transient.is_retryable());
    ///
    /// let terminal = StepwiseError::Clustering("bad hunk".into());
    /// assert!(!terminal.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            StepwiseError::QueueUnavailable(_)
            | StepwiseError::IndexUnavailable(_)
            | StepwiseError::ModelUnavailable(_) => true,
            StepwiseError::UpstreamFetch { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Stable machine-readable code surfaced to the UI when a session or
    /// step is marked `error`.
    pub fn reason_code(&self) -> &'static str {
        match self {
            StepwiseError::Io(_) => "io",
            StepwiseError::Config(_) => "config",
            StepwiseError::Serialization(_) => "serialization",
            StepwiseError::Toml(_) => "toml",
            StepwiseError::QueueUnavailable(_) => "queue_unavailable",
            StepwiseError::UpstreamFetch { .. } => "upstream_fetch",
            StepwiseError::EmptyDiff => "empty_diff",
            StepwiseError::Clustering(_) => "clustering",
            StepwiseError::IndexUnavailable(_) => "index_unavailable",
            StepwiseError::RepoTooLarge { .. } => "repo_too_large",
            StepwiseError::ModelUnavailable(_) => "model_unavailable",
            StepwiseError::NotFound(_) => "not_found",
            StepwiseError::Unauthorized(_) => "unauthorized",
            StepwiseError::Storage(_) => "storage",
        }
    }
}
