use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use stepwise_context::{TreeListing, TreeSource};
use stepwise_core::{HostConfig, StepwiseError};

/// Head and base commits of a pull request as reported by the host.
#[derive(Debug, Clone)]
pub struct PrInfo {
    /// Merge-base commit SHA.
    pub base_sha: String,
    /// Head commit SHA; context indexing keys off this.
    pub head_sha: String,
}

/// Read access to pull requests on a repository host.
///
/// The production implementation is [`GitHubHost`]; tests use in-memory
/// fakes.
pub trait RepoHost: Send + Sync {
    /// Fetch head/base metadata for a pull request.
    fn pull_request(
        &self,
        repo: &str,
        number: u64,
    ) -> impl Future<Output = Result<PrInfo, StepwiseError>> + Send;

    /// Fetch the unified diff text of a pull request.
    fn fetch_diff(
        &self,
        repo: &str,
        number: u64,
    ) -> impl Future<Output = Result<String, StepwiseError>> + Send;
}

/// GitHub client for pull-request metadata, diffs, and tree reads.
///
/// # Examples
///
/// ```
/// use stepwise_pipeline::parse_pr_reference;
///
/// let (repo, number) = parse_pr_reference("rust-lang/rust#12345").unwrap();
/// assert_eq!(repo, "rust-lang/rust");
/// assert_eq!(number, 12345);
/// ```
pub struct GitHubHost {
    octocrab: octocrab::Octocrab,
    http: reqwest::Client,
    token: String,
    base_url: String,
}

impl GitHubHost {
    /// Create a host client from configuration, falling back to the
    /// `GITHUB_TOKEN` environment variable for the token.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::Config`] when no token is available or the
    /// HTTP clients cannot be built.
    pub fn new(config: &HostConfig) -> Result<Self, StepwiseError> {
        let token = match &config.token {
            Some(t) => t.clone(),
            None => std::env::var("GITHUB_TOKEN").map_err(|_| {
                StepwiseError::Config(
                    "GITHUB_TOKEN not set. Configure [host].token or set GITHUB_TOKEN".into(),
                )
            })?,
        };

        let octocrab = octocrab::Octocrab::builder()
            .personal_token(token.clone())
            .build()
            .map_err(|e| StepwiseError::Config(format!("failed to create GitHub client: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StepwiseError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            octocrab,
            http,
            token,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.github.com".into()),
        })
    }

    /// Raw GET against the REST API with an explicit Accept header,
    /// classifying failures into retryable and terminal.
    async fn get_text(&self, url: &str, accept: &str) -> Result<String, StepwiseError> {
        let response = self
            .http
            .get(url)
            .header("Accept", accept)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", "stepwise")
            .send()
            .await
            .map_err(|e| StepwiseError::UpstreamFetch {
                message: format!("request to {url} failed: {e}"),
                retryable: true,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StepwiseError::UpstreamFetch {
                message: format!("GitHub API error {status}: {body}"),
                retryable: status.is_server_error()
                    || status == reqwest::StatusCode::TOO_MANY_REQUESTS,
            });
        }

        response
            .text()
            .await
            .map_err(|e| StepwiseError::UpstreamFetch {
                message: format!("failed to read response body: {e}"),
                retryable: true,
            })
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, StepwiseError> {
        let text = self.get_text(url, "application/vnd.github+json").await?;
        serde_json::from_str(&text).map_err(|e| StepwiseError::UpstreamFetch {
            message: format!("malformed JSON from {url}: {e}"),
            retryable: false,
        })
    }
}

impl RepoHost for GitHubHost {
    async fn pull_request(&self, repo: &str, number: u64) -> Result<PrInfo, StepwiseError> {
        let url = format!("{}/repos/{repo}/pulls/{number}", self.base_url);
        let body = self.get_json(&url).await?;

        let sha_at = |key: &str| {
            body.get(key)
                .and_then(|v| v.get("sha"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| StepwiseError::UpstreamFetch {
                    message: format!("pull request response missing {key}.sha"),
                    retryable: false,
                })
        };

        Ok(PrInfo {
            base_sha: sha_at("base")?,
            head_sha: sha_at("head")?,
        })
    }

    async fn fetch_diff(&self, repo: &str, number: u64) -> Result<String, StepwiseError> {
        let url = format!("{}/repos/{repo}/pulls/{number}", self.base_url);
        self.get_text(&url, "application/vnd.github.v3.diff").await
    }
}

impl TreeSource for GitHubHost {
    async fn list_tree(&self, repo: &str, commit: &str) -> Result<TreeListing, StepwiseError> {
        let route = format!("/repos/{repo}/git/trees/{commit}?recursive=1");
        let body: serde_json::Value = self
            .octocrab
            .get(route, None::<&()>)
            .await
            .map_err(classify_octocrab_error)?;

        let paths = body
            .get("tree")
            .and_then(|t| t.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.get("type").and_then(|t| t.as_str()) == Some("blob"))
                    .filter_map(|e| e.get("path").and_then(|p| p.as_str()))
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();
        let truncated = body
            .get("truncated")
            .and_then(|t| t.as_bool())
            .unwrap_or(false);

        Ok(TreeListing { paths, truncated })
    }

    async fn fetch_file(
        &self,
        repo: &str,
        commit: &str,
        path: &Path,
    ) -> Result<String, StepwiseError> {
        let url = format!(
            "{}/repos/{repo}/contents/{}?ref={commit}",
            self.base_url,
            path.display()
        );
        self.get_text(&url, "application/vnd.github.raw").await
    }
}

fn classify_octocrab_error(error: octocrab::Error) -> StepwiseError {
    let retryable = match &error {
        octocrab::Error::GitHub { source, .. } => {
            source.status_code.is_server_error() || source.status_code.as_u16() == 429
        }
        // Transport-level failures are worth retrying.
        _ => true,
    };
    StepwiseError::UpstreamFetch {
        message: format!("GitHub API error: {error}"),
        retryable,
    }
}

/// Parse a PR reference string (`owner/repo#number`) into repo and number.
///
/// # Errors
///
/// Returns [`StepwiseError::Config`] if the format is invalid.
///
/// # Examples
///
/// ```
/// use stepwise_pipeline::parse_pr_reference;
///
/// let (repo, num) = parse_pr_reference("octocat/hello-world#42").unwrap();
/// assert_eq!(repo, "octocat/hello-world");
/// assert_eq!(num, 42);
/// ```
pub fn parse_pr_reference(pr_ref: &str) -> Result<(String, u64), StepwiseError> {
    let Some((owner_repo, number_str)) = pr_ref.split_once('#') else {
        return Err(StepwiseError::Config(format!(
            "invalid PR reference '{pr_ref}', expected owner/repo#number"
        )));
    };
    if !owner_repo
        .split_once('/')
        .is_some_and(|(owner, name)| !owner.is_empty() && !name.is_empty())
    {
        return Err(StepwiseError::Config(format!(
            "invalid PR reference '{pr_ref}', expected owner/repo#number"
        )));
    }
    let number: u64 = number_str
        .parse()
        .map_err(|_| StepwiseError::Config(format!("invalid PR number: {number_str}")))?;
    Ok((owner_repo.to_string(), number))
}
