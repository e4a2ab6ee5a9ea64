use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use stepwise_core::{ContextConfig, Location, StepwiseError};
use stepwise_diff::symbols::definition_names;
use stepwise_diff::IdentifierExtractor;

/// File extensions the index considers source code.
const INDEXABLE_EXTENSIONS: &[&str] = &[
    "rs", "py", "ts", "tsx", "js", "jsx", "go", "java", "c", "h", "cpp", "cc", "hpp", "rb", "php",
    "kt", "kts", "swift", "cs", "scala", "ex", "exs", "lua", "pl", "sh",
];

/// Directory names skipped during indexing.
const SKIPPED_DIRS: &[&str] = &["node_modules", "vendor", "dist", "build", "target", ".git"];

/// A repository tree listing at one commit.
#[derive(Debug, Clone)]
pub struct TreeListing {
    /// Blob paths relative to the repository root.
    pub paths: Vec<PathBuf>,
    /// True when the host could not enumerate the full tree.
    pub truncated: bool,
}

/// Read-only access to a repository tree at a fixed commit.
///
/// Implemented by the GitHub host client; tests use in-memory fakes.
pub trait TreeSource: Send + Sync {
    /// List every blob in the tree at `commit`.
    fn list_tree(
        &self,
        repo: &str,
        commit: &str,
    ) -> impl Future<Output = Result<TreeListing, StepwiseError>> + Send;

    /// Fetch one file's content at `commit`.
    fn fetch_file(
        &self,
        repo: &str,
        commit: &str,
        path: &Path,
    ) -> impl Future<Output = Result<String, StepwiseError>> + Send;
}

/// Definition and reference sites recorded for one symbol.
#[derive(Debug, Clone, Default)]
pub struct SymbolSites {
    /// Lines that introduce the symbol (`fn foo`, `class Foo`, ...).
    pub definitions: Vec<Location>,
    /// Every other line mentioning the symbol.
    pub references: Vec<Location>,
}

/// Symbol map for one repository snapshot, memoized per (repo, commit).
///
/// Immutable once built; invalidation happens only by indexing a new
/// commit SHA.
#[derive(Debug, Clone)]
pub struct RepoContextIndex {
    /// Repository as `owner/name`.
    pub repo: String,
    /// Commit SHA the index describes.
    pub commit: String,
    /// Symbol name to definition/reference sites.
    pub symbols: BTreeMap<String, SymbolSites>,
    /// Files that were indexed, sorted.
    pub files: Vec<PathBuf>,
    /// True when the file cap or the host cut coverage short; consumers
    /// should down-rank confidence in lookups.
    pub truncated: bool,
}

impl RepoContextIndex {
    /// Sites for `name`, if the index saw it.
    pub fn sites(&self, name: &str) -> Option<&SymbolSites> {
        self.symbols.get(name)
    }

    /// Distinct files mentioning `name`, definitions included.
    pub fn referencing_files(&self, name: &str) -> Vec<&Path> {
        let Some(sites) = self.sites(name) else {
            return Vec::new();
        };
        let mut paths: Vec<&Path> = sites
            .definitions
            .iter()
            .chain(&sites.references)
            .map(|l| l.path.as_path())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }
}

/// Limits applied while building an index.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Hard cap on indexed files; beyond it the index is marked truncated.
    pub max_files: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self { max_files: 2000 }
    }
}

impl From<&ContextConfig> for IndexOptions {
    fn from(config: &ContextConfig) -> Self {
        Self {
            max_files: config.max_indexed_files,
        }
    }
}

/// Walk the tree at `commit` and build the symbol index.
///
/// Oversized repositories are truncated at `max_files` and flagged rather
/// than failed; individual unreadable files are skipped unless the failure
/// is retryable, in which case it propagates so the job can back off.
///
/// # Errors
///
/// [`StepwiseError::UpstreamFetch`] on host failures,
/// [`StepwiseError::RepoTooLarge`] when the host cannot enumerate the tree
/// at all.
pub async fn build_index<T: TreeSource>(
    source: &T,
    repo: &str,
    commit: &str,
    extractor: &dyn IdentifierExtractor,
    options: &IndexOptions,
) -> Result<RepoContextIndex, StepwiseError> {
    let listing = source.list_tree(repo, commit).await?;
    if listing.paths.is_empty() && listing.truncated {
        return Err(StepwiseError::RepoTooLarge { repo: repo.into() });
    }

    let mut indexable: Vec<PathBuf> = listing
        .paths
        .into_iter()
        .filter(|p| is_indexable(p))
        .collect();
    indexable.sort();

    let truncated = listing.truncated || indexable.len() > options.max_files;
    indexable.truncate(options.max_files);

    let mut symbols: BTreeMap<String, SymbolSites> = BTreeMap::new();
    for path in &indexable {
        let content = match source.fetch_file(repo, commit, path).await {
            Ok(content) => content,
            Err(e) if e.is_retryable() => return Err(e),
            Err(_) => continue,
        };
        index_file(path, &content, extractor, &mut symbols);
    }

    Ok(RepoContextIndex {
        repo: repo.into(),
        commit: commit.into(),
        symbols,
        files: indexable,
        truncated,
    })
}

fn index_file(
    path: &Path,
    content: &str,
    extractor: &dyn IdentifierExtractor,
    symbols: &mut BTreeMap<String, SymbolSites>,
) {
    for (number, line) in content.lines().enumerate() {
        let line_no = (number + 1) as u32;
        let location = Location {
            path: path.to_path_buf(),
            line: line_no,
        };
        let defined = definition_names(line);
        for name in &defined {
            symbols
                .entry(name.clone())
                .or_default()
                .definitions
                .push(location.clone());
        }
        for name in extractor.extract(line) {
            if defined.contains(&name) {
                continue;
            }
            symbols
                .entry(name)
                .or_default()
                .references
                .push(location.clone());
        }
    }
}

fn is_indexable(path: &Path) -> bool {
    if path
        .components()
        .any(|c| SKIPPED_DIRS.contains(&c.as_os_str().to_string_lossy().as_ref()))
    {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| INDEXABLE_EXTENSIONS.contains(&ext))
}

type CacheKey = (String, String);
type CacheCell = Arc<OnceCell<Arc<RepoContextIndex>>>;

/// Single-flight memoization of [`RepoContextIndex`] per (repo, commit).
///
/// Concurrent `get_or_build` calls for the same key run the build exactly
/// once; the rest suspend on the cell until the result publishes. A failed
/// build leaves the cell empty so a retry can rebuild.
///
/// # Examples
///
/// ```
/// use stepwise_context::IndexCache;
///
/// let cache = IndexCache::new();
/// assert!(!cache.is_cached("acme/api", "abc123"));
/// ```
#[derive(Default)]
pub struct IndexCache {
    cells: Mutex<HashMap<CacheKey, CacheCell>>,
}

impl IndexCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the index for (repo, commit), building it at most once.
    ///
    /// # Errors
    ///
    /// Propagates the build error to every waiter; the key stays
    /// uncached so a later call retries the build.
    pub async fn get_or_build<T: TreeSource>(
        &self,
        source: &T,
        repo: &str,
        commit: &str,
        extractor: &dyn IdentifierExtractor,
        options: &IndexOptions,
    ) -> Result<Arc<RepoContextIndex>, StepwiseError> {
        let cell = {
            let mut cells = self.cells.lock().await;
            cells
                .entry((repo.to_string(), commit.to_string()))
                .or_default()
                .clone()
        };
        let index = cell
            .get_or_try_init(|| async {
                build_index(source, repo, commit, extractor, options)
                    .await
                    .map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(index))
    }

    /// Whether a completed index exists for (repo, commit).
    pub fn is_cached(&self, repo: &str, commit: &str) -> bool {
        match self.cells.try_lock() {
            Ok(cells) => cells
                .get(&(repo.to_string(), commit.to_string()))
                .is_some_and(|cell| cell.initialized()),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use stepwise_diff::LexicalExtractor;

    struct FakeTree {
        files: Vec<(PathBuf, String)>,
        truncated: bool,
        list_calls: AtomicUsize,
        fail_first_list: AtomicUsize,
    }

    impl FakeTree {
        fn new(files: Vec<(&str, &str)>) -> Self {
            Self {
                files: files
                    .into_iter()
                    .map(|(p, c)| (PathBuf::from(p), c.to_string()))
                    .collect(),
                truncated: false,
                list_calls: AtomicUsize::new(0),
                fail_first_list: AtomicUsize::new(0),
            }
        }
    }

    impl TreeSource for FakeTree {
        async fn list_tree(&self, _repo: &str, _commit: &str) -> Result<TreeListing, StepwiseError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first_list.load(Ordering::SeqCst) > 0 {
                self.fail_first_list.fetch_sub(1, Ordering::SeqCst);
                return Err(StepwiseError::UpstreamFetch {
                    message: "503".into(),
                    retryable: true,
                });
            }
            Ok(TreeListing {
                paths: self.files.iter().map(|(p, _)| p.clone()).collect(),
                truncated: self.truncated,
            })
        }

        async fn fetch_file(
            &self,
            _repo: &str,
            _commit: &str,
            path: &Path,
        ) -> Result<String, StepwiseError> {
            self.files
                .iter()
                .find(|(p, _)| p == path)
                .map(|(_, c)| c.clone())
                .ok_or_else(|| StepwiseError::NotFound(path.display().to_string()))
        }
    }

    fn extractor() -> LexicalExtractor {
        LexicalExtractor::default()
    }

    #[tokio::test]
    async fn index_records_definitions_and_references() {
        let tree = FakeTree::new(vec![
            ("src/auth.py", "def check_password(user):\n    return hash_of(user)\n"),
            ("src/caller.py", "check_password(current_user)\n"),
        ]);
        let index = build_index(&tree, "o/r", "sha1", &extractor(), &IndexOptions::default())
            .await
            .unwrap();

        let sites = index.sites("check_password").unwrap();
        assert_eq!(sites.definitions.len(), 1);
        assert_eq!(sites.definitions[0].path, PathBuf::from("src/auth.py"));
        assert_eq!(sites.references.len(), 1);
        assert_eq!(sites.references[0].path, PathBuf::from("src/caller.py"));
        assert!(!index.truncated);
    }

    #[tokio::test]
    async fn non_source_and_vendored_files_are_skipped() {
        let tree = FakeTree::new(vec![
            ("README.md", "check_password everywhere"),
            ("node_modules/x/index.js", "check_password()"),
            ("src/ok.rs", "fn check_password() {}"),
        ]);
        let index = build_index(&tree, "o/r", "sha1", &extractor(), &IndexOptions::default())
            .await
            .unwrap();
        assert_eq!(index.files, vec![PathBuf::from("src/ok.rs")]);
    }

    #[tokio::test]
    async fn file_cap_marks_index_truncated() {
        let tree = FakeTree::new(vec![
            ("a.rs", "fn aaa_one() {}"),
            ("b.rs", "fn bbb_two() {}"),
            ("c.rs", "fn ccc_three() {}"),
        ]);
        let options = IndexOptions { max_files: 2 };
        let index = build_index(&tree, "o/r", "sha1", &extractor(), &options)
            .await
            .unwrap();
        assert!(index.truncated);
        assert_eq!(index.files.len(), 2);
        assert!(index.sites("ccc_three").is_none());
    }

    #[tokio::test]
    async fn empty_truncated_listing_is_repo_too_large() {
        let mut tree = FakeTree::new(vec![]);
        tree.truncated = true;
        let result = build_index(&tree, "o/r", "sha1", &extractor(), &IndexOptions::default()).await;
        assert!(matches!(result, Err(StepwiseError::RepoTooLarge { .. })));
    }

    #[tokio::test]
    async fn concurrent_builds_collapse_to_one() {
        let tree = Arc::new(FakeTree::new(vec![("a.rs", "fn one_symbol() {}")]));
        let cache = Arc::new(IndexCache::new());
        let extractor = extractor();
        let options = IndexOptions::default();

        let (left, right) = tokio::join!(
            cache.get_or_build(&*tree, "o/r", "sha1", &extractor, &options),
            cache.get_or_build(&*tree, "o/r", "sha1", &extractor, &options),
        );
        assert!(left.is_ok() && right.is_ok());
        assert_eq!(tree.list_calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_cached("o/r", "sha1"));
    }

    #[tokio::test]
    async fn distinct_commits_build_separately() {
        let tree = FakeTree::new(vec![("a.rs", "fn one_symbol() {}")]);
        let cache = IndexCache::new();
        let options = IndexOptions::default();

        cache
            .get_or_build(&tree, "o/r", "sha1", &extractor(), &options)
            .await
            .unwrap();
        cache
            .get_or_build(&tree, "o/r", "sha2", &extractor(), &options)
            .await
            .unwrap();
        assert_eq!(tree.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_build_is_retried_on_next_call() {
        let tree = FakeTree::new(vec![("a.rs", "fn one_symbol() {}")]);
        tree.fail_first_list.store(1, Ordering::SeqCst);
        let cache = IndexCache::new();
        let options = IndexOptions::default();

        let first = cache
            .get_or_build(&tree, "o/r", "sha1", &extractor(), &options)
            .await;
        assert!(first.is_err());
        assert!(!cache.is_cached("o/r", "sha1"));

        let second = cache
            .get_or_build(&tree, "o/r", "sha1", &extractor(), &options)
            .await;
        assert!(second.is_ok());
    }
}
