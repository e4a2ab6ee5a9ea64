use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use uuid::Uuid;

use stepwise_core::{ContextConfig, ContextPack, ReviewStep, SymbolContext};
use stepwise_diff::IdentifierExtractor;

use crate::index::RepoContextIndex;

/// Reference sites kept per symbol, to bound pack size.
const MAX_REFERENCES_PER_SYMBOL: usize = 25;

/// Limits applied while assembling a pack.
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Maximum symbols per pack.
    pub max_symbols: usize,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self { max_symbols: 50 }
    }
}

impl From<&ContextConfig> for PackOptions {
    fn from(config: &ContextConfig) -> Self {
        Self {
            max_symbols: config.max_symbols,
        }
    }
}

/// Assemble the context pack for one step from the repo index.
///
/// Symbols that appear in the step's own diff come first; the remaining
/// budget goes to symbols defined inside the step's files (transitively
/// discovered). Rebuilding produces an equivalent pack with a fresh id —
/// persistence keys packs by step id, so a rebuild replaces the old one.
///
/// # Examples
///
/// ```no_run
/// # use stepwise_context::{build_context_pack, PackOptions, RepoContextIndex};
/// # fn demo(step: &stepwise_core::ReviewStep, index: &RepoContextIndex) {
/// let extractor = stepwise_diff::LexicalExtractor::default();
/// let pack = build_context_pack(step, index, &extractor, &PackOptions::default());
/// assert!(pack.symbols.len() <= 50);
/// # }
/// ```
pub fn build_context_pack(
    step: &ReviewStep,
    index: &RepoContextIndex,
    extractor: &dyn IdentifierExtractor,
    options: &PackOptions,
) -> ContextPack {
    let scope_paths: BTreeSet<&Path> = step.scope.iter().map(|s| s.path.as_path()).collect();

    // Diff-local symbols, first occurrence first.
    let mut ordered: Vec<(String, bool)> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for hunk in &step.hunks {
        for name in extractor.extract_changed(&hunk.patch) {
            if seen.insert(name.clone()) {
                ordered.push((name, true));
            }
        }
    }

    // Transitively discovered: symbols the index says are defined in the
    // step's files.
    for (name, sites) in &index.symbols {
        if ordered.len() >= options.max_symbols {
            break;
        }
        let defined_in_scope = sites
            .definitions
            .iter()
            .any(|loc| scope_paths.contains(loc.path.as_path()));
        if defined_in_scope && seen.insert(name.clone()) {
            ordered.push((name.clone(), false));
        }
    }
    ordered.truncate(options.max_symbols);

    let symbols = ordered
        .into_iter()
        .map(|(name, from_diff)| symbol_context(&name, from_diff, index, &scope_paths))
        .collect();

    ContextPack {
        id: Uuid::new_v4(),
        step_id: step.id,
        symbols,
        index_truncated: index.truncated,
        generated_at: Utc::now(),
    }
}

fn symbol_context(
    name: &str,
    from_diff: bool,
    index: &RepoContextIndex,
    scope_paths: &BTreeSet<&Path>,
) -> SymbolContext {
    let (definition, references) = match index.sites(name) {
        Some(sites) => {
            let definition = sites
                .definitions
                .iter()
                .find(|loc| !scope_paths.contains(loc.path.as_path()))
                .or_else(|| sites.definitions.first())
                .cloned();
            let references = sites
                .references
                .iter()
                .take(MAX_REFERENCES_PER_SYMBOL)
                .cloned()
                .collect();
            (definition, references)
        }
        None => (None, Vec::new()),
    };

    SymbolContext {
        name: name.to_string(),
        definition,
        references,
        related_tests: related_tests(name, index, scope_paths),
        from_diff,
    }
}

/// Test files related to `name`: test-looking files that mention the
/// symbol, plus test files whose base name shadows one of the step's
/// files (`auth.py` -> `auth_test.py`, `test_auth.py`, ...).
fn related_tests(
    name: &str,
    index: &RepoContextIndex,
    scope_paths: &BTreeSet<&Path>,
) -> Vec<PathBuf> {
    let mut tests: BTreeSet<PathBuf> = index
        .referencing_files(name)
        .into_iter()
        .filter(|p| is_test_path(p))
        .map(Path::to_path_buf)
        .collect();

    let scope_stems: Vec<String> = scope_paths
        .iter()
        .filter_map(|p| p.file_stem())
        .map(|s| s.to_string_lossy().to_lowercase())
        .collect();
    for file in &index.files {
        if !is_test_path(file) {
            continue;
        }
        let Some(stem) = file.file_stem().map(|s| s.to_string_lossy().to_lowercase()) else {
            continue;
        };
        if scope_stems
            .iter()
            .any(|scope| stem.contains(scope.as_str()) && stem != *scope)
        {
            tests.insert(file.clone());
        }
    }
    tests.into_iter().collect()
}

/// Path-based test heuristic: marker prefix/suffix on the base name, or a
/// conventional test directory component.
pub fn is_test_path(path: &Path) -> bool {
    const TEST_DIRS: &[&str] = &["tests", "test", "__tests__", "spec", "specs"];
    if path.components().any(|c| {
        TEST_DIRS.contains(&c.as_os_str().to_string_lossy().to_lowercase().as_str())
    }) {
        return true;
    }
    let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_lowercase()) else {
        return false;
    };
    stem.starts_with("test_")
        || stem.starts_with("test-")
        || stem.ends_with("_test")
        || stem.ends_with("_tests")
        || stem.ends_with("_spec")
        || stem.ends_with(".test")
        || stem.ends_with(".spec")
}
