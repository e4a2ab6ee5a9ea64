use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use petgraph::unionfind::UnionFind;
use uuid::Uuid;

use stepwise_core::{
    ClusterConfig, Hunk, LineRange, ReviewStep, ScopeEntry, StepStatus, StepwiseError,
};
use stepwise_diff::IdentifierExtractor;

/// Thresholds controlling candidate merging and step splitting.
///
/// # Examples
///
/// ```
/// use stepwise_cluster::ClusterOptions;
///
/// let options = ClusterOptions::default();
/// assert_eq!(options.proximity_lines, 10);
/// assert_eq!(options.max_step_lines, 400);
/// ```
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Same-file hunks closer than this many lines merge into one candidate.
    pub proximity_lines: u32,
    /// Changed-line cap per step.
    pub max_step_lines: u32,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            proximity_lines: 10,
            max_step_lines: 400,
        }
    }
}

impl From<&ClusterConfig> for ClusterOptions {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            proximity_lines: config.proximity_lines,
            max_step_lines: config.max_step_lines,
        }
    }
}

/// One merged run of same-file hunks, with its extracted symbols.
#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    hunks: Vec<Hunk>,
    range: LineRange,
    changed_lines: u32,
    symbols: BTreeSet<String>,
}

impl Candidate {
    fn from_hunk(hunk: Hunk, extractor: &dyn IdentifierExtractor) -> Self {
        let symbols = extractor.extract_changed(&hunk.patch).into_iter().collect();
        Self {
            path: hunk.file_path.clone(),
            range: hunk.anchor_range(),
            changed_lines: hunk.changed_line_count(),
            symbols,
            hunks: vec![hunk],
        }
    }

    fn absorb(&mut self, hunk: Hunk, extractor: &dyn IdentifierExtractor) {
        self.range = self.range.union(&hunk.anchor_range());
        self.changed_lines += hunk.changed_line_count();
        self.symbols
            .extend(extractor.extract_changed(&hunk.patch));
        self.hunks.push(hunk);
    }
}

/// Partition `hunks` into an ordered sequence of review steps.
///
/// Guarantees:
/// - every input hunk lands in exactly one step (partition invariant);
/// - identical input yields an identical step sequence (determinism);
/// - no multi-hunk step exceeds `max_step_lines` changed lines — a single
///   oversized hunk is atomic and becomes its own step.
///
/// # Errors
///
/// Returns [`StepwiseError::Clustering`] only on malformed hunk input
/// (empty file path or empty patch), which ingestion's contract rules out.
pub fn cluster_hunks(
    session_id: Uuid,
    hunks: &[Hunk],
    options: &ClusterOptions,
    extractor: &dyn IdentifierExtractor,
) -> Result<Vec<ReviewStep>, StepwiseError> {
    validate(hunks)?;

    let candidates = merge_by_proximity(hunks, options.proximity_lines, extractor);
    let groups = group_by_symbols(&candidates);
    let units = apply_size_cap(candidates, groups, options.max_step_lines);

    let mut steps: Vec<ReviewStep> = units
        .into_iter()
        .map(|unit| build_step(session_id, unit))
        .collect();

    // Deterministic traversal order: earliest path touched, then the first
    // line the step covers in that path.
    steps.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    for (index, step) in steps.iter_mut().enumerate() {
        step.order_index = index as u32;
    }
    Ok(steps)
}

fn validate(hunks: &[Hunk]) -> Result<(), StepwiseError> {
    for hunk in hunks {
        if hunk.file_path.as_os_str().is_empty() {
            return Err(StepwiseError::Clustering("hunk with empty file path".into()));
        }
        if hunk.patch.is_empty() {
            return Err(StepwiseError::Clustering(format!(
                "hunk with empty patch in {}",
                hunk.file_path.display()
            )));
        }
    }
    Ok(())
}

/// Stage 1: merge same-file hunks whose ranges sit within the proximity
/// threshold of each other.
fn merge_by_proximity(
    hunks: &[Hunk],
    proximity_lines: u32,
    extractor: &dyn IdentifierExtractor,
) -> Vec<Candidate> {
    let mut by_file: BTreeMap<PathBuf, Vec<Hunk>> = BTreeMap::new();
    for hunk in hunks {
        by_file
            .entry(hunk.file_path.clone())
            .or_default()
            .push(hunk.clone());
    }

    let mut candidates = Vec::new();
    for (_, mut file_hunks) in by_file {
        file_hunks.sort_by_key(|h| h.anchor_range());
        let mut current: Option<Candidate> = None;
        for hunk in file_hunks {
            match current.as_mut() {
                Some(candidate) if candidate.range.gap_to(&hunk.anchor_range()) <= proximity_lines => {
                    candidate.absorb(hunk, extractor);
                }
                _ => {
                    if let Some(done) = current.take() {
                        candidates.push(done);
                    }
                    current = Some(Candidate::from_hunk(hunk, extractor));
                }
            }
        }
        if let Some(done) = current.take() {
            candidates.push(done);
        }
    }
    candidates
}

/// Stage 2: union candidates in *different* files that share a symbol name.
/// Returns group labels, one per candidate index.
fn group_by_symbols(candidates: &[Candidate]) -> Vec<usize> {
    let mut by_symbol: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (index, candidate) in candidates.iter().enumerate() {
        for symbol in &candidate.symbols {
            by_symbol.entry(symbol.as_str()).or_default().push(index);
        }
    }

    let mut union_find = UnionFind::<usize>::new(candidates.len());
    for indices in by_symbol.values() {
        for (pos, &a) in indices.iter().enumerate() {
            for &b in &indices[pos + 1..] {
                if candidates[a].path != candidates[b].path {
                    union_find.union(a, b);
                }
            }
        }
    }
    union_find.into_labeling()
}

/// Stage 3: dissolve groups whose combined size exceeds the cap back into
/// their file-level candidates; an oversized lone candidate falls back to
/// one step per hunk.
fn apply_size_cap(
    candidates: Vec<Candidate>,
    labels: Vec<usize>,
    max_step_lines: u32,
) -> Vec<Vec<Candidate>> {
    let mut grouped: BTreeMap<usize, Vec<Candidate>> = BTreeMap::new();
    for (candidate, label) in candidates.into_iter().zip(labels) {
        grouped.entry(label).or_default().push(candidate);
    }

    let mut units = Vec::new();
    for (_, group) in grouped {
        let total: u32 = group.iter().map(|c| c.changed_lines).sum();
        if total <= max_step_lines {
            units.push(group);
            continue;
        }
        // Over the cap: dissolve into file-level candidates. A candidate
        // that is itself oversized splits further at hunk granularity; a
        // single oversized hunk is atomic and stays whole.
        for candidate in group {
            if candidate.changed_lines > max_step_lines && candidate.hunks.len() > 1 {
                units.extend(split_candidate(candidate));
            } else {
                units.push(vec![candidate]);
            }
        }
    }
    units
}

fn split_candidate(candidate: Candidate) -> Vec<Vec<Candidate>> {
    let Candidate {
        path,
        hunks,
        symbols,
        ..
    } = candidate;
    hunks
        .into_iter()
        .map(|hunk| {
            vec![Candidate {
                path: path.clone(),
                range: hunk.anchor_range(),
                changed_lines: hunk.changed_line_count(),
                symbols: symbols.clone(),
                hunks: vec![hunk],
            }]
        })
        .collect()
}

fn build_step(session_id: Uuid, unit: Vec<Candidate>) -> ReviewStep {
    let mut hunks: Vec<Hunk> = unit.iter().flat_map(|c| c.hunks.iter().cloned()).collect();
    hunks.sort_by_key(|h| (h.file_path.clone(), h.anchor_range()));

    let scope: Vec<ScopeEntry> = hunks
        .iter()
        .map(|h| ScopeEntry {
            path: h.file_path.clone(),
            range: h.anchor_range(),
        })
        .collect();
    let changed_lines = hunks.iter().map(Hunk::changed_line_count).sum();

    let paths: BTreeSet<&PathBuf> = unit.iter().map(|c| &c.path).collect();
    let symbols: BTreeSet<&str> = unit
        .iter()
        .flat_map(|c| c.symbols.iter().map(String::as_str))
        .collect();

    ReviewStep {
        id: Uuid::new_v4(),
        session_id,
        order_index: 0,
        title: step_title(&paths, &symbols),
        scope,
        hunks,
        changed_lines,
        status: StepStatus::Pending,
    }
}

/// Heuristic label: touched file names plus up to three symbol names.
fn step_title(paths: &BTreeSet<&PathBuf>, symbols: &BTreeSet<&str>) -> String {
    let mut names: Vec<String> = paths
        .iter()
        .map(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| p.display().to_string())
        })
        .collect();
    names.sort();
    names.dedup();

    let mut title = match names.len() {
        0 => "Empty step".to_string(),
        1 => names[0].clone(),
        2 => format!("{}, {}", names[0], names[1]),
        n => format!("{} + {} more", names[0], n - 1),
    };

    let picked: Vec<&str> = symbols.iter().take(3).copied().collect();
    if !picked.is_empty() {
        title.push_str(&format!(" ({})", picked.join(", ")));
    }
    title
}

fn sort_key(step: &ReviewStep) -> (PathBuf, u32) {
    let earliest_path = step
        .scope
        .iter()
        .map(|s| s.path.clone())
        .min()
        .unwrap_or_default();
    let earliest_line = step
        .scope
        .iter()
        .filter(|s| s.path == earliest_path)
        .map(|s| s.range.start)
        .min()
        .unwrap_or(0);
    (earliest_path, earliest_line)
}
