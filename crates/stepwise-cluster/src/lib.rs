//! Change-unit clustering: partition a diff's hunks into ordered review steps.
//!
//! The engine merges nearby hunks within a file, groups candidates across
//! files that touch overlapping symbol names, caps step size, and emits a
//! deterministic ordering. The output is always an exact partition of the
//! input hunks — in the degenerate case, one step per hunk.

mod engine;

pub use engine::{cluster_hunks, ClusterOptions};
