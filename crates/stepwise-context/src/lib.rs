//! Cross-repository context: the memoized symbol index and per-step packs.
//!
//! [`IndexCache`] memoizes one [`RepoContextIndex`] per (repo, commit)
//! behind a single-flight guard: concurrent pack builds for the same commit
//! collapse into one build and the rest suspend until it publishes. The
//! index is written once and read-only afterwards; a new commit gets a new
//! entry, existing entries are never mutated.

pub mod index;
pub mod pack;

pub use index::{IndexCache, IndexOptions, RepoContextIndex, SymbolSites, TreeListing, TreeSource};
pub use pack::{build_context_pack, PackOptions};
