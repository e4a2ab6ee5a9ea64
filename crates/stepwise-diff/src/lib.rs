//! Unified-diff decomposition and lightweight identifier extraction.
//!
//! Turns raw PR diff text into [`stepwise_core::Hunk`]s, split strictly on
//! hunk headers, and extracts candidate symbol names from patch text with a
//! lexical scanner. No parsing beyond identifier matching happens here; the
//! extractor is a pluggable strategy so a stronger analyzer can be swapped
//! in without touching clustering or context logic.

pub mod parser;
pub mod symbols;

pub use parser::{flatten_hunks, parse_unified_diff, FileDiff};
pub use symbols::{IdentifierExtractor, LexicalExtractor};
