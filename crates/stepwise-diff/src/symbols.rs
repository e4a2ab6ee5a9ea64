use std::collections::HashSet;

/// Pluggable identifier-extraction strategy.
///
/// The default [`LexicalExtractor`] is a deliberate simplification: plain
/// identifier scanning, no compilation or AST work. Clustering and the repo
/// context index both go through this trait so a stronger analyzer can be
/// substituted without touching either.
pub trait IdentifierExtractor: Send + Sync {
    /// Extract candidate symbol names from source text, first occurrence
    /// first, deduplicated.
    fn extract(&self, text: &str) -> Vec<String>;

    /// Extract identifiers from only the added/removed lines of patch text.
    fn extract_changed(&self, patch: &str) -> Vec<String> {
        let changed: String = changed_lines(patch).fold(String::new(), |mut acc, l| {
            acc.push_str(l);
            acc.push('\n');
            acc
        });
        self.extract(&changed)
    }
}

/// Iterate the `+`/`-` payload lines of a hunk patch, markers stripped.
///
/// File headers (`+++`/`---`) are excluded.
pub fn changed_lines(patch: &str) -> impl Iterator<Item = &str> {
    patch.lines().filter_map(|line| {
        if line.starts_with("+++") || line.starts_with("---") {
            None
        } else {
            line.strip_prefix('+').or_else(|| line.strip_prefix('-'))
        }
    })
}

/// Keyword-filtered lexical identifier scanner.
///
/// # Examples
///
/// ```
/// use stepwise_diff::{IdentifierExtractor, LexicalExtractor};
///
/// let extractor = LexicalExtractor::default();
/// let names = extractor.extract("fn verify_token(token: &str) -> Verdict");
/// assert_eq!(names, vec!["verify_token", "token", "Verdict"]);
/// ```
#[derive(Debug, Clone)]
pub struct LexicalExtractor {
    /// Identifiers shorter than this are dropped as noise.
    pub min_length: usize,
}

impl Default for LexicalExtractor {
    fn default() -> Self {
        Self { min_length: 3 }
    }
}

impl IdentifierExtractor for LexicalExtractor {
    fn extract(&self, text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for word in identifier_words(text) {
            if word.len() < self.min_length || is_stopword(word) {
                continue;
            }
            if seen.insert(word.to_string()) {
                out.push(word.to_string());
            }
        }
        out
    }
}

/// Names introduced by a definition-looking line (`fn foo`, `class Bar`,
/// `def baz`, ...). Used by the repo index to separate definition sites
/// from plain references.
pub fn definition_names(line: &str) -> Vec<String> {
    const DEF_KEYWORDS: &[&str] = &[
        "fn", "def", "function", "func", "class", "struct", "enum", "trait", "interface", "impl",
        "type", "module",
    ];
    let words: Vec<&str> = identifier_words(line).collect();
    let mut names = Vec::new();
    for pair in words.windows(2) {
        if DEF_KEYWORDS.contains(&pair[0]) && !is_stopword(pair[1]) && pair[1].len() >= 3 {
            names.push(pair[1].to_string());
        }
    }
    names
}

fn identifier_words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| {
            !w.is_empty() && w.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        })
}

fn is_stopword(word: &str) -> bool {
    // Keywords and ubiquitous tokens across the languages we see in diffs.
    const STOPWORDS: &[&str] = &[
        "abstract", "and", "args", "assert", "async", "await", "begin", "bool", "break", "case",
        "catch", "chan", "char", "class", "const", "continue", "crate", "def", "defer", "delete",
        "docs", "double", "dyn", "elif", "else", "end", "enum", "err", "error", "except",
        "extern", "false", "final", "finally", "float", "fmt", "for", "from", "func", "function",
        "impl", "import", "include", "int", "interface", "lambda", "let", "loop", "map", "match",
        "mod", "module", "move", "mut", "new", "nil", "none", "not", "null", "of", "or",
        "override", "package", "pass", "print", "println", "private", "protected", "pub",
        "public", "raise", "range", "ref", "require", "result", "return", "self", "static",
        "str", "string", "struct", "super", "switch", "then", "this", "throw", "throws", "trait",
        "true", "try", "type", "unsafe", "use", "usize", "value", "var", "vec", "void", "where",
        "while", "with", "yield",
    ];
    STOPWORDS.binary_search(&word.to_ascii_lowercase().as_str()).is_ok()
}
