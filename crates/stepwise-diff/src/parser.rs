use std::fmt;
use std::path::PathBuf;

use stepwise_core::{ChangeType, Hunk, StepwiseError};

/// A complete diff for a single file, containing one or more hunks.
///
/// # Examples
///
/// ```
/// use stepwise_diff::parse_unified_diff;
///
/// let diff = "diff --git a/hello.rs b/hello.rs\n\
///             --- a/hello.rs\n\
///             +++ b/hello.rs\n\
///             @@ -1,3 +1,4 @@\n\
///              fn main() {\n\
///             +    println!(\"hello\");\n\
///              }\n";
/// let files = parse_unified_diff(diff).unwrap();
/// assert_eq!(files.len(), 1);
/// assert_eq!(files[0].hunks.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct FileDiff {
    /// Path in the old version.
    pub old_path: PathBuf,
    /// Path in the new version.
    pub new_path: PathBuf,
    /// Parsed hunks for this file.
    pub hunks: Vec<Hunk>,
    /// Whether this is a newly created file.
    pub is_new_file: bool,
    /// Whether this file was deleted.
    pub is_deleted_file: bool,
    /// Whether this file was renamed.
    pub is_rename: bool,
}

impl FileDiff {
    fn empty() -> Self {
        Self {
            old_path: PathBuf::new(),
            new_path: PathBuf::new(),
            hunks: Vec::new(),
            is_new_file: false,
            is_deleted_file: false,
            is_rename: false,
        }
    }
}

impl fmt::Display for FileDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} hunks)", self.new_path.display(), self.hunks.len())
    }
}

/// Parse a unified diff string (as produced by `git diff` or the GitHub
/// diff endpoint) into structured [`FileDiff`] entries.
///
/// Splits strictly on `@@` hunk headers with no merging; handles new,
/// deleted, and renamed files; skips binary files.
///
/// # Errors
///
/// Returns [`StepwiseError::Clustering`] if a hunk header is malformed.
pub fn parse_unified_diff(input: &str) -> Result<Vec<FileDiff>, StepwiseError> {
    let mut state = ParseState::default();
    for line in input.lines() {
        state.feed(line)?;
    }
    Ok(state.finish())
}

/// Collect every hunk from all files into one flat list, in file order.
///
/// This is the shape the clustering engine consumes.
pub fn flatten_hunks(files: &[FileDiff]) -> Vec<Hunk> {
    files.iter().flat_map(|f| f.hunks.iter().cloned()).collect()
}

#[derive(Default)]
struct ParseState {
    files: Vec<FileDiff>,
    file: Option<FileDiff>,
    hunk: Option<Hunk>,
    binary: bool,
}

impl ParseState {
    fn feed(&mut self, line: &str) -> Result<(), StepwiseError> {
        if line.starts_with("diff --git ") {
            self.close_file();
            self.file = Some(FileDiff::empty());
            return Ok(());
        }

        // Standard patches may lack the "diff --git" command line; a ---
        // header then implicitly opens a file.
        if line.starts_with("--- ") && self.file.is_none() {
            self.file = Some(FileDiff::empty());
        }

        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        if line.starts_with("Binary files ") && line.ends_with(" differ") {
            self.binary = true;
            return Ok(());
        }
        if line.starts_with("new file mode") {
            file.is_new_file = true;
            return Ok(());
        }
        if line.starts_with("deleted file mode") {
            file.is_deleted_file = true;
            return Ok(());
        }
        if line.starts_with("rename from ") || line.starts_with("rename to ") {
            file.is_rename = true;
            return Ok(());
        }
        if line.starts_with("index ") || line.starts_with("similarity index") {
            return Ok(());
        }

        if let Some(path) = line.strip_prefix("--- ") {
            file.old_path = strip_diff_prefix(path);
            return Ok(());
        }
        if let Some(path) = line.strip_prefix("+++ ") {
            file.new_path = strip_diff_prefix(path);
            if path == "/dev/null" {
                file.is_deleted_file = true;
            }
            return Ok(());
        }

        if line.starts_with("@@ ") {
            self.flush_hunk();
            self.begin_hunk(line)?;
            return Ok(());
        }

        if line == "\\ No newline at end of file" {
            return Ok(());
        }

        if let Some(hunk) = self.hunk.as_mut() {
            if line.starts_with('+') || line.starts_with('-') || line.starts_with(' ') {
                hunk.patch.push_str(line);
                hunk.patch.push('\n');
            }
        }
        Ok(())
    }

    fn begin_hunk(&mut self, header: &str) -> Result<(), StepwiseError> {
        let file = self.file.as_ref().ok_or_else(|| {
            StepwiseError::Clustering(format!("hunk header outside a file diff: {header}"))
        })?;
        let (old_start, old_lines, new_start, new_lines) = parse_hunk_header(header)?;

        let file_path = if file.is_deleted_file {
            file.old_path.clone()
        } else {
            file.new_path.clone()
        };
        let change_type = if file.is_new_file || old_lines == 0 {
            ChangeType::Add
        } else if file.is_deleted_file || new_lines == 0 {
            ChangeType::Delete
        } else {
            ChangeType::Modify
        };

        self.hunk = Some(Hunk {
            file_path,
            old_start,
            old_lines,
            new_start,
            new_lines,
            patch: String::new(),
            change_type,
        });
        Ok(())
    }

    fn flush_hunk(&mut self) {
        if let (Some(hunk), Some(file)) = (self.hunk.take(), self.file.as_mut()) {
            file.hunks.push(hunk);
        }
    }

    fn close_file(&mut self) {
        self.flush_hunk();
        if let Some(file) = self.file.take() {
            if !self.binary {
                self.files.push(file);
            }
        }
        self.binary = false;
    }

    fn finish(mut self) -> Vec<FileDiff> {
        self.close_file();
        self.files
    }
}

fn strip_diff_prefix(raw: &str) -> PathBuf {
    let unquoted = raw.trim_matches('"');
    if unquoted == "/dev/null" {
        return PathBuf::from("/dev/null");
    }
    let stripped = unquoted
        .strip_prefix("a/")
        .or_else(|| unquoted.strip_prefix("b/"))
        .unwrap_or(unquoted);
    PathBuf::from(stripped)
}

fn parse_hunk_header(line: &str) -> Result<(u32, u32, u32, u32), StepwiseError> {
    let malformed = || StepwiseError::Clustering(format!("malformed hunk header: {line}"));

    let mut tokens = line.split_whitespace();
    if tokens.next() != Some("@@") {
        return Err(malformed());
    }
    let old = tokens
        .next()
        .and_then(|t| t.strip_prefix('-'))
        .ok_or_else(malformed)?;
    let new = tokens
        .next()
        .and_then(|t| t.strip_prefix('+'))
        .ok_or_else(malformed)?;

    let (old_start, old_lines) = parse_range(old).ok_or_else(malformed)?;
    let (new_start, new_lines) = parse_range(new).ok_or_else(malformed)?;
    Ok((old_start, old_lines, new_start, new_lines))
}

fn parse_range(range: &str) -> Option<(u32, u32)> {
    match range.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_diff_returns_empty_vec() {
        let files = parse_unified_diff("").unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn single_file_single_hunk() {
        let diff = "\
diff --git a/src/main.rs b/src/main.rs
index abc1234..def5678 100644
--- a/src/main.rs
+++ b/src/main.rs
@@ -1,3 +1,4 @@
 fn main() {
+    println!(\"hello\");
     let x = 1;
 }
";
        let files = parse_unified_diff(diff).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].new_path, PathBuf::from("src/main.rs"));
        assert_eq!(files[0].hunks.len(), 1);
        let hunk = &files[0].hunks[0];
        assert_eq!((hunk.old_start, hunk.old_lines), (1, 3));
        assert_eq!((hunk.new_start, hunk.new_lines), (1, 4));
        assert_eq!(hunk.change_type, ChangeType::Modify);
        assert!(hunk.patch.contains("+    println!"));
    }

    #[test]
    fn hunks_split_strictly_on_headers() {
        let diff = "\
diff --git a/lib.rs b/lib.rs
--- a/lib.rs
+++ b/lib.rs
@@ -1,3 +1,4 @@
 fn foo() {
+    bar();
 }
@@ -10,3 +11,4 @@
 fn baz() {
+    qux();
 }
";
        let files = parse_unified_diff(diff).unwrap();
        assert_eq!(files[0].hunks.len(), 2);
        assert_eq!(files[0].hunks[0].old_start, 1);
        assert_eq!(files[0].hunks[1].old_start, 10);
    }

    #[test]
    fn multiple_files_flatten_in_order() {
        let diff = "\
diff --git a/a.rs b/a.rs
--- a/a.rs
+++ b/a.rs
@@ -1 +1,2 @@
 line1
+line2
diff --git a/b.rs b/b.rs
--- a/b.rs
+++ b/b.rs
@@ -1 +1,2 @@
 line1
+line2
";
        let files = parse_unified_diff(diff).unwrap();
        assert_eq!(files.len(), 2);
        let hunks = flatten_hunks(&files);
        assert_eq!(hunks.len(), 2);
        assert_eq!(hunks[0].file_path, PathBuf::from("a.rs"));
        assert_eq!(hunks[1].file_path, PathBuf::from("b.rs"));
    }

    #[test]
    fn new_file_is_add() {
        let diff = "\
diff --git a/new.rs b/new.rs
new file mode 100644
--- /dev/null
+++ b/new.rs
@@ -0,0 +1,3 @@
+fn hello() {
+    println!(\"new\");
+}
";
        let files = parse_unified_diff(diff).unwrap();
        assert!(files[0].is_new_file);
        assert_eq!(files[0].hunks[0].change_type, ChangeType::Add);
        assert_eq!(files[0].hunks[0].file_path, PathBuf::from("new.rs"));
    }

    #[test]
    fn deleted_file_keeps_old_path() {
        let diff = "\
diff --git a/old.rs b/old.rs
deleted file mode 100644
--- a/old.rs
+++ /dev/null
@@ -1,3 +0,0 @@
-fn goodbye() {
-    println!(\"old\");
-}
";
        let files = parse_unified_diff(diff).unwrap();
        assert!(files[0].is_deleted_file);
        assert_eq!(files[0].hunks[0].change_type, ChangeType::Delete);
        assert_eq!(files[0].hunks[0].file_path, PathBuf::from("old.rs"));
    }

    #[test]
    fn rename_without_hunks() {
        let diff = "\
diff --git a/old_name.rs b/new_name.rs
similarity index 100%
rename from old_name.rs
rename to new_name.rs
";
        let files = parse_unified_diff(diff).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].is_rename);
        assert!(files[0].hunks.is_empty());
    }

    #[test]
    fn binary_files_skipped() {
        let diff = "\
diff --git a/image.png b/image.png
Binary files a/image.png and b/image.png differ
diff --git a/code.rs b/code.rs
--- a/code.rs
+++ b/code.rs
@@ -1 +1,2 @@
 line1
+line2
";
        let files = parse_unified_diff(diff).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].new_path, PathBuf::from("code.rs"));
    }

    #[test]
    fn no_newline_marker_excluded_from_patch() {
        let diff = "\
diff --git a/f.rs b/f.rs
--- a/f.rs
+++ b/f.rs
@@ -1 +1 @@
-old
\\ No newline at end of file
+new
\\ No newline at end of file
";
        let files = parse_unified_diff(diff).unwrap();
        let patch = &files[0].hunks[0].patch;
        assert!(!patch.contains("No newline"));
        assert!(patch.contains("-old"));
        assert!(patch.contains("+new"));
    }

    #[test]
    fn quoted_paths_are_unwrapped() {
        let diff = r#"--- "a/src/my file.rs"
+++ "b/src/my file.rs"
@@ -1 +1,2 @@
 old
+new
"#;
        let files = parse_unified_diff(diff).unwrap();
        assert_eq!(files[0].old_path, PathBuf::from("src/my file.rs"));
        assert_eq!(files[0].hunks[0].file_path, PathBuf::from("src/my file.rs"));
    }

    #[test]
    fn short_range_defaults_to_one_line() {
        let diff = "\
--- a/f.rs
+++ b/f.rs
@@ -7 +7 @@
-x
+y
";
        let files = parse_unified_diff(diff).unwrap();
        let hunk = &files[0].hunks[0];
        assert_eq!((hunk.old_start, hunk.old_lines), (7, 1));
        assert_eq!((hunk.new_start, hunk.new_lines), (7, 1));
    }

    #[test]
    fn malformed_hunk_header_is_an_error() {
        let diff = "\
--- a/f.rs
+++ b/f.rs
@@ bogus @@
+x
";
        assert!(parse_unified_diff(diff).is_err());
    }
}
