//! Exclusion pattern matching
//!
//! Decides whether a file path is excluded from checkpointing. Patterns are
//! glob-style with a few conventions layered on top of [`globset`]:
//!
//! - `{a,b,c}` brace groups expand into one pattern per alternative
//! - a trailing `/` marks a directory pattern, matching the directory and
//!   everything beneath it by exact segment match against any ancestor
//! - patterns containing `**` match across directory boundaries and are
//!   tested against the full relative path
//! - plain patterns are tested against the full relative path, the bare
//!   filename, and every suffix obtained by dropping leading segments, so
//!   `build/*` matches `sub/build/file.txt`
//!
//! Independently of patterns, existing regular files larger than the
//! configured size limit are excluded. Matching is case-sensitive; `\` and
//! `/` are treated as equivalent separators.

use globset::{GlobBuilder, GlobMatcher};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Compiled exclusion rules plus the size limit
#[derive(Debug)]
pub struct ExclusionSet {
    rules: Vec<Rule>,
    max_file_size: u64,
    root: Option<PathBuf>,
}

#[derive(Debug)]
enum Rule {
    /// Trailing-`/` pattern; matches any ancestor directory segment
    Directory(GlobMatcher),
    /// Pattern containing `**`; matched against the full relative path
    Recursive(GlobMatcher),
    /// Plain pattern; matched against path, filename, and every suffix
    Plain(GlobMatcher),
}

impl ExclusionSet {
    /// Compile an exclusion set from raw patterns and a size limit in bytes
    ///
    /// Empty patterns are ignored; a pattern that fails to compile is
    /// skipped with a warning rather than failing the whole set.
    pub fn new<I, S>(patterns: I, max_file_size: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Vec::new();

        for pattern in patterns {
            let pattern = pattern.as_ref().replace('\\', "/");
            if pattern.is_empty() {
                continue;
            }
            for expanded in expand_braces(&pattern) {
                match compile_rule(&expanded) {
                    Some(rule) => rules.push(rule),
                    None => warn!("Skipping unparseable exclude pattern: {:?}", expanded),
                }
            }
        }

        Self {
            rules,
            max_file_size,
            root: None,
        }
    }

    /// Set the project root used to relativize absolute paths before matching
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Whether the given path is excluded from checkpointing
    ///
    /// A path is excluded when any pattern matches, or when it names an
    /// existing regular file larger than the configured size limit.
    pub fn excluded(&self, path: &Path) -> bool {
        let rel = self.relativize(path);
        if self.matches_patterns(&rel) {
            return true;
        }

        if self.max_file_size > 0 {
            if let Ok(metadata) = fs::metadata(path) {
                if metadata.is_file() && metadata.len() > self.max_file_size {
                    return true;
                }
            }
        }

        false
    }

    /// Pattern-only matching against a relative path string
    ///
    /// Exposed separately so the matching semantics are testable without
    /// touching the filesystem.
    pub fn matches_patterns(&self, rel_path: &str) -> bool {
        let rel = rel_path.replace('\\', "/");
        let rel = rel.trim_start_matches('/');
        if rel.is_empty() {
            return false;
        }

        let segments: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();
        let Some((filename, ancestors)) = segments.split_last() else {
            return false;
        };

        for rule in &self.rules {
            let hit = match rule {
                Rule::Directory(matcher) => ancestors.iter().any(|seg| matcher.is_match(seg)),
                Rule::Recursive(matcher) => matcher.is_match(rel),
                Rule::Plain(matcher) => {
                    matcher.is_match(rel)
                        || matcher.is_match(filename)
                        || (1..segments.len())
                            .any(|i| matcher.is_match(segments[i..].join("/")))
                }
            };
            if hit {
                return true;
            }
        }

        false
    }

    fn relativize(&self, path: &Path) -> String {
        let stripped = match &self.root {
            Some(root) => path.strip_prefix(root).unwrap_or(path),
            None => path,
        };
        stripped.to_string_lossy().replace('\\', "/")
    }
}

fn compile_rule(pattern: &str) -> Option<Rule> {
    if let Some(dir) = pattern.strip_suffix('/') {
        if dir.is_empty() {
            return None;
        }
        // Multi-segment directory patterns fall through to recursive matching
        if dir.contains('/') || dir.contains("**") {
            let glob = compile_glob(&format!("{}/**", dir.trim_start_matches('/')))?;
            return Some(Rule::Recursive(glob));
        }
        return Some(Rule::Directory(compile_glob(dir)?));
    }

    if pattern.contains("**") {
        return Some(Rule::Recursive(compile_glob(pattern)?));
    }

    Some(Rule::Plain(compile_glob(pattern)?))
}

fn compile_glob(pattern: &str) -> Option<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .ok()
        .map(|glob| glob.compile_matcher())
}

/// Expand `{a,b,c}` brace groups into one pattern per alternative
///
/// Nested groups are expanded recursively; a pattern without braces is
/// returned unchanged as a single alternative.
pub fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };

    let mut depth = 0usize;
    let mut close = None;
    for (idx, ch) in pattern[open..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(open + idx);
                    break;
                }
            }
            _ => {}
        }
    }
    // Unbalanced braces: treat literally
    let Some(close) = close else {
        return vec![pattern.to_string()];
    };

    let prefix = &pattern[..open];
    let body = &pattern[open + 1..close];
    let suffix = &pattern[close + 1..];

    let mut alternatives = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in body.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                alternatives.push(&body[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    alternatives.push(&body[start..]);

    let mut expanded = Vec::new();
    for alt in alternatives {
        let candidate = format!("{}{}{}", prefix, alt, suffix);
        expanded.extend(expand_braces(&candidate));
    }
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn set(patterns: &[&str]) -> ExclusionSet {
        ExclusionSet::new(patterns.iter().copied(), 0)
    }

    #[test]
    fn test_filename_glob() {
        let rules = set(&["*.log"]);
        assert!(rules.matches_patterns("debug.log"));
        assert!(rules.matches_patterns("a/b/server.log"));
        assert!(!rules.matches_patterns("main.py"));
        assert!(!rules.matches_patterns("log/readme.md"));
    }

    #[test]
    fn test_suffix_matching() {
        let rules = set(&["build/*"]);
        assert!(rules.matches_patterns("build/file.txt"));
        assert!(rules.matches_patterns("sub/build/file.txt"));
        assert!(!rules.matches_patterns("build/nested/file.txt"));
        assert!(!rules.matches_patterns("builds/file.txt"));
    }

    #[test]
    fn test_directory_pattern() {
        let rules = set(&["node_modules/"]);
        assert!(rules.matches_patterns("node_modules/pkg/index.js"));
        assert!(rules.matches_patterns("src/node_modules/left-pad/index.js"));
        assert!(!rules.matches_patterns("node_modules.txt"));
        assert!(!rules.matches_patterns("my_node_modules/file.js"));
    }

    #[test]
    fn test_recursive_patterns() {
        let rules = set(&["**/secrets.json"]);
        assert!(rules.matches_patterns("secrets.json"));
        assert!(rules.matches_patterns("deep/nested/secrets.json"));
        assert!(!rules.matches_patterns("secrets.json.bak"));

        let rules = set(&["target/**"]);
        assert!(rules.matches_patterns("target/debug/app"));
        assert!(!rules.matches_patterns("src/main.rs"));
    }

    #[test]
    fn test_brace_expansion() {
        assert_eq!(expand_braces("*.{log,tmp}"), vec!["*.log", "*.tmp"]);
        assert_eq!(expand_braces("plain.txt"), vec!["plain.txt"]);
        assert_eq!(
            expand_braces("{a,b}/{c,d}"),
            vec!["a/c", "a/d", "b/c", "b/d"]
        );

        let rules = set(&["*.{log,tmp}"]);
        assert!(rules.matches_patterns("x.log"));
        assert!(rules.matches_patterns("x.tmp"));
        assert!(!rules.matches_patterns("x.txt"));
    }

    #[test]
    fn test_case_sensitive_and_separators() {
        let rules = set(&["*.Log"]);
        assert!(rules.matches_patterns("x.Log"));
        assert!(!rules.matches_patterns("x.log"));

        let rules = set(&["build\\*"]);
        assert!(rules.matches_patterns("sub\\build\\file.txt"));
    }

    #[test]
    fn test_empty_patterns_ignored() {
        let rules = set(&["", "*.log"]);
        assert!(rules.matches_patterns("a.log"));
        assert!(!rules.matches_patterns("a.txt"));

        let rules = set(&[]);
        assert!(!rules.matches_patterns("anything.at.all"));
    }

    #[test]
    fn test_size_limit() {
        let dir = TempDir::new().unwrap();
        let small = dir.path().join("small.bin");
        let large = dir.path().join("large.bin");
        fs::write(&small, vec![0u8; 16]).unwrap();
        fs::write(&large, vec![0u8; 4096]).unwrap();

        let rules = ExclusionSet::new(Vec::<String>::new(), 1024).with_root(dir.path());
        assert!(!rules.excluded(&small));
        assert!(rules.excluded(&large));
        // Missing files are never size-excluded
        assert!(!rules.excluded(&dir.path().join("absent.bin")));
    }

    #[test]
    fn test_excluded_relativizes_against_root() {
        let dir = TempDir::new().unwrap();
        let rules = ExclusionSet::new(["build/**"], 0).with_root(dir.path());
        assert!(rules.excluded(&dir.path().join("build/out.o")));
        assert!(!rules.excluded(&dir.path().join("src/lib.rs")));
    }
}
