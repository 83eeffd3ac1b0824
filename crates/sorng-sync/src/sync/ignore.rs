//! Gitignore-style exclusion per local root.
//!
//! Without an override file the built-in baseline applies. With one, the
//! file's rules replace the baseline entirely. Profile exclude patterns are
//! appended in both cases, and the override file itself is never synced.
//! The compiled set is cached and rebuilt when the override file's
//! modification time changes.

use globset::{GlobBuilder, GlobMatcher};
use sorng_core::error::SyncError;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Applied when a root has no override file.
pub const BASELINE_PATTERNS: &[&str] = &[
    ".git/",
    ".svn/",
    ".hg/",
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    "node_modules/",
    "bower_components/",
    "vendor/bundle/",
    "__pycache__/",
    ".cache/",
    ".parcel-cache/",
    ".next/",
    ".sass-cache/",
    ".idea/",
    ".vscode/",
    "*.swp",
    "*~",
    "*.log",
];

#[derive(Debug, thiserror::Error)]
pub enum IgnoreError {
    #[error("failed to compile ignore pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<IgnoreError> for SyncError {
    fn from(e: IgnoreError) -> Self {
        match e {
            IgnoreError::Pattern { .. } => SyncError::invalid_config(e.to_string()),
            IgnoreError::Read { .. } => SyncError::io_error(e.to_string()),
        }
    }
}

// ─── Rules ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct Rule {
    negated: bool,
    directory_only: bool,
    direct: Vec<GlobMatcher>,
    descendant: Vec<GlobMatcher>,
}

impl Rule {
    fn parse(line: &str) -> Result<Option<Self>, IgnoreError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let (negated, pattern) = match line.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let (anchored, directory_only, core) = normalise_pattern(pattern);
        if core.is_empty() {
            return Ok(None);
        }

        let mut direct = BTreeSet::new();
        let mut descendant = BTreeSet::new();
        direct.insert(core.clone());
        descendant.insert(format!("{}/**", core));
        if !anchored {
            direct.insert(format!("**/{}", core));
            descendant.insert(format!("**/{}/**", core));
        }

        Ok(Some(Self {
            negated,
            directory_only,
            direct: compile_patterns(direct, line)?,
            descendant: compile_patterns(descendant, line)?,
        }))
    }

    fn matches(&self, rel: &str, is_dir: bool) -> bool {
        if (!self.directory_only || is_dir) && self.direct.iter().any(|m| m.is_match(rel)) {
            return true;
        }
        self.descendant.iter().any(|m| m.is_match(rel))
    }
}

/// A leading `/` or an inner `/` anchors the pattern to the root; a trailing
/// `/` restricts it to directories.
fn normalise_pattern(pattern: &str) -> (bool, bool, String) {
    let directory_only = pattern.ends_with('/');
    let core = pattern.trim_end_matches('/');
    let anchored = core.starts_with('/') || core.contains('/');
    (anchored, directory_only, core.trim_start_matches('/').to_string())
}

fn compile_patterns(patterns: BTreeSet<String>, original: &str) -> Result<Vec<GlobMatcher>, IgnoreError> {
    patterns
        .into_iter()
        .map(|p| {
            GlobBuilder::new(&p)
                .literal_separator(true)
                .backslash_escape(true)
                .build()
                .map(|g| g.compile_matcher())
                .map_err(|source| IgnoreError::Pattern {
                    pattern: original.to_string(),
                    source,
                })
        })
        .collect()
}

// ─── IgnoreSet ──────────────────────────────────────────────────────

/// Compiled rules; the last matching rule wins.
#[derive(Debug, Default)]
pub struct IgnoreSet {
    rules: Vec<Rule>,
}

impl IgnoreSet {
    pub fn compile<I, S>(patterns: I) -> Result<Self, IgnoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Vec::new();
        for p in patterns {
            if let Some(rule) = Rule::parse(p.as_ref())? {
                rules.push(rule);
            }
        }
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// `rel` is `/`-separated and relative to the root.
    pub fn is_ignored(&self, rel: &str, is_dir: bool) -> bool {
        let rel = rel.trim_matches('/');
        if rel.is_empty() {
            return false;
        }
        let mut ignored = false;
        for rule in &self.rules {
            if rule.matches(rel, is_dir) {
                ignored = !rule.negated;
            }
        }
        ignored
    }
}

// ─── IgnoreMatcher ──────────────────────────────────────────────────

struct Cached {
    /// Modification time of the override file; `None` when absent.
    stamp: Option<SystemTime>,
    set: Arc<IgnoreSet>,
}

pub struct IgnoreMatcher {
    root: PathBuf,
    file_name: String,
    extra: Vec<String>,
    cache: Mutex<Option<Cached>>,
}

impl IgnoreMatcher {
    pub fn new(root: impl Into<PathBuf>, file_name: impl Into<String>, extra: Vec<String>) -> Self {
        Self {
            root: root.into(),
            file_name: file_name.into(),
            extra,
            cache: Mutex::new(None),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn override_path(&self) -> PathBuf {
        self.root.join(&self.file_name)
    }

    /// The compiled set for the override file as it is now.
    pub fn current(&self) -> Arc<IgnoreSet> {
        let path = self.override_path();
        let stamp = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(c) = cache.as_ref() {
            if c.stamp == stamp {
                return c.set.clone();
            }
        }

        let set = Arc::new(match self.build(&path, stamp.is_some()) {
            Ok(set) => set,
            Err(e) => {
                log::warn!("ignore: {}; falling back to the built-in patterns", e);
                self.fallback()
            }
        });
        log::debug!("ignore: compiled {} rule(s) for {}", set.len(), self.root.display());
        *cache = Some(Cached {
            stamp,
            set: set.clone(),
        });
        set
    }

    fn build(&self, path: &Path, has_override: bool) -> Result<IgnoreSet, IgnoreError> {
        let mut lines: Vec<String> = if has_override {
            std::fs::read_to_string(path)
                .map_err(|source| IgnoreError::Read {
                    path: path.to_path_buf(),
                    source,
                })?
                .lines()
                .map(String::from)
                .collect()
        } else {
            BASELINE_PATTERNS.iter().map(|p| p.to_string()).collect()
        };
        lines.extend(self.extra.iter().cloned());
        lines.push(format!("/{}", self.file_name));
        IgnoreSet::compile(lines)
    }

    /// Baseline plus whatever profile patterns still compile.
    fn fallback(&self) -> IgnoreSet {
        let mut set = IgnoreSet::compile(BASELINE_PATTERNS).unwrap_or_default();
        let own = format!("/{}", self.file_name);
        for p in self.extra.iter().chain(std::iter::once(&own)) {
            if let Ok(Some(rule)) = Rule::parse(p) {
                set.rules.push(rule);
            }
        }
        set
    }

    pub fn is_ignored(&self, rel: &str, is_dir: bool) -> bool {
        self.current().is_ignored(rel, is_dir)
    }

    /// Like [`is_ignored`](Self::is_ignored) for an absolute local path.
    /// Paths outside the root are ignored.
    pub fn is_ignored_path(&self, path: &Path, is_dir: bool) -> bool {
        match sorng_core::paths::local_relative(&self.root, path) {
            Some(rel) => self.is_ignored(&rel, is_dir),
            None => true,
        }
    }

    /// Forget the compiled set so the next lookup reads the override file
    /// again, even when its mtime did not move.
    pub fn invalidate(&self) {
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
