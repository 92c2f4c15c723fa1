//! Full-text scan of the source tree for disallowed tokens.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::VerifyConfig;
use crate::error::{Error, Result};

const MAX_EXCERPT: usize = 160;

/// One line matching a disallowed token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenMatch {
    /// Path relative to the scanned root.
    pub path: PathBuf,
    /// 1-based line number.
    pub line: usize,
    /// The pattern that matched.
    pub token: String,
    pub excerpt: String,
    /// True if the path is a documentation or history file.
    pub allowed: bool,
}

/// Scans a tree for disallowed tokens.
pub struct TokenScanner {
    tokens: Vec<(Regex, String)>,
    allowed: Vec<glob::Pattern>,
    skip_dirs: Vec<String>,
}

impl TokenScanner {
    /// Compiles the patterns from the verification config.
    pub fn new(config: &VerifyConfig) -> Result<Self> {
        let tokens = config
            .tokens
            .iter()
            .map(|t| {
                Regex::new(&t.pattern)
                    .map(|re| (re, t.pattern.clone()))
                    .map_err(|e| Error::Config(format!("invalid token pattern '{}': {}", t.pattern, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let allowed = config
            .allowed_paths
            .iter()
            .map(|p| {
                glob::Pattern::new(p)
                    .map_err(|e| Error::Config(format!("invalid allowed path '{}': {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            tokens,
            allowed,
            skip_dirs: config.skip_dirs.clone(),
        })
    }

    /// Returns true if matches under `relative` are acceptable.
    pub fn is_allowed(&self, relative: &Path) -> bool {
        self.allowed.iter().any(|p| p.matches_path(relative))
    }

    /// Walks `root` and reports every matching line. Binary (non UTF-8) and
    /// unreadable files are skipped.
    pub fn scan(&self, root: &Path) -> Result<Vec<TokenMatch>> {
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                !(e.depth() > 0
                    && e.file_type().is_dir()
                    && self.skip_dirs.iter().any(|d| e.file_name() == d.as_str()))
            });

        let mut matches = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(path = ?e.path(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let bytes = match std::fs::read(entry.path()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(path = ?entry.path(), error = %e, "skipping unreadable file");
                    continue;
                }
            };
            let Ok(content) = String::from_utf8(bytes) else {
                continue;
            };

            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_path_buf();
            let allowed = self.is_allowed(&relative);

            for (index, line) in content.lines().enumerate() {
                for (re, pattern) in &self.tokens {
                    if re.is_match(line) {
                        matches.push(TokenMatch {
                            path: relative.clone(),
                            line: index + 1,
                            token: pattern.clone(),
                            excerpt: excerpt(line),
                            allowed,
                        });
                    }
                }
            }
        }

        tracing::debug!(root = ?root, matches = matches.len(), "token scan finished");
        Ok(matches)
    }
}

fn excerpt(line: &str) -> String {
    let trimmed = line.trim();
    match trimmed.char_indices().nth(MAX_EXCERPT) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
