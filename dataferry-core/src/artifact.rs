//! Artifact location and the readability check.
//!
//! The locator looks for an already-downloaded dataset file in the staging
//! directory. Matching is by pattern priority: the first pattern with any match
//! wins, and ties within one pattern resolve to the lexicographically smallest
//! file name so repeated runs pick the same file regardless of directory order.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};

use crate::error::{ArtifactError, ConfigError};

/// Finds the first existing file matching an ordered list of filename patterns.
#[derive(Debug, Clone)]
pub struct ArtifactLocator {
    patterns: Vec<String>,
    matchers: Vec<GlobMatcher>,
}

impl ArtifactLocator {
    /// Compile the patterns. Order is priority order.
    pub fn new(patterns: &[String]) -> Result<Self, ConfigError> {
        if patterns.is_empty() {
            return Err(ConfigError::MissingField {
                field: "fetch.patterns".into(),
            });
        }
        let matchers = patterns
            .iter()
            .map(|p| {
                Glob::new(p)
                    .map(|g| g.compile_matcher())
                    .map_err(|e| ConfigError::Invalid {
                        field: "fetch.patterns".into(),
                        message: format!("'{}': {}", p, e),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns: patterns.to_vec(),
            matchers,
        })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Return the best matching file directly inside `dir`, or `None`.
    ///
    /// A missing directory counts as "not found".
    pub fn locate(&self, dir: &Path) -> std::io::Result<Option<PathBuf>> {
        let mut names = match std::fs::read_dir(dir) {
            Ok(entries) => {
                let mut names = Vec::new();
                for entry in entries {
                    let entry = entry?;
                    if entry.file_type()?.is_file() {
                        if let Some(name) = entry.file_name().to_str() {
                            names.push(name.to_string());
                        }
                    }
                }
                names
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        names.sort();

        for matcher in &self.matchers {
            if let Some(name) = names.iter().find(|n| matcher.is_match(n.as_str())) {
                return Ok(Some(dir.join(name)));
            }
        }
        Ok(None)
    }

    /// All files in `dir` matching any pattern.
    pub fn matching_files(&self, dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if entry.file_type()?.is_file() && self.matchers.iter().any(|m| m.is_match(name)) {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }
}

/// A locally staged copy of the source dataset that passed the readability check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalArtifact {
    pub path: PathBuf,
    /// Data rows, excluding the header.
    pub row_count: u64,
    pub column_count: usize,
    pub columns: Vec<String>,
    pub size_bytes: u64,
}

impl LocalArtifact {
    /// Read the file as CSV and collect its shape.
    ///
    /// Requires a header row, at least one data row, and every record to have
    /// the header's width.
    pub fn inspect(path: &Path) -> Result<Self, ArtifactError> {
        let size_bytes = std::fs::metadata(path)
            .map_err(|e| ArtifactError::Unreadable {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
            .len();

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|e| ArtifactError::Unreadable {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        let columns: Vec<String> = reader
            .headers()
            .map_err(|e| csv_error(path, e))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        if columns.is_empty() || columns.iter().all(|c| c.is_empty()) {
            return Err(ArtifactError::Empty {
                path: path.to_path_buf(),
            });
        }

        let mut row_count = 0u64;
        let mut record = csv::StringRecord::new();
        loop {
            match reader.read_record(&mut record) {
                Ok(true) => row_count += 1,
                Ok(false) => break,
                Err(e) => return Err(csv_error(path, e)),
            }
        }
        if row_count == 0 {
            return Err(ArtifactError::Empty {
                path: path.to_path_buf(),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            row_count,
            column_count: columns.len(),
            columns,
            size_bytes,
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn csv_error(path: &Path, e: csv::Error) -> ArtifactError {
    let line = e.position().map(|p| p.line()).unwrap_or(0);
    match e.kind() {
        csv::ErrorKind::Io(io) => ArtifactError::Unreadable {
            path: path.to_path_buf(),
            message: io.to_string(),
        },
        _ => ArtifactError::Malformed {
            path: path.to_path_buf(),
            line,
            message: e.to_string(),
        },
    }
}
