//! Source enumeration for build and update.

use crate::error::{IndexError, Result};
use crate::hash::HashService;
use crate::project::ProjectRoot;
use crate::record::ScanOptions;
use glob::{MatchOptions, Pattern};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Directory names never descended into.
const ALWAYS_PRUNED: [&str; 3] = [".git", ".history", ".backups"];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    /// `/`-separated path relative to the scan root
    pub relative: String,
    pub absolute: PathBuf,
    /// 16 hex file-change digest
    pub digest: String,
}

#[derive(Debug)]
pub struct SourceScanner {
    root: PathBuf,
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
    pruned: Vec<PathBuf>,
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| IndexError::Validation(format!("Invalid glob pattern {p:?}: {e}")))
        })
        .collect()
}

impl SourceScanner {
    pub fn new(project_root: &ProjectRoot, options: &ScanOptions) -> Result<Self> {
        Ok(Self {
            root: project_root.join(&options.root),
            include: compile(&options.include)?,
            exclude: compile(&options.exclude)?,
            pruned: Vec::new(),
        })
    }

    /// Skip an extra absolute directory, typically the index directory.
    pub fn prune(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pruned.push(dir.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Include/exclude decision for a relative key.
    pub fn is_selected(&self, relative: &str) -> bool {
        let included = self.include.is_empty()
            || self
                .include
                .iter()
                .any(|p| p.matches_with(relative, MATCH_OPTIONS));
        included
            && !self
                .exclude
                .iter()
                .any(|p| p.matches_with(relative, MATCH_OPTIONS))
    }

    fn descend(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return true;
        }
        let name = entry.file_name().to_string_lossy();
        if ALWAYS_PRUNED.contains(&&*name) {
            return false;
        }
        !self.pruned.iter().any(|p| p == entry.path())
    }

    /// Every selected file with its digest, sorted by relative path.
    pub fn scan(&self) -> Result<Vec<ScannedFile>> {
        if !self.root.is_dir() {
            return Err(IndexError::not_found(format!(
                "Scan root not found: {}",
                self.root.display()
            )));
        }

        let mut candidates = Vec::new();
        for entry in WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| self.descend(e))
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("Skipping unreadable entry: {}", err);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(relative) = ProjectRoot::relative_key(&self.root, entry.path()) else {
                continue;
            };
            if self.is_selected(&relative) {
                candidates.push((relative, entry.into_path()));
            } else {
                debug!("Not selected: {}", relative);
            }
        }

        let mut files: Vec<ScannedFile> = candidates
            .into_par_iter()
            .filter_map(|(relative, absolute)| match std::fs::read(&absolute) {
                Ok(bytes) => Some(ScannedFile {
                    digest: HashService::file_change_digest(&bytes),
                    relative,
                    absolute,
                }),
                Err(err) => {
                    warn!("Skipping {}: {}", absolute.display(), err);
                    None
                }
            })
            .collect();
        files.sort_by(|a, b| a.relative.cmp(&b.relative));

        info!("Scanned {} source files under {}", files.len(), self.root.display());
        Ok(files)
    }
}
