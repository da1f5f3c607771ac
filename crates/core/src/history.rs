//! Per-file version ledger.
//!
//! Snapshots of `dir/name` live in `dir/.history/versions/name/vN.snapshot`,
//! next to a `ledger.json` that records every retained version and the next
//! number to hand out. Numbers come from the ledger, never from the files on
//! disk, so a pruned number is never reused.

use crate::error::{IndexError, Result};
use crate::safe_writer::SafeFileWriter;
use crate::storage::Storage;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const VERSIONS_DIR: &str = "versions";
const LEDGER_FILE: &str = "ledger.json";
/// Above this many cells the LCS table is skipped and the changed block is
/// reported as a whole.
const MAX_DIFF_CELLS: usize = 4_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_versions: Option<usize>,
    pub retention_days: Option<u32>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_versions: Some(10),
            retention_days: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: u32,
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ledger {
    next_version: u32,
    versions: Vec<VersionInfo>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            next_version: 1,
            versions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryManager {
    writer: SafeFileWriter,
    config: HistoryConfig,
}

impl HistoryManager {
    pub fn new(writer: SafeFileWriter, config: HistoryConfig) -> Self {
        Self { writer, config }
    }

    fn storage(&self) -> &Arc<dyn Storage> {
        self.writer.storage()
    }

    fn versions_dir(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        SafeFileWriter::history_dir_for(path)
            .join(VERSIONS_DIR)
            .join(name)
    }

    fn load_ledger(&self, path: &Path) -> Result<Ledger> {
        let ledger_path = Self::versions_dir(path).join(LEDGER_FILE);
        if !self.storage().exists(&ledger_path) {
            return Ok(Ledger::default());
        }
        let raw = self.storage().read(&ledger_path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn store_ledger(&self, path: &Path, ledger: &Ledger) -> Result<()> {
        let ledger_path = Self::versions_dir(path).join(LEDGER_FILE);
        let raw = serde_json::to_vec_pretty(ledger)?;
        self.storage().write_atomic(&ledger_path, &raw)
    }

    /// Snapshot the current content of `path` under the next version number.
    pub fn save_version(&self, path: &Path) -> Result<u32> {
        if !self.storage().exists(path) || self.storage().is_dir(path) {
            return Err(IndexError::not_found(format!(
                "File not found: {}",
                path.display()
            )));
        }

        let dir = Self::versions_dir(path);
        self.storage().create_dir_all(&dir)?;
        let mut ledger = self.load_ledger(path)?;

        let version = ledger.next_version.max(1);
        let snapshot = dir.join(format!("v{version}.snapshot"));
        self.storage().copy(path, &snapshot)?;

        ledger.versions.push(VersionInfo {
            version,
            path: snapshot.clone(),
            timestamp: Utc::now(),
        });
        ledger.next_version = version + 1;
        let pruned = self.apply_retention(&mut ledger, Utc::now());

        if let Err(e) = self.store_ledger(path, &ledger) {
            let _ = self.storage().remove_file(&snapshot);
            return Err(e);
        }
        self.remove_snapshots(&pruned);

        info!("Saved version {} of {}", version, path.display());
        Ok(version)
    }

    /// Retained versions, most recent first.
    pub fn get_versions(&self, path: &Path) -> Result<Vec<VersionInfo>> {
        let mut versions = self.load_ledger(path)?.versions;
        versions.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.version.cmp(&a.version))
        });
        Ok(versions)
    }

    pub fn get_latest_version(&self, path: &Path) -> Result<Option<PathBuf>> {
        Ok(self
            .load_ledger(path)?
            .versions
            .into_iter()
            .max_by_key(|v| v.version)
            .map(|v| v.path))
    }

    /// Overwrite `path` with a stored version. The live file is backed up first.
    pub fn restore_version(&self, path: &Path, version: u32) -> Result<()> {
        let info = self.find_version(path, version)?;
        let content = self.storage().read(&info.path)?;
        self.writer.write_atomic(path, &content)?;
        info!("Restored {} to version {}", path.display(), version);
        Ok(())
    }

    /// Line diff from `v1` to `v2`: `- ` for removed lines, `+ ` for added ones.
    pub fn compare_versions(&self, path: &Path, v1: u32, v2: u32) -> Result<Vec<String>> {
        let old = self.find_version(path, v1)?;
        let new = self.find_version(path, v2)?;
        let old = self.storage().read_to_string(&old.path)?;
        let new = self.storage().read_to_string(&new.path)?;
        Ok(diff_lines(&old, &new))
    }

    /// Run the retention pass on its own. Returns the number of versions removed.
    pub fn cleanup(&self, path: &Path) -> Result<usize> {
        let mut ledger = self.load_ledger(path)?;
        let pruned = self.apply_retention(&mut ledger, Utc::now());
        if pruned.is_empty() {
            return Ok(0);
        }
        self.store_ledger(path, &ledger)?;
        self.remove_snapshots(&pruned);
        Ok(pruned.len())
    }

    fn find_version(&self, path: &Path, version: u32) -> Result<VersionInfo> {
        self.load_ledger(path)?
            .versions
            .into_iter()
            .find(|v| v.version == version)
            .ok_or_else(|| IndexError::not_found(format!("Version {version} not found")))
    }

    /// Drop versions over the count or age limit; the newest always survives.
    fn apply_retention(&self, ledger: &mut Ledger, now: DateTime<Utc>) -> Vec<VersionInfo> {
        let Some(latest) = ledger.versions.iter().map(|v| v.version).max() else {
            return Vec::new();
        };
        let cutoff = self
            .config
            .retention_days
            .map(|days| now - Duration::days(i64::from(days)));

        ledger.versions.sort_by(|a, b| b.version.cmp(&a.version));
        let (kept, pruned): (Vec<_>, Vec<_>) = ledger
            .versions
            .drain(..)
            .enumerate()
            .partition(|(rank, v)| {
                if v.version == latest {
                    return true;
                }
                let within_count = self.config.max_versions.map_or(true, |max| *rank < max);
                let within_age = cutoff.map_or(true, |cutoff| v.timestamp >= cutoff);
                within_count && within_age
            });

        ledger.versions = kept.into_iter().map(|(_, v)| v).collect();
        ledger.versions.sort_by_key(|v| v.version);
        pruned.into_iter().map(|(_, v)| v).collect()
    }

    fn remove_snapshots(&self, pruned: &[VersionInfo]) {
        for stale in pruned {
            debug!("Pruning version {} ({})", stale.version, stale.path.display());
            if let Err(e) = self.storage().remove_file(&stale.path) {
                warn!("Failed to remove {}: {}", stale.path.display(), e);
            }
        }
    }
}

/// LCS based line diff. Only changed lines are reported.
fn diff_lines(old: &str, new: &str) -> Vec<String> {
    let old: Vec<&str> = old.lines().collect();
    let new: Vec<&str> = new.lines().collect();

    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];

    let mut out = Vec::new();
    if old_mid.len().saturating_mul(new_mid.len()) > MAX_DIFF_CELLS {
        out.extend(old_mid.iter().map(|l| format!("- {l}")));
        out.extend(new_mid.iter().map(|l| format!("+ {l}")));
        return out;
    }

    // lcs[i][j] = LCS length of old_mid[i..] and new_mid[j..]
    let (n, m) = (old_mid.len(), new_mid.len());
    let mut lcs = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old_mid[i] == new_mid[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old_mid[i] == new_mid[j] {
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            out.push(format!("- {}", old_mid[i]));
            i += 1;
        } else {
            out.push(format!("+ {}", new_mid[j]));
            j += 1;
        }
    }
    out.extend(old_mid[i..].iter().map(|l| format!("- {l}")));
    out.extend(new_mid[j..].iter().map(|l| format!("+ {l}")));
    out
}
