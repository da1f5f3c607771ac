use crate::error::Result;
use crate::storage::Storage;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_MAX_BACKUPS: usize = 5;
pub const HISTORY_DIR: &str = ".history";

const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%9f";
const BACKUP_SUFFIX: &str = ".bak";

/// Atomic writes that keep a copy of whatever they overwrite.
#[derive(Debug, Clone)]
pub struct SafeFileWriter {
    storage: Arc<dyn Storage>,
    max_backups: usize,
}

impl SafeFileWriter {
    pub fn new(storage: Arc<dyn Storage>, max_backups: usize) -> Self {
        Self {
            storage,
            max_backups,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// `.history` directory next to `path`.
    pub fn history_dir_for(path: &Path) -> PathBuf {
        path.parent()
            .unwrap_or_else(|| Path::new(""))
            .join(HISTORY_DIR)
    }

    /// Write `content` to `path`, backing up the existing file first.
    ///
    /// Returns the backup that was taken, if the file existed. When the write
    /// itself fails the original file is untouched and the fresh backup is
    /// discarded.
    pub fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<Option<PathBuf>> {
        let backup = if self.storage.exists(path) && !self.storage.is_dir(path) {
            Some(self.take_backup(path)?)
        } else {
            None
        };

        if let Err(e) = self.storage.write_atomic(path, content) {
            if let Some(backup) = &backup {
                let _ = self.storage.remove_file(backup);
            }
            return Err(e);
        }

        if backup.is_some() {
            if let Err(e) = self.enforce_retention(path) {
                warn!("Backup retention failed for {}: {}", path.display(), e);
            }
        }
        Ok(backup)
    }

    /// Backups of `path`, newest first.
    pub fn list_backups(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let dir = Self::history_dir_for(path);
        let file_name = file_name_of(path);
        let prefix = format!("{file_name}.");

        let mut backups: Vec<((String, u32), String)> = self
            .storage
            .list_dir(&dir)?
            .into_iter()
            .filter(|entry| !entry.is_dir)
            .filter_map(|entry| {
                let middle = entry
                    .name
                    .strip_prefix(&prefix)?
                    .strip_suffix(BACKUP_SUFFIX)?;
                let key = parse_stamp(middle)?;
                Some((key, entry.name))
            })
            .collect();

        backups.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(backups.into_iter().map(|(_, name)| dir.join(name)).collect())
    }

    fn take_backup(&self, path: &Path) -> Result<PathBuf> {
        let dir = Self::history_dir_for(path);
        self.storage.create_dir_all(&dir)?;

        let file_name = file_name_of(path);
        let stamp = format!("{}Z", Utc::now().format(STAMP_FORMAT));
        let mut target = dir.join(format!("{file_name}.{stamp}{BACKUP_SUFFIX}"));
        let mut seq = 1;
        while self.storage.exists(&target) {
            target = dir.join(format!("{file_name}.{stamp}-{seq}{BACKUP_SUFFIX}"));
            seq += 1;
        }

        self.storage.copy(path, &target)?;
        debug!("Backed up {} to {}", path.display(), target.display());
        Ok(target)
    }

    fn enforce_retention(&self, path: &Path) -> Result<()> {
        let backups = self.list_backups(path)?;
        for stale in backups.iter().skip(self.max_backups) {
            debug!("Removing old backup {}", stale.display());
            self.storage.remove_file(stale)?;
        }
        Ok(())
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `20261016T120000123456789Z` or `...Z-3` -> sortable key.
fn parse_stamp(middle: &str) -> Option<(String, u32)> {
    let (stamp, seq) = match middle.split_once('-') {
        Some((stamp, seq)) => (stamp, seq.parse().ok()?),
        None => (middle, 0),
    };
    let digits = stamp.strip_suffix('Z')?;
    let well_formed = digits.len() == 24
        && digits.char_indices().all(|(i, c)| {
            if i == 8 {
                c == 'T'
            } else {
                c.is_ascii_digit()
            }
        });
    well_formed.then(|| (stamp.to_string(), seq))
}
