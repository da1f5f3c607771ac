use crate::history::HistoryConfig;
use crate::safe_writer::DEFAULT_MAX_BACKUPS;
use serde::{Deserialize, Serialize};

pub const DEFAULT_INDEX_DIR: &str = ".fnindex";

/// Project-level settings, usually read from `fnindex.toml`.
///
/// Every section is optional in the file; missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Index directory, relative to the project root
    pub index_dir: String,
    pub writer: WriterConfig,
    pub history: HistoryConfig,
    pub update: UpdateConfig,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            index_dir: DEFAULT_INDEX_DIR.to_string(),
            writer: WriterConfig::default(),
            history: HistoryConfig::default(),
            update: UpdateConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Backups kept per file by SafeFileWriter
    pub max_backups: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_backups: DEFAULT_MAX_BACKUPS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Extraction threads (0 = one per CPU)
    pub workers: usize,
    /// Below this many files extraction runs sequentially
    pub parallel_threshold: usize,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            parallel_threshold: 8,
        }
    }
}

impl UpdateConfig {
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }
}
