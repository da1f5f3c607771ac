use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Metadata format version written by this crate.
pub const METADATA_VERSION: u32 = 1;

/// One extracted function or method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionRecord {
    /// Path relative to the scan root, `/`-separated
    pub file: String,
    pub identifier: String,
    pub signature: String,
    pub start_line: u32,
    pub end_line: u32,
    /// 8 hex chars of the normalized body
    pub hash_function: String,
    /// 8 hex chars of the whole file, same on every record of the file
    pub hash_file: String,
    pub exported: bool,
    #[serde(rename = "async")]
    pub is_async: bool,
    /// Complexity metrics bundle; opaque to the index store
    #[serde(default)]
    pub metrics: serde_json::Value,
    pub domain: String,
}

/// How an index was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Scan root, relative to the project root
    pub root: String,
    pub domain: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            root: ".".to_string(),
            domain: "default".to_string(),
            include: ["rs", "ts", "tsx", "js", "jsx", "py", "go"]
                .iter()
                .map(|ext| format!("**/*.{ext}"))
                .collect(),
            exclude: vec![
                "**/target/**".to_string(),
                "**/node_modules/**".to_string(),
                "**/dist/**".to_string(),
                "**/.git/**".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub total_files: usize,
    pub total_functions: usize,
}

/// Envelope describing one managed index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMetadata {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub index_file: String,
    pub scan: ScanOptions,
    pub stats: IndexStats,
    /// Relative path -> 16 hex file-change digest
    pub file_hashes: BTreeMap<String, String>,
}

impl IndexMetadata {
    pub fn new(index_file: impl Into<String>, scan: ScanOptions) -> Self {
        let now = Utc::now();
        Self {
            version: METADATA_VERSION,
            created_at: now,
            last_updated: now,
            index_file: index_file.into(),
            scan,
            stats: IndexStats::default(),
            file_hashes: BTreeMap::new(),
        }
    }

    /// Replace file hashes and recompute statistics from the record set.
    pub fn refresh(&mut self, records: &[FunctionRecord], file_hashes: BTreeMap<String, String>) {
        self.file_hashes = file_hashes;
        self.stats = IndexStats {
            total_files: self.file_hashes.len(),
            total_functions: records.len(),
        };
        self.last_updated = Utc::now();
    }

    /// Statistics and file hashes agree with `records`.
    pub fn is_consistent_with(&self, records: &[FunctionRecord]) -> bool {
        if self.stats.total_functions != records.len()
            || self.stats.total_files != self.file_hashes.len()
        {
            return false;
        }
        records
            .iter()
            .all(|record| self.file_hashes.contains_key(&record.file))
    }
}

/// Distinct files referenced by a record set.
pub fn covered_files(records: &[FunctionRecord]) -> BTreeSet<String> {
    records.iter().map(|r| r.file.clone()).collect()
}

/// Stable order used for every persisted record set.
pub fn sort_records(records: &mut [FunctionRecord]) {
    records.sort_by(|a, b| {
        a.file
            .cmp(&b.file)
            .then_with(|| a.start_line.cmp(&b.start_line))
    });
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::hash::{CommentStyle, HashService};

    pub fn record(file: &str, identifier: &str, body: &str, start_line: u32) -> FunctionRecord {
        FunctionRecord {
            file: file.to_string(),
            identifier: identifier.to_string(),
            signature: format!("fn {identifier}()"),
            start_line,
            end_line: start_line + 2,
            hash_function: HashService::function_hash(body, CommentStyle::CFamily),
            hash_file: HashService::file_hash(file.as_bytes()),
            exported: false,
            is_async: false,
            metrics: serde_json::json!({ "lines": 3 }),
            domain: "default".to_string(),
        }
    }
}
