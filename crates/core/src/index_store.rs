//! Index persistence: records, metadata sidecars, validation, repair,
//! exports and multi-index backups.
//!
//! Layout inside the index directory:
//!
//! ```text
//! functions.jsonl            one FunctionRecord per line
//! functions.meta.json        IndexMetadata
//! functions.jsonl.repaired   output of repair_index
//! exports/functions.csv      output of export_to_file
//! .history/                  SafeFileWriter backups and version ledgers
//! .backups/<id>/             copies + manifest.json
//! ```

use crate::error::{IndexError, Result};
use crate::record::{FunctionRecord, IndexMetadata};
use crate::safe_writer::SafeFileWriter;
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const INDEX_EXTENSION: &str = ".jsonl";
pub const METADATA_SUFFIX: &str = ".meta.json";
pub const REPAIRED_SUFFIX: &str = ".repaired";
pub const BACKUPS_DIR: &str = ".backups";
pub const EXPORTS_DIR: &str = "exports";
const MANIFEST_FILE: &str = "manifest.json";

const CSV_HEADER: [&str; 11] = [
    "file",
    "identifier",
    "signature",
    "start_line",
    "end_line",
    "hash_function",
    "hash_file",
    "exported",
    "async",
    "metrics",
    "domain",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// One record per line
    Jsonl,
    /// `{ "records": [...], "metadata": {...} }`
    Json,
    /// Header row plus one escaped row per record
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Jsonl => "jsonl",
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "jsonl" | "ndjson" => Ok(Self::Jsonl),
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            _ => Err(IndexError::Validation(format!(
                "Unknown export format: {s}. Valid formats: jsonl, json, csv"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recoverable: Option<bool>,
    pub total_lines: usize,
    /// 1-based numbers of the lines that failed to parse
    pub invalid_lines: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    pub recovered: usize,
    pub lost: usize,
    pub repaired_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Index files captured
    pub indexes: Vec<String>,
    /// Every file copied, indexes and metadata sidecars
    pub files: Vec<String>,
    pub total_size: u64,
}

/// One non-blank line of an index file.
struct ParsedLine<'a> {
    number: usize,
    raw: &'a [u8],
    parsed: std::result::Result<FunctionRecord, String>,
}

fn parse_lines(content: &[u8]) -> Vec<ParsedLine<'_>> {
    content
        .split(|b| *b == b'\n')
        .enumerate()
        .filter_map(|(i, raw)| {
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.iter().all(u8::is_ascii_whitespace) {
                return None;
            }
            let parsed = std::str::from_utf8(raw)
                .map_err(|e| e.to_string())
                .and_then(|line| serde_json::from_str(line).map_err(|e| e.to_string()));
            Some(ParsedLine {
                number: i + 1,
                raw,
                parsed,
            })
        })
        .collect()
}

fn encode_records(records: &[FunctionRecord]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(records.len() * 256);
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.push(b'\n');
    }
    Ok(out)
}

fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        return Err(IndexError::Validation(format!("Invalid {kind} name: {name:?}")));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct IndexStore {
    writer: SafeFileWriter,
    index_dir: PathBuf,
}

impl IndexStore {
    pub fn new(storage: Arc<dyn Storage>, index_dir: impl Into<PathBuf>, max_backups: usize) -> Self {
        Self::with_writer(SafeFileWriter::new(storage, max_backups), index_dir)
    }

    pub fn with_writer(writer: SafeFileWriter, index_dir: impl Into<PathBuf>) -> Self {
        Self {
            writer,
            index_dir: index_dir.into(),
        }
    }

    pub fn writer(&self) -> &SafeFileWriter {
        &self.writer
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        self.writer.storage()
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    /// `functions` and `functions.jsonl` name the same index.
    pub fn index_file_name(id: &str) -> String {
        if id.ends_with(INDEX_EXTENSION) {
            id.to_string()
        } else {
            format!("{id}{INDEX_EXTENSION}")
        }
    }

    fn base_name(id: &str) -> &str {
        id.strip_suffix(INDEX_EXTENSION).unwrap_or(id)
    }

    pub fn index_path(&self, id: &str) -> PathBuf {
        self.index_dir.join(Self::index_file_name(id))
    }

    pub fn metadata_path(&self, id: &str) -> PathBuf {
        self.index_dir
            .join(format!("{}{METADATA_SUFFIX}", Self::base_name(id)))
    }

    pub fn repaired_path(&self, id: &str) -> PathBuf {
        self.index_dir
            .join(format!("{}{REPAIRED_SUFFIX}", Self::index_file_name(id)))
    }

    fn backups_dir(&self) -> PathBuf {
        self.index_dir.join(BACKUPS_DIR)
    }

    fn ensure_index_dir(&self) -> Result<()> {
        self.storage().create_dir_all(&self.index_dir)
    }

    fn index_not_found(&self, id: &str) -> IndexError {
        IndexError::not_found(format!(
            "Index file not found: {}",
            self.index_path(id).display()
        ))
    }

    pub fn save_index(&self, id: &str, records: &[FunctionRecord]) -> Result<()> {
        check_name("index", id)?;
        self.ensure_index_dir()?;
        let bytes = encode_records(records)?;
        self.writer.write_atomic(&self.index_path(id), &bytes)?;
        info!("Saved {} records to {}", records.len(), Self::index_file_name(id));
        Ok(())
    }

    /// Strict load: any unparseable line fails the whole call.
    pub fn load_index(&self, id: &str) -> Result<Vec<FunctionRecord>> {
        let path = self.index_path(id);
        if !self.storage().exists(&path) {
            return Err(self.index_not_found(id));
        }
        let content = self.storage().read(&path)?;

        let mut records = Vec::new();
        for line in parse_lines(&content) {
            match line.parsed {
                Ok(record) => records.push(record),
                Err(message) => {
                    return Err(IndexError::Corruption {
                        file: Self::index_file_name(id),
                        line: line.number,
                        message,
                    })
                }
            }
        }
        debug!("Loaded {} records from {}", records.len(), path.display());
        Ok(records)
    }

    pub fn save_metadata(&self, id: &str, metadata: &IndexMetadata) -> Result<()> {
        check_name("index", id)?;
        self.ensure_index_dir()?;
        let bytes = serde_json::to_vec_pretty(metadata)?;
        self.writer.write_atomic(&self.metadata_path(id), &bytes)?;
        Ok(())
    }

    /// Missing metadata is `Ok(None)`; callers decide whether they need it.
    pub fn load_metadata(&self, id: &str) -> Result<Option<IndexMetadata>> {
        let path = self.metadata_path(id);
        if !self.storage().exists(&path) {
            return Ok(None);
        }
        let bytes = self.storage().read(&path)?;
        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            IndexError::Validation(format!("Malformed metadata {}: {e}", path.display()))
        })
    }

    pub fn index_exists(&self, id: &str) -> bool {
        let path = self.index_path(id);
        self.storage().exists(&path) && !self.storage().is_dir(&path)
    }

    /// Managed index files, sorted by name.
    pub fn get_index_list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .storage()
            .list_dir(&self.index_dir)?
            .into_iter()
            .filter(|e| !e.is_dir && !e.name.starts_with('.') && e.name.ends_with(INDEX_EXTENSION))
            .map(|e| e.name)
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn validate_index(&self, id: &str) -> Result<ValidationReport> {
        let path = self.index_path(id);
        if !self.index_exists(id) {
            return Ok(ValidationReport {
                valid: false,
                error: Some(self.index_not_found(id).to_string()),
                recoverable: Some(false),
                total_lines: 0,
                invalid_lines: Vec::new(),
            });
        }

        let content = self.storage().read(&path)?;
        let lines = parse_lines(&content);
        let total_lines = lines.len();
        let failures: Vec<(usize, String)> = lines
            .into_iter()
            .filter_map(|l| l.parsed.err().map(|message| (l.number, message)))
            .collect();

        if failures.is_empty() {
            return Ok(ValidationReport {
                valid: true,
                error: None,
                recoverable: None,
                total_lines,
                invalid_lines: Vec::new(),
            });
        }

        let (first_line, first_message) = &failures[0];
        warn!(
            "{} has {} invalid line(s)",
            Self::index_file_name(id),
            failures.len()
        );
        Ok(ValidationReport {
            valid: false,
            error: Some(format!(
                "{} of {} lines failed to parse (first at line {}: {})",
                failures.len(),
                total_lines,
                first_line,
                first_message
            )),
            recoverable: Some(true),
            total_lines,
            invalid_lines: failures.into_iter().map(|(n, _)| n).collect(),
        })
    }

    /// Copy every parseable line into `<index>.repaired`. The original is never touched.
    pub fn repair_index(&self, id: &str) -> Result<RepairReport> {
        let path = self.index_path(id);
        if !self.index_exists(id) {
            return Err(self.index_not_found(id));
        }
        let content = self.storage().read(&path)?;

        let mut survivors = Vec::with_capacity(content.len());
        let mut recovered = 0;
        let mut lost = 0;
        for line in parse_lines(&content) {
            if line.parsed.is_ok() {
                survivors.extend_from_slice(line.raw);
                survivors.push(b'\n');
                recovered += 1;
            } else {
                lost += 1;
            }
        }

        let repaired_file = self.repaired_path(id);
        self.storage().write_atomic(&repaired_file, &survivors)?;
        info!(
            "Repaired {}: {} recovered, {} lost -> {}",
            Self::index_file_name(id),
            recovered,
            lost,
            repaired_file.display()
        );
        Ok(RepairReport {
            recovered,
            lost,
            repaired_file,
        })
    }

    /// Write a derived copy of the index. Returns the path written.
    pub fn export_to_file(
        &self,
        id: &str,
        format: ExportFormat,
        output: Option<&Path>,
    ) -> Result<PathBuf> {
        let records = self.load_index(id)?;
        let output = match output {
            Some(path) => path.to_path_buf(),
            None => self.index_dir.join(EXPORTS_DIR).join(format!(
                "{}.{}",
                Self::base_name(id),
                format.extension()
            )),
        };
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                self.storage().create_dir_all(parent)?;
            }
        }

        let bytes = match format {
            ExportFormat::Jsonl => encode_records(&records)?,
            ExportFormat::Json => {
                let metadata = self.load_metadata(id)?;
                serde_json::to_vec_pretty(&serde_json::json!({
                    "records": records,
                    "metadata": metadata,
                }))?
            }
            ExportFormat::Csv => Self::encode_csv(&records)?.into_bytes(),
        };

        self.storage().write_atomic(&output, &bytes)?;
        info!(
            "Exported {} records from {} to {}",
            records.len(),
            Self::index_file_name(id),
            output.display()
        );
        Ok(output)
    }

    fn encode_csv(records: &[FunctionRecord]) -> Result<String> {
        let mut out = CSV_HEADER.join(",");
        out.push('\n');
        for r in records {
            let metrics = serde_json::to_string(&r.metrics)?;
            let row = [
                csv_field(&r.file),
                csv_field(&r.identifier),
                csv_field(&r.signature),
                Cow::Owned(r.start_line.to_string()),
                Cow::Owned(r.end_line.to_string()),
                csv_field(&r.hash_function),
                csv_field(&r.hash_file),
                Cow::Borrowed(if r.exported { "true" } else { "false" }),
                Cow::Borrowed(if r.is_async { "true" } else { "false" }),
                csv_field(&metrics),
                csv_field(&r.domain),
            ];
            out.push_str(&row.join(","));
            out.push('\n');
        }
        Ok(out)
    }

    /// Write records and metadata as one unit.
    ///
    /// If the metadata write fails the index is put back the way it was, so
    /// callers never observe a new index next to stale metadata.
    pub fn commit(&self, id: &str, records: &[FunctionRecord], metadata: &IndexMetadata) -> Result<()> {
        check_name("index", id)?;
        self.ensure_index_dir()?;
        let index_path = self.index_path(id);
        let previous = if self.index_exists(id) {
            Some(self.storage().read(&index_path)?)
        } else {
            None
        };

        let bytes = encode_records(records)?;
        self.writer.write_atomic(&index_path, &bytes)?;

        if let Err(e) = self.save_metadata(id, metadata) {
            error!(
                "Metadata write for {} failed, rolling back index: {}",
                Self::index_file_name(id),
                e
            );
            let rollback = match &previous {
                Some(bytes) => self.storage().write_atomic(&index_path, bytes),
                None => self.storage().remove_file(&index_path),
            };
            if let Err(rollback_err) = rollback {
                error!("Index rollback failed: {}", rollback_err);
            }
            return Err(e);
        }

        info!(
            "Committed {} records and metadata for {}",
            records.len(),
            Self::index_file_name(id)
        );
        Ok(())
    }

    /// Snapshot one index (or all of them) plus metadata into `.backups/<id>/`.
    pub fn create_backup(&self, id: Option<&str>) -> Result<BackupManifest> {
        let indexes = match id {
            Some(id) => {
                if !self.index_exists(id) {
                    return Err(self.index_not_found(id));
                }
                vec![Self::index_file_name(id)]
            }
            None => self.get_index_list()?,
        };
        if indexes.is_empty() {
            return Err(IndexError::not_found(format!(
                "No indexes to back up in {}",
                self.index_dir.display()
            )));
        }

        let now = Utc::now();
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        let backup_id = format!("backup-{}-{}", now.format("%Y%m%dT%H%M%S"), &uuid[..8]);
        let backup_dir = self.backups_dir().join(&backup_id);
        self.storage().create_dir_all(&backup_dir)?;

        match self.copy_into_backup(&backup_dir, &backup_id, now, indexes) {
            Ok(manifest) => {
                info!(
                    "Created backup {} ({} files, {} bytes)",
                    manifest.id,
                    manifest.files.len(),
                    manifest.total_size
                );
                Ok(manifest)
            }
            Err(e) => {
                if let Err(cleanup_err) = self.storage().remove_dir_all(&backup_dir) {
                    warn!("Failed to clean up partial backup {}: {}", backup_id, cleanup_err);
                }
                Err(e)
            }
        }
    }

    fn copy_into_backup(
        &self,
        backup_dir: &Path,
        backup_id: &str,
        timestamp: DateTime<Utc>,
        indexes: Vec<String>,
    ) -> Result<BackupManifest> {
        let mut files = Vec::new();
        let mut total_size = 0;
        for index in &indexes {
            total_size += self
                .storage()
                .copy(&self.index_path(index), &backup_dir.join(index))?;
            files.push(index.clone());

            let meta_path = self.metadata_path(index);
            if self.storage().exists(&meta_path) {
                let meta_name = format!("{}{METADATA_SUFFIX}", Self::base_name(index));
                total_size += self.storage().copy(&meta_path, &backup_dir.join(&meta_name))?;
                files.push(meta_name);
            }
        }

        let manifest = BackupManifest {
            id: backup_id.to_string(),
            timestamp,
            indexes,
            files,
            total_size,
        };
        // the manifest goes last: a folder without one is an incomplete backup
        let bytes = serde_json::to_vec_pretty(&manifest)?;
        self.storage()
            .write_atomic(&backup_dir.join(MANIFEST_FILE), &bytes)?;
        Ok(manifest)
    }

    /// All complete backups, most recent first.
    pub fn list_backups(&self) -> Result<Vec<BackupManifest>> {
        let mut manifests = Vec::new();
        for entry in self.storage().list_dir(&self.backups_dir())? {
            if !entry.is_dir {
                continue;
            }
            let manifest_path = self.backups_dir().join(&entry.name).join(MANIFEST_FILE);
            if !self.storage().exists(&manifest_path) {
                debug!("Skipping incomplete backup {}", entry.name);
                continue;
            }
            let parsed = self
                .storage()
                .read(&manifest_path)
                .and_then(|bytes| Ok(serde_json::from_slice::<BackupManifest>(&bytes)?));
            match parsed {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => warn!("Skipping unreadable backup {}: {}", entry.name, e),
            }
        }

        manifests.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        Ok(manifests)
    }

    fn load_manifest(&self, backup_id: &str) -> Result<BackupManifest> {
        check_name("backup", backup_id)?;
        let manifest_path = self.backups_dir().join(backup_id).join(MANIFEST_FILE);
        if !self.storage().exists(&manifest_path) {
            return Err(IndexError::not_found(format!("Backup not found: {backup_id}")));
        }
        let bytes = self.storage().read(&manifest_path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Copy every file of a backup over the live files, all or nothing.
    pub fn restore_from_backup(&self, backup_id: &str) -> Result<BackupManifest> {
        let manifest = self.load_manifest(backup_id)?;
        let backup_dir = self.backups_dir().join(backup_id);

        // stage everything before touching live state
        let mut staged = Vec::with_capacity(manifest.files.len());
        for file in &manifest.files {
            check_name("backup file", file)?;
            let source = backup_dir.join(file);
            if !self.storage().exists(&source) {
                return Err(IndexError::not_found(format!(
                    "Backup {backup_id} is missing {file}"
                )));
            }
            let live = self.index_dir.join(file);
            let previous = if self.storage().exists(&live) {
                Some(self.storage().read(&live)?)
            } else {
                None
            };
            staged.push((live, self.storage().read(&source)?, previous));
        }

        self.ensure_index_dir()?;
        for (done, (live, content, _)) in staged.iter().enumerate() {
            if let Err(e) = self.writer.write_atomic(live, content) {
                error!(
                    "Restore of {} failed at {}, rolling back: {}",
                    backup_id,
                    live.display(),
                    e
                );
                for (live, _, previous) in &staged[..done] {
                    let rollback = match previous {
                        Some(bytes) => self.storage().write_atomic(live, bytes),
                        None => self.storage().remove_file(live),
                    };
                    if let Err(rollback_err) = rollback {
                        error!("Rollback of {} failed: {}", live.display(), rollback_err);
                    }
                }
                return Err(e);
            }
        }

        info!("Restored {} files from backup {}", staged.len(), backup_id);
        Ok(manifest)
    }

    pub fn delete_backup(&self, backup_id: &str) -> Result<()> {
        self.load_manifest(backup_id)?;
        self.storage()
            .remove_dir_all(&self.backups_dir().join(backup_id))
    }

    /// Keep the `keep` most recent backups. Returns how many were deleted.
    pub fn prune_backups(&self, keep: usize) -> Result<usize> {
        let stale: Vec<BackupManifest> = self.list_backups()?.into_iter().skip(keep).collect();
        for manifest in &stale {
            self.delete_backup(&manifest.id)?;
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::record::test_support::record;
    use crate::record::ScanOptions;
    use crate::storage::{FsStorage, MemoryStorage};
    use tempfile::TempDir;

    fn memory_store() -> (Arc<MemoryStorage>, IndexStore) {
        let storage = Arc::new(MemoryStorage::new());
        let store = IndexStore::new(storage.clone(), ".fnindex", 5);
        (storage, store)
    }

    fn sample_records() -> Vec<FunctionRecord> {
        vec![
            record("src/a.rs", "alpha", "{ 1 }", 1),
            record("src/a.rs", "beta", "{ 2 }", 10),
            record("src/b.rs", "gamma", "{ 3 }", 4),
        ]
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let (_, store) = memory_store();
        let records = sample_records();
        store.save_index("functions", &records).unwrap();
        assert_eq!(store.load_index("functions").unwrap(), records);
        assert_eq!(store.load_index("functions.jsonl").unwrap(), records);
    }

    #[test]
    fn test_load_missing_index() {
        let (_, store) = memory_store();
        let err = store.load_index("functions").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().starts_with("Index file not found"));
    }

    #[test]
    fn test_load_is_strict() {
        let (storage, store) = memory_store();
        store.save_index("functions", &sample_records()).unwrap();
        let mut content = storage.read(&store.index_path("functions")).unwrap();
        content.extend_from_slice(b"{not json\n");
        storage
            .write_atomic(&store.index_path("functions"), &content)
            .unwrap();

        match store.load_index("functions").unwrap_err() {
            IndexError::Corruption { line, .. } => assert_eq!(line, 4),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_metadata_absent_is_none() {
        let (_, store) = memory_store();
        assert!(store.load_metadata("functions").unwrap().is_none());

        let meta = IndexMetadata::new("functions.jsonl", ScanOptions::default());
        store.save_metadata("functions", &meta).unwrap();
        assert_eq!(store.load_metadata("functions").unwrap(), Some(meta));
        assert!(store.storage().exists(Path::new(".fnindex/functions.meta.json")));
    }

    #[test]
    fn test_index_list_ignores_unrelated_files() {
        let (storage, store) = memory_store();
        store.save_index("functions", &sample_records()).unwrap();
        store.save_index("tests", &[]).unwrap();
        store
            .save_metadata(
                "functions",
                &IndexMetadata::new("functions.jsonl", ScanOptions::default()),
            )
            .unwrap();
        storage
            .write_atomic(Path::new(".fnindex/notes.txt"), b"x")
            .unwrap();
        store.save_index("functions", &sample_records()).unwrap();
        store.repair_index("functions").unwrap();

        assert_eq!(
            store.get_index_list().unwrap(),
            vec!["functions.jsonl", "tests.jsonl"]
        );
        assert!(store.index_exists("tests"));
        assert!(!store.index_exists("missing"));
    }

    #[test]
    fn test_validate_missing_is_unrecoverable() {
        let (_, store) = memory_store();
        let report = store.validate_index("functions").unwrap();
        assert!(!report.valid);
        assert_eq!(report.recoverable, Some(false));
    }

    #[test]
    fn test_validate_and_repair_mixed_file() {
        let (storage, store) = memory_store();
        storage.create_dir_all(Path::new(".fnindex")).unwrap();
        let good = serde_json::to_string(&record("a.rs", "a", "{}", 1)).unwrap();
        let other = serde_json::to_string(&record("b.rs", "b", "{}", 1)).unwrap();
        let content = format!("{good}\n{{\"file\": broken\n{other}\n");
        storage
            .write_atomic(&store.index_path("functions"), content.as_bytes())
            .unwrap();

        let report = store.validate_index("functions").unwrap();
        assert!(!report.valid);
        assert_eq!(report.recoverable, Some(true));
        assert_eq!(report.invalid_lines, vec![2]);

        let repair = store.repair_index("functions").unwrap();
        assert_eq!(repair.recovered, 2);
        assert_eq!(repair.lost, 1);

        // original untouched, repaired artifact holds the survivors
        assert_eq!(
            storage.read(&store.index_path("functions")).unwrap(),
            content.as_bytes()
        );
        let repaired = storage.read_to_string(&repair.repaired_file).unwrap();
        assert_eq!(repaired, format!("{good}\n{other}\n"));
    }

    #[test]
    fn test_validate_valid_index() {
        let (_, store) = memory_store();
        store.save_index("functions", &sample_records()).unwrap();
        let report = store.validate_index("functions").unwrap();
        assert!(report.valid);
        assert_eq!(report.total_lines, 3);
        assert!(report.error.is_none());
    }

    #[test]
    fn test_repair_missing_index() {
        let (_, store) = memory_store();
        assert_eq!(
            store.repair_index("functions").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_export_formats() {
        let (storage, store) = memory_store();
        let mut records = sample_records();
        records[0].signature = "fn alpha(a: i32, b: \"x\")".to_string();
        store.save_index("functions", &records).unwrap();
        store
            .save_metadata(
                "functions",
                &IndexMetadata::new("functions.jsonl", ScanOptions::default()),
            )
            .unwrap();
        let live_before = storage.read(&store.index_path("functions")).unwrap();

        let jsonl = store
            .export_to_file("functions", ExportFormat::Jsonl, None)
            .unwrap();
        assert_eq!(jsonl, Path::new(".fnindex/exports/functions.jsonl"));
        assert_eq!(storage.read(&jsonl).unwrap(), live_before);

        let json = store
            .export_to_file("functions", ExportFormat::Json, None)
            .unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(&storage.read(&json).unwrap()).unwrap();
        assert_eq!(value["records"].as_array().unwrap().len(), 3);
        assert_eq!(value["metadata"]["indexFile"], "functions.jsonl");

        let csv = store
            .export_to_file("functions", ExportFormat::Csv, Some(Path::new("out/f.csv")))
            .unwrap();
        let text = storage.read_to_string(&csv).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], CSV_HEADER.join(","));
        assert!(lines[1].contains("\"fn alpha(a: i32, b: \"\"x\"\")\""));
        assert!(lines[1].contains("\"{\"\"lines\"\":3}\""));

        assert_eq!(storage.read(&store.index_path("functions")).unwrap(), live_before);
    }

    #[test]
    fn test_export_format_from_str() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("ndjson".parse::<ExportFormat>().unwrap(), ExportFormat::Jsonl);
        assert!("xml".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn test_commit_rolls_back_index_when_metadata_fails() {
        let (storage, store) = memory_store();
        let before = sample_records();
        store.save_index("functions", &before).unwrap();

        storage.fail_writes_to("functions.meta.json");
        let after = vec![record("src/c.rs", "delta", "{ 4 }", 1)];
        let meta = IndexMetadata::new("functions.jsonl", ScanOptions::default());
        assert!(store.commit("functions", &after, &meta).is_err());

        storage.clear_faults();
        assert_eq!(store.load_index("functions").unwrap(), before);
        assert!(store.load_metadata("functions").unwrap().is_none());
    }

    #[test]
    fn test_commit_without_previous_index_removes_new_file() {
        let (storage, store) = memory_store();
        storage.fail_writes_to("functions.meta.json");
        let meta = IndexMetadata::new("functions.jsonl", ScanOptions::default());
        assert!(store.commit("functions", &sample_records(), &meta).is_err());
        assert!(!store.index_exists("functions"));
    }

    #[test]
    fn test_backup_and_restore_round_trip() {
        let (storage, store) = memory_store();
        store.save_index("functions", &sample_records()).unwrap();
        store
            .save_metadata(
                "functions",
                &IndexMetadata::new("functions.jsonl", ScanOptions::default()),
            )
            .unwrap();
        store.save_index("tests", &sample_records()[..1]).unwrap();
        let original = storage.read(&store.index_path("functions")).unwrap();

        let manifest = store.create_backup(None).unwrap();
        assert_eq!(manifest.indexes, vec!["functions.jsonl", "tests.jsonl"]);
        assert_eq!(
            manifest.files,
            vec!["functions.jsonl", "functions.meta.json", "tests.jsonl"]
        );
        assert!(manifest.total_size > 0);

        store.save_index("functions", &[]).unwrap();
        store.restore_from_backup(&manifest.id).unwrap();
        assert_eq!(storage.read(&store.index_path("functions")).unwrap(), original);
    }

    #[test]
    fn test_single_index_backup() {
        let (_, store) = memory_store();
        store.save_index("functions", &sample_records()).unwrap();
        store.save_index("tests", &[]).unwrap();
        let manifest = store.create_backup(Some("tests")).unwrap();
        assert_eq!(manifest.indexes, vec!["tests.jsonl"]);
        assert_eq!(
            store.create_backup(Some("missing")).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_backup_with_nothing_to_capture() {
        let (_, store) = memory_store();
        assert_eq!(store.create_backup(None).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_list_backups_most_recent_first() {
        let (_, store) = memory_store();
        store.save_index("functions", &sample_records()).unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(store.create_backup(None).unwrap().id);
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        let listed: Vec<String> = store.list_backups().unwrap().into_iter().map(|m| m.id).collect();
        ids.reverse();
        assert_eq!(listed, ids);
    }

    #[test]
    fn test_incomplete_backup_is_ignored() {
        let (storage, store) = memory_store();
        store.save_index("functions", &sample_records()).unwrap();
        store.create_backup(None).unwrap();
        storage
            .create_dir_all(Path::new(".fnindex/.backups/backup-partial"))
            .unwrap();
        assert_eq!(store.list_backups().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_backup_leaves_no_folder() {
        let (storage, store) = memory_store();
        store.save_index("functions", &sample_records()).unwrap();
        storage.fail_writes_to("manifest.json");
        assert!(store.create_backup(None).is_err());
        storage.clear_faults();
        assert!(store
            .storage()
            .list_dir(Path::new(".fnindex/.backups"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_restore_is_all_or_nothing() {
        let (storage, store) = memory_store();
        store.save_index("functions", &sample_records()).unwrap();
        store.save_index("tests", &sample_records()).unwrap();
        let manifest = store.create_backup(None).unwrap();

        store.save_index("functions", &[]).unwrap();
        store.save_index("tests", &[]).unwrap();
        let functions_now = storage.read(&store.index_path("functions")).unwrap();

        // functions.jsonl restores first, then tests.jsonl fails
        storage.fail_writes_to(".fnindex/tests.jsonl");
        assert!(store.restore_from_backup(&manifest.id).is_err());
        storage.clear_faults();

        assert_eq!(storage.read(&store.index_path("functions")).unwrap(), functions_now);
        assert!(store.load_index("tests").unwrap().is_empty());
    }

    #[test]
    fn test_restore_unknown_backup() {
        let (_, store) = memory_store();
        assert_eq!(
            store.restore_from_backup("backup-nope").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            store.restore_from_backup("../escape").unwrap_err().kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_prune_backups() {
        let (_, store) = memory_store();
        store.save_index("functions", &sample_records()).unwrap();
        for _ in 0..4 {
            store.create_backup(None).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let newest = store.list_backups().unwrap()[0].id.clone();
        assert_eq!(store.prune_backups(1).unwrap(), 3);
        let remaining = store.list_backups().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, newest);
    }

    #[test]
    fn test_store_on_filesystem() {
        let temp_dir = TempDir::new().unwrap();
        let store = IndexStore::new(Arc::new(FsStorage::new(temp_dir.path())), ".fnindex", 5);
        store.save_index("functions", &sample_records()).unwrap();
        store.save_index("functions", &sample_records()[..2]).unwrap();

        assert!(temp_dir.path().join(".fnindex/functions.jsonl").exists());
        assert_eq!(
            store
                .writer()
                .list_backups(&store.index_path("functions"))
                .unwrap()
                .len(),
            1
        );
        let manifest = store.create_backup(Some("functions")).unwrap();
        assert!(temp_dir
            .path()
            .join(".fnindex/.backups")
            .join(&manifest.id)
            .join("manifest.json")
            .exists());
    }
}
