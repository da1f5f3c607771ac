//! Incremental index maintenance.
//!
//! A cycle classifies every source file against the stored `fileHashes`,
//! re-extracts only added and modified files, carries the records of
//! unchanged files forward untouched and commits records plus metadata in a
//! single [`IndexStore::commit`] call.
//!
//! Records are diffed per file by identifier. Identifiers that repeat within
//! one file (overloads, same-named methods on different types) are compared
//! as ordered groups: the k-th old record with that name against the k-th new
//! one, in source order. Surplus entries count as added or deleted. This key
//! cannot tell a reordering of same-named functions from an edit.

use crate::config::UpdateConfig;
use crate::error::{IndexError, Result, UpdateFailure};
use crate::extractor::Extractor;
use crate::index_store::IndexStore;
use crate::project::ProjectRoot;
use crate::record::{covered_files, sort_records, FunctionRecord, IndexMetadata, ScanOptions};
use crate::scan::{ScannedFile, SourceScanner};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateOptions {
    /// Snapshot the index before mutating it
    pub auto_backup: bool,
    /// Restore the most recent backup of the index if the cycle aborts
    pub auto_restore: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub success: bool,
    /// Function-level counts
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Per-file extraction failures; the affected files kept their old records
    pub errors: Vec<String>,
    pub files_added: usize,
    pub files_modified: usize,
    pub files_deleted: usize,
    pub files_unchanged: usize,
    pub backup_id: Option<String>,
    pub execution_time: Duration,
}

impl UpdateReport {
    pub fn has_changes(&self) -> bool {
        self.files_added + self.files_modified + self.files_deleted > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub files: usize,
    pub functions: usize,
    pub errors: Vec<String>,
    pub execution_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileChange {
    Added,
    Modified,
    Deleted,
    Unchanged,
}

/// Function-level change counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RecordDiff {
    added: usize,
    updated: usize,
    deleted: usize,
}

impl RecordDiff {
    fn absorb(&mut self, other: RecordDiff) {
        self.added += other.added;
        self.updated += other.updated;
        self.deleted += other.deleted;
    }
}

fn group_by_identifier(records: &[FunctionRecord]) -> BTreeMap<&str, Vec<&FunctionRecord>> {
    let mut ordered: Vec<&FunctionRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.start_line);
    let mut groups: BTreeMap<&str, Vec<&FunctionRecord>> = BTreeMap::new();
    for record in ordered {
        groups.entry(record.identifier.as_str()).or_default().push(record);
    }
    groups
}

/// Identifier-keyed diff of one file's old and new records.
fn diff_records(old: &[FunctionRecord], new: &[FunctionRecord]) -> RecordDiff {
    let old_groups = group_by_identifier(old);
    let new_groups = group_by_identifier(new);
    let mut diff = RecordDiff::default();

    for (identifier, new_group) in &new_groups {
        let old_group = old_groups.get(identifier).map(Vec::as_slice).unwrap_or(&[]);
        for (k, record) in new_group.iter().enumerate() {
            match old_group.get(k) {
                Some(previous) if previous.hash_function != record.hash_function => {
                    diff.updated += 1
                }
                Some(_) => {}
                None => diff.added += 1,
            }
        }
    }
    for (identifier, old_group) in &old_groups {
        let matched = new_groups.get(identifier).map_or(0, Vec::len);
        diff.deleted += old_group.len().saturating_sub(matched);
    }
    diff
}

/// Runs extraction for a batch of files, in parallel above a size threshold.
struct ExtractionPool {
    pool: Option<rayon::ThreadPool>,
    parallel_threshold: usize,
}

impl ExtractionPool {
    fn new(config: &UpdateConfig) -> Self {
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(config.effective_workers())
            .build()
        {
            Ok(pool) => Some(pool),
            Err(e) => {
                warn!("Falling back to sequential extraction: {}", e);
                None
            }
        };
        Self {
            pool,
            parallel_threshold: config.parallel_threshold,
        }
    }

    fn run<F, R>(&self, files: &[&ScannedFile], extract: F) -> Vec<R>
    where
        F: Fn(&ScannedFile) -> R + Sync + Send,
        R: Send,
    {
        match &self.pool {
            Some(pool) if files.len() >= self.parallel_threshold => {
                pool.install(|| files.par_iter().map(|f| extract(*f)).collect())
            }
            _ => files.iter().map(|f| extract(*f)).collect(),
        }
    }
}

pub struct UpdateService {
    store: IndexStore,
    extractor: Arc<dyn Extractor>,
    project_root: ProjectRoot,
    pool: ExtractionPool,
}

impl UpdateService {
    pub fn new(
        store: IndexStore,
        extractor: Arc<dyn Extractor>,
        project_root: ProjectRoot,
        config: UpdateConfig,
    ) -> Self {
        Self {
            pool: ExtractionPool::new(&config),
            store,
            extractor,
            project_root,
        }
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    pub fn project_root(&self) -> &ProjectRoot {
        &self.project_root
    }

    fn scanner(&self, scan: &ScanOptions) -> Result<SourceScanner> {
        Ok(SourceScanner::new(&self.project_root, scan)?
            .prune(self.project_root.join(self.store.index_dir())))
    }

    /// Extract one file, rewriting every record's `file` to the scan-relative key.
    fn extract_file(&self, file: &ScannedFile) -> Result<Vec<FunctionRecord>> {
        let mut records = self
            .extractor
            .extract(&file.absolute)
            .map_err(|e| IndexError::Extraction {
                file: file.relative.clone(),
                message: format!("{e:#}"),
            })?;
        for record in &mut records {
            record.file = file.relative.clone();
        }
        Ok(records)
    }

    fn extract_batch(&self, files: &[&ScannedFile]) -> Vec<Result<Vec<FunctionRecord>>> {
        self.pool.run(files, |file| self.extract_file(file))
    }

    /// Full build: scan, extract everything, commit index and fresh metadata.
    pub fn build_index(&self, id: &str, scan: ScanOptions) -> Result<BuildReport> {
        let started = Instant::now();
        let files = self.scanner(&scan)?.scan()?;
        let refs: Vec<&ScannedFile> = files.iter().collect();

        let mut records = Vec::new();
        let mut file_hashes = BTreeMap::new();
        let mut errors = Vec::new();
        for (file, outcome) in files.iter().zip(self.extract_batch(&refs)) {
            match outcome {
                Ok(extracted) => {
                    records.extend(extracted);
                    file_hashes.insert(file.relative.clone(), file.digest.clone());
                }
                Err(e) => {
                    warn!("{}", e);
                    errors.push(e.to_string());
                }
            }
        }
        sort_records(&mut records);

        let mut metadata = IndexMetadata::new(IndexStore::index_file_name(id), scan);
        metadata.refresh(&records, file_hashes);
        self.store.commit(id, &records, &metadata)?;

        info!(
            "Built {} with {} functions from {} files ({} errors)",
            IndexStore::index_file_name(id),
            records.len(),
            metadata.stats.total_files,
            errors.len()
        );
        Ok(BuildReport {
            files: metadata.stats.total_files,
            functions: records.len(),
            errors,
            execution_time: started.elapsed(),
        })
    }

    /// One incremental cycle against a previously built index.
    pub fn update_index(
        &self,
        id: &str,
        options: UpdateOptions,
    ) -> std::result::Result<UpdateReport, UpdateFailure> {
        let started = Instant::now();
        let mut errors = Vec::new();
        let mut backup_id = None;

        match self.run_cycle(id, options, &mut errors, &mut backup_id) {
            Ok(mut report) => {
                report.errors = errors;
                report.backup_id = backup_id;
                report.execution_time = started.elapsed();
                Ok(report)
            }
            Err(source) => {
                error!("Update of {} aborted: {}", IndexStore::index_file_name(id), source);
                let restored_backup = if options.auto_restore {
                    self.restore_latest(id, &mut errors)
                } else {
                    None
                };
                Err(UpdateFailure {
                    source,
                    errors,
                    restored_backup,
                })
            }
        }
    }

    /// Restore the newest backup that captured `id`. Failures only land in `errors`.
    fn restore_latest(&self, id: &str, errors: &mut Vec<String>) -> Option<String> {
        let index_file = IndexStore::index_file_name(id);
        let latest = match self.store.list_backups() {
            Ok(backups) => backups
                .into_iter()
                .find(|b| b.indexes.iter().any(|i| *i == index_file)),
            Err(e) => {
                errors.push(format!("Restore failed: {e}"));
                return None;
            }
        };
        let latest = latest?;

        match self.store.restore_from_backup(&latest.id) {
            Ok(_) => {
                info!("Restored {} from backup {}", index_file, latest.id);
                Some(latest.id)
            }
            Err(e) => {
                error!("Restore from {} failed: {}", latest.id, e);
                errors.push(format!("Restore failed: {e}"));
                None
            }
        }
    }

    fn run_cycle(
        &self,
        id: &str,
        options: UpdateOptions,
        errors: &mut Vec<String>,
        backup_id: &mut Option<String>,
    ) -> Result<UpdateReport> {
        // metadata is required
        let mut metadata = self.store.load_metadata(id)?.ok_or_else(|| {
            IndexError::not_found("No metadata found — recreate the index")
        })?;

        // refuse to patch a broken file
        let validation = self.store.validate_index(id)?;
        if !validation.valid {
            return Err(IndexError::Validation(format!(
                "Index validation failed: {}",
                validation.error.unwrap_or_default()
            )));
        }

        // snapshot before any mutation
        if options.auto_backup {
            *backup_id = Some(self.store.create_backup(Some(id))?.id);
        }

        // existing records grouped by file
        let old_records = self.store.load_index(id)?;
        let mut by_file: BTreeMap<String, Vec<FunctionRecord>> = BTreeMap::new();
        for record in old_records {
            by_file.entry(record.file.clone()).or_default().push(record);
        }
        let mut covered: BTreeSet<String> = by_file.keys().cloned().collect();
        covered.extend(metadata.file_hashes.keys().cloned());

        // rescan with the options the index was built with
        let scanned = self.scanner(&metadata.scan)?.scan()?;

        // classify against the stored digests
        let mut to_extract: Vec<(&ScannedFile, FileChange)> = Vec::new();
        let mut unchanged = 0;
        let present: BTreeSet<&str> = scanned.iter().map(|f| f.relative.as_str()).collect();
        for file in &scanned {
            let change = if !covered.contains(&file.relative) {
                FileChange::Added
            } else if metadata.file_hashes.get(&file.relative) != Some(&file.digest) {
                FileChange::Modified
            } else {
                FileChange::Unchanged
            };
            debug!("{:?}: {}", change, file.relative);
            match change {
                FileChange::Unchanged => unchanged += 1,
                _ => to_extract.push((file, change)),
            }
        }
        let deleted: Vec<String> = covered
            .iter()
            .filter(|f| !present.contains(f.as_str()))
            .cloned()
            .collect();
        for file in &deleted {
            debug!("{:?}: {}", FileChange::Deleted, file);
        }

        let files_added = to_extract
            .iter()
            .filter(|(_, c)| *c == FileChange::Added)
            .count();
        let files_modified = to_extract.len() - files_added;

        let mut report = UpdateReport {
            success: true,
            added: 0,
            updated: 0,
            deleted: 0,
            errors: Vec::new(),
            files_added,
            files_modified,
            files_deleted: deleted.len(),
            files_unchanged: unchanged,
            backup_id: None,
            execution_time: Duration::ZERO,
        };
        if !report.has_changes() {
            info!("{} is up to date", IndexStore::index_file_name(id));
            return Ok(report);
        }

        // drop deleted files, re-extract added and modified ones
        let mut file_hashes = std::mem::take(&mut metadata.file_hashes);
        let mut diff = RecordDiff::default();
        for file in &deleted {
            let removed = by_file.remove(file).unwrap_or_default();
            diff.deleted += removed.len();
            file_hashes.remove(file);
        }

        let batch: Vec<&ScannedFile> = to_extract.iter().map(|(f, _)| *f).collect();
        let outcomes = self.extract_batch(&batch);
        for ((file, change), outcome) in to_extract.iter().zip(outcomes) {
            match outcome {
                Ok(fresh) => {
                    let previous = by_file.remove(&file.relative).unwrap_or_default();
                    diff.absorb(diff_records(&previous, &fresh));
                    by_file.insert(file.relative.clone(), fresh);
                    file_hashes.insert(file.relative.clone(), file.digest.clone());
                }
                Err(e) => {
                    // keep the old records and the old digest so the file is retried next time
                    warn!("{}", e);
                    errors.push(e.to_string());
                    if *change == FileChange::Modified && by_file.contains_key(&file.relative) {
                        // an empty digest never matches a real one
                        file_hashes.entry(file.relative.clone()).or_default();
                    }
                }
            }
        }

        // merge and commit index plus metadata together
        let mut records: Vec<FunctionRecord> = by_file.into_values().flatten().collect();
        sort_records(&mut records);
        metadata.refresh(&records, file_hashes);
        if !metadata.is_consistent_with(&records) {
            return Err(IndexError::Validation(format!(
                "Refusing to commit {}: metadata does not cover {} records",
                IndexStore::index_file_name(id),
                covered_files(&records)
                    .iter()
                    .filter(|f| !metadata.file_hashes.contains_key(*f))
                    .count()
            )));
        }
        self.store.commit(id, &records, &metadata)?;

        report.added = diff.added;
        report.updated = diff.updated;
        report.deleted = diff.deleted;
        info!(
            "Updated {}: +{} ~{} -{} functions across {} changed files",
            IndexStore::index_file_name(id),
            report.added,
            report.updated,
            report.deleted,
            files_added + files_modified + report.files_deleted
        );
        Ok(report)
    }

    /// Root the scanner walks for `id`, for display.
    pub fn scan_root(&self, id: &str) -> Result<Option<std::path::PathBuf>> {
        Ok(self
            .store
            .load_metadata(id)?
            .map(|m| self.project_root.join(Path::new(&m.scan.root))))
    }
}
