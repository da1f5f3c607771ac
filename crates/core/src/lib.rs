//! fnindex core library
//!
//! Content-addressed function index: hashing, crash-safe storage, version
//! history, backups and the incremental update engine.

pub mod config;
pub mod error;
pub mod extractor;
pub mod hash;
pub mod history;
pub mod index_store;
pub mod project;
pub mod record;
pub mod safe_writer;
pub mod scan;
pub mod storage;
pub mod update;

// Re-export main types
pub use config::{IndexConfig, UpdateConfig, WriterConfig, DEFAULT_INDEX_DIR};
pub use error::{ErrorKind, IndexError, Result, UpdateFailure};
pub use extractor::Extractor;
pub use hash::{CommentStyle, HashService};
pub use history::{HistoryConfig, HistoryManager, VersionInfo};
pub use index_store::{BackupManifest, ExportFormat, IndexStore, RepairReport, ValidationReport};
pub use project::ProjectRoot;
pub use record::{FunctionRecord, IndexMetadata, IndexStats, ScanOptions};
pub use safe_writer::SafeFileWriter;
pub use scan::{ScannedFile, SourceScanner};
pub use storage::{FsStorage, MemoryStorage, Storage};
pub use update::{BuildReport, UpdateOptions, UpdateReport, UpdateService};
