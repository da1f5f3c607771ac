use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Corruption,
    Io,
    Extraction,
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("corrupt record in {file} at line {line}: {message}")]
    Corruption {
        file: String,
        line: usize,
        message: String,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("extraction failed for {file}: {message}")]
    Extraction { file: String, message: String },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IndexError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IndexError::NotFound(_) => ErrorKind::NotFound,
            IndexError::Validation(_) => ErrorKind::Validation,
            IndexError::Corruption { .. } => ErrorKind::Corruption,
            IndexError::Io { .. } | IndexError::Serialization(_) => ErrorKind::Io,
            IndexError::Extraction { .. } => ErrorKind::Extraction,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        IndexError::NotFound(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IndexError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// Returned by `UpdateService::update_index` when a cycle aborts.
///
/// `source` is always the error that aborted the cycle. A failed restore
/// attempt only ever shows up in `errors`.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct UpdateFailure {
    #[source]
    pub source: IndexError,
    pub errors: Vec<String>,
    pub restored_backup: Option<String>,
}

impl UpdateFailure {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

impl From<IndexError> for UpdateFailure {
    fn from(source: IndexError) -> Self {
        Self {
            source,
            errors: Vec::new(),
            restored_backup: None,
        }
    }
}
