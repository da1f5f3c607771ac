use crate::record::FunctionRecord;
use std::path::Path;

/// Pulls function records out of one source file.
///
/// Implementations fill every [`FunctionRecord`] field, including the two
/// digests (see [`crate::hash::HashService`]). The `file` field may be any
/// spelling of the path; the update service rewrites it to the scan-relative
/// key before persisting.
pub trait Extractor: Send + Sync {
    fn extract(&self, path: &Path) -> anyhow::Result<Vec<FunctionRecord>>;
}

impl<F> Extractor for F
where
    F: Fn(&Path) -> anyhow::Result<Vec<FunctionRecord>> + Send + Sync,
{
    fn extract(&self, path: &Path) -> anyhow::Result<Vec<FunctionRecord>> {
        self(path)
    }
}
