#![allow(dead_code)]

use fnindex_cli::RegexExtractor;
use fnindex_workspace::{
    FsStorage, IndexStore, ProjectRoot, ScanOptions, Storage, UpdateConfig, UpdateService,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub const INDEX_ID: &str = "functions";

/// A throwaway project on disk with an update service over it.
pub struct TestProject {
    pub temp_dir: TempDir,
    pub service: UpdateService,
}

impl TestProject {
    pub fn new() -> Self {
        Self::with_config(UpdateConfig::default())
    }

    pub fn with_config(config: UpdateConfig) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = ProjectRoot::new(temp_dir.path());
        let storage: Arc<dyn Storage> = Arc::new(FsStorage::new(root.as_path()));
        let store = IndexStore::new(storage, ".fnindex", 5);
        let extractor = Arc::new(RegexExtractor::new("default").unwrap());
        let service = UpdateService::new(store, extractor, root, config);
        Self { temp_dir, service }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn write(&self, relative: &str, content: &str) {
        let path = self.path().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub fn remove(&self, relative: &str) {
        fs::remove_file(self.path().join(relative)).unwrap();
    }

    pub fn store(&self) -> &IndexStore {
        self.service.store()
    }

    pub fn build(&self) {
        self.service
            .build_index(INDEX_ID, ScanOptions::default())
            .unwrap();
    }

    /// Identifiers per file, in index order.
    pub fn identifiers(&self, id: &str) -> Vec<(String, String)> {
        self.store()
            .load_index(id)
            .unwrap()
            .into_iter()
            .map(|r| (r.file, r.identifier))
            .collect()
    }

    /// Small mixed-language project: 4 functions in 3 files.
    pub fn seed(&self) {
        self.write(
            "src/lib.rs",
            "pub fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n\nfn helper() {}\n",
        );
        self.write(
            "web/api.ts",
            "export async function fetchUser(id: string) {\n  return id;\n}\n",
        );
        self.write("tools/run.py", "def main():\n    print('hi')\n");
    }
}
