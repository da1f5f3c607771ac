use std::path::{Component, Path, PathBuf};

/// Absolute project directory every operation resolves paths against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRoot(PathBuf);

impl ProjectRoot {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let absolute = path
            .canonicalize()
            .unwrap_or_else(|_| std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf()));
        Self(absolute)
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn join<P: AsRef<Path>>(&self, relative: P) -> PathBuf {
        let relative = relative.as_ref();
        if relative == Path::new(".") {
            self.0.clone()
        } else {
            self.0.join(relative)
        }
    }

    /// `/`-separated key for `path` relative to `base`, or `None` when outside it.
    pub fn relative_key(base: &Path, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(base).ok()?;
        let parts: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }
}

impl AsRef<Path> for ProjectRoot {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_is_absolute() {
        let temp_dir = TempDir::new().unwrap();
        let root = ProjectRoot::new(temp_dir.path());
        assert!(root.as_path().is_absolute());
        assert_eq!(root.join("."), root.as_path());
        assert_eq!(root.join("src"), root.as_path().join("src"));
    }

    #[test]
    fn test_relative_key() {
        let base = Path::new("/project/src");
        assert_eq!(
            ProjectRoot::relative_key(base, Path::new("/project/src/a/b.rs")),
            Some("a/b.rs".to_string())
        );
        assert_eq!(ProjectRoot::relative_key(base, Path::new("/other/b.rs")), None);
        assert_eq!(ProjectRoot::relative_key(base, base), None);
    }
}
