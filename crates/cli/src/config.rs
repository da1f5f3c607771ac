use anyhow::{Context, Result};
use fnindex_core::{IndexConfig, ProjectRoot};
use std::fs;

pub const CONFIG_FILE: &str = "fnindex.toml";

/// Read `fnindex.toml` from the project root, or fall back to defaults.
pub fn load_config(project: &ProjectRoot) -> Result<IndexConfig> {
    let path = project.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(IndexConfig::default());
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: IndexConfig = toml::from_str(&content)
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    tracing::debug!("Loaded configuration from {}", path.display());
    Ok(config)
}
