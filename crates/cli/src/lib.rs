//! Command line interface for fnindex
//!
//! Wires the core library to the filesystem, `fnindex.toml` and the regex
//! based extractor.

pub mod cli;
pub mod config;
pub mod regex_extractor;

// Re-exports
pub use cli::Cli;
pub use config::{load_config, CONFIG_FILE};
pub use regex_extractor::{Language, RegexExtractor};
