//! Incremental, content-addressed function index.
//!
//! Facade over `fnindex-core`; the `fnindex` binary lives in `crates/cli`.

pub use fnindex_core::*;
