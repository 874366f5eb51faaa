//! Runtime adapters for patchsmith (config, workspace path resolution).

pub mod config;
pub mod util;
