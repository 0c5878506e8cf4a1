//! Parsing and validation of `kiln.toml` build configuration.
//!
//! This crate reads the configuration file, applies environment overrides,
//! and resolves derived settings such as the compilation cache root and its
//! size-limiting strategy.

#![warn(missing_docs)]

pub mod error;
pub mod loader;
pub mod resolve;
pub mod types;

pub use error::ConfigError;
pub use loader::{apply_env_overrides, load_config, load_config_from_str, CONFIG_FILE_NAME};
pub use resolve::{
    parse_size_limit, resolve_cache_root, resolve_size_limit, CacheRoot, CacheRootSource,
    SizeLimit,
};
pub use types::*;
