//! Common types, errors, and configuration for wasm-calc.
//!
//! This crate provides shared functionality used across the wasm-calc workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for engine, execution, and pool settings
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{EngineConfig, ExecutionConfig, GuestConfig, PoolConfig, RuntimeConfig};
pub use config_file::{CONFIG_ENV_VAR, ConfigFile, ConfigFileError};
pub use error::{BindingError, GuestError, ParseError, RuntimeError};
