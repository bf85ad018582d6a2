//! Configuration file loading for wasm-calc.
//!
//! A binding can be configured from a TOML file. The file holds a single
//! `[runtime]` table mirroring [`RuntimeConfig`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::RuntimeConfig;

/// Environment variable naming a configuration file for the default binding.
pub const CONFIG_ENV_VAR: &str = "WASM_CALC_CONFIG";

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.engine]
/// epoch_interruption = true
///
/// [runtime.execution]
/// max_fuel = 5_000_000
/// timeout_ms = 250
///
/// [runtime.pool]
/// pool_size = 2
/// queue_depth = 256
///
/// [runtime.guest]
/// module_path = "./guest/calculator.wasm"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine, execution, pool and guest settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

impl RuntimeConfig {
    /// Load the configuration named by `WASM_CALC_CONFIG`, or defaults when unset.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is set but the file cannot be loaded.
    pub fn from_env() -> Result<Self, ConfigFileError> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => {
                debug!(path = ?path, "Loading configuration file");
                Ok(ConfigFile::from_file(path)?.runtime)
            }
            None => Ok(Self::default()),
        }
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert_eq!(config.runtime.pool.pool_size, 4);
        assert!(config.runtime.guest.module_path.is_none());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r"
            [runtime.pool]
            pool_size = 1
        ";

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.runtime.pool.pool_size, 1);
        // Defaults applied
        assert_eq!(config.runtime.pool.queue_depth, 1024);
        assert!(config.runtime.engine.epoch_interruption);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [runtime.engine]
            pooling_allocator = true
            max_instances = 8
            instance_memory_mb = 4
            epoch_interruption = false

            [runtime.execution]
            max_fuel = 5_000_000
            fuel_metering = true
            timeout_ms = 50
            max_input_bytes = 128

            [runtime.pool]
            pool_size = 2
            queue_depth = 16

            [runtime.guest]
            module_path = "./calc.wasm"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap().runtime;

        assert!(config.engine.pooling_allocator);
        assert_eq!(config.engine.max_instances, 8);
        assert!(!config.engine.epoch_interruption);
        assert_eq!(config.execution.max_fuel, 5_000_000);
        assert_eq!(config.execution.timeout_ms, 50);
        assert_eq!(config.execution.max_input_bytes, 128);
        assert_eq!(config.pool.pool_size, 2);
        assert_eq!(config.pool.queue_depth, 16);
        assert_eq!(config.guest.module_path.as_deref(), Some("./calc.wasm"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(matches!(result, Err(ConfigFileError::Parse { .. })));
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigFile::from_file("/definitely/not/here/wasm-calc.toml");
        assert!(matches!(result, Err(ConfigFileError::Io { .. })));
    }
}
