//! Configuration structures for wasm-calc.
//!
//! This module defines configuration options for each layer of the binding:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, epoch interruption)
//! - [`ExecutionConfig`]: Per-call guest limits (fuel, timeout, input size)
//! - [`PoolConfig`]: Instance pool and ticket queue sizing
//! - [`GuestConfig`]: Which guest module to load

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::RuntimeError;

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for a binding.
/// It can be loaded from TOML files (see [`crate::ConfigFile`]) or built in code.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-call execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Instance pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Guest module selection.
    #[serde(default)]
    pub guest: GuestConfig,
}

impl RuntimeConfig {
    /// Check the configuration for values the binding cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.pool.pool_size == 0 {
            return Err(RuntimeError::invalid_config("pool.pool_size must be at least 1"));
        }
        if self.pool.queue_depth == 0 {
            return Err(RuntimeError::invalid_config(
                "pool.queue_depth must be at least 1",
            ));
        }
        if self.execution.max_input_bytes == 0 {
            return Err(RuntimeError::invalid_config(
                "execution.max_input_bytes must be at least 1",
            ));
        }
        if self.engine.epoch_interruption && self.engine.epoch_tick_ms == 0 {
            return Err(RuntimeError::invalid_config(
                "engine.epoch_tick_ms must be at least 1 when epoch interruption is enabled",
            ));
        }
        // Recycling a poisoned instance briefly needs one extra slot.
        if self.engine.pooling_allocator
            && (self.engine.max_instances as usize) <= self.pool.pool_size
        {
            return Err(RuntimeError::invalid_config(format!(
                "engine.max_instances ({}) must exceed pool.pool_size ({})",
                self.engine.max_instances, self.pool.pool_size
            )));
        }
        Ok(())
    }
}

/// Wasmtime engine configuration.
///
/// These settings affect the shared Wasmtime engine behavior,
/// including memory allocation strategy and interruption support.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for instance creation.
    ///
    /// The pool is small and long-lived, so on-demand allocation is the default.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the allocator pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Enable epoch-based interruption.
    ///
    /// When enabled, a guest call that runs past `execution.timeout_ms`
    /// is interrupted inside the guest.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Interval between epoch increments in milliseconds.
    #[serde(default = "defaults::epoch_tick_ms")]
    pub epoch_tick_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            epoch_interruption: defaults::epoch_interruption(),
            epoch_tick_ms: defaults::epoch_tick_ms(),
        }
    }
}

impl EngineConfig {
    /// Get the epoch tick interval as a `Duration`.
    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms)
    }
}

/// Per-call execution configuration.
///
/// These settings bound what a single guest invocation may consume.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Maximum fuel (CPU instructions) per guest export call.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Enable fuel metering.
    ///
    /// When disabled, calls still run on a fuel-enabled engine but with an
    /// effectively unlimited budget.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,

    /// Guest execution timeout in milliseconds.
    ///
    /// Enforced through epoch interruption, so it only applies when
    /// `engine.epoch_interruption` is enabled.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Largest expression, in UTF-8 bytes, that will be staged into guest memory.
    #[serde(default = "defaults::max_input_bytes")]
    pub max_input_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fuel: defaults::max_fuel(),
            fuel_metering: defaults::fuel_metering(),
            timeout_ms: defaults::timeout_ms(),
            max_input_bytes: defaults::max_input_bytes(),
        }
    }
}

impl ExecutionConfig {
    /// Get the timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Fuel granted to each guest export call.
    pub fn fuel_budget(&self) -> u64 {
        if self.fuel_metering {
            self.max_fuel
        } else {
            u64::MAX
        }
    }
}

/// Instance pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Number of guest instances, each driven by its own worker.
    ///
    /// A pool of one serializes every call.
    #[serde(default = "defaults::pool_size")]
    pub pool_size: usize,

    /// Capacity of the pending ticket queue.
    ///
    /// Submitters wait for room once the queue is full.
    #[serde(default = "defaults::queue_depth")]
    pub queue_depth: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: defaults::pool_size(),
            queue_depth: defaults::queue_depth(),
        }
    }
}

/// Guest module selection.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GuestConfig {
    /// Path to a guest module (`.wasm`, `.wat`, or precompiled `.cwasm`).
    ///
    /// When unset, the bundled calculator guest is used.
    #[serde(default)]
    pub module_path: Option<String>,
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn max_instances() -> u32 {
        16
    }

    pub const fn instance_memory_mb() -> u32 {
        16
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn epoch_tick_ms() -> u64 {
        1
    }

    pub const fn max_fuel() -> u64 {
        10_000_000
    }

    pub const fn fuel_metering() -> bool {
        true
    }

    pub const fn timeout_ms() -> u64 {
        1000
    }

    pub const fn max_input_bytes() -> usize {
        4096
    }

    pub const fn pool_size() -> usize {
        4
    }

    pub const fn queue_depth() -> usize {
        1024
    }
}
