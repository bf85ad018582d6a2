//! Per-instance guest state and store management.
//!
//! This module provides:
//! - [`GuestState`]: State owned by one guest instance, reachable from host functions
//! - [`LogEntry`] and [`LogLevel`]: Structured logging from guest code
//! - [`CallMetrics`]: Accounting for the most recent guest invocation

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::WasmEngine;
use wasm_calc_common::{ExecutionConfig, RuntimeError};

/// Guest log entries retained per instance.
pub const LOG_CAPACITY: usize = 64;

/// State owned by a single guest instance.
///
/// Unlike a per-request context, this lives as long as the instance: it is
/// created when the instance is built and dropped when the instance is
/// recycled. Per-call fields are reset by [`GuestState::begin_call`].
///
/// Host functions reach it through [`wasmtime::Caller::data_mut`].
pub struct GuestState {
    /// WASI preview1 context. Only the clocks are meaningful to the guest.
    wasi: WasiP1Ctx,

    /// Linear memory growth limit.
    limits: StoreLimits,

    /// Identifier used in traces.
    pub instance_id: String,

    /// Most recent guest log entries, oldest first.
    logs: VecDeque<LogEntry>,

    /// Accounting for the current or most recent call.
    pub metrics: CallMetrics,

    call_started: Option<Instant>,
}

/// A single log entry from guest code.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level (debug, info, warn, error).
    pub level: LogLevel,

    /// Log message content.
    pub message: String,

    /// Timestamp when the log was recorded.
    pub timestamp: Instant,
}

/// Log level for guest logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug-level messages.
    Debug,
    /// Informational messages.
    Info,
    /// Warning messages.
    Warn,
    /// Error messages.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Accounting for one guest invocation.
#[derive(Debug, Clone, Default)]
pub struct CallMetrics {
    /// Fuel consumed across every export the invocation called.
    pub fuel_consumed: u64,

    /// Regions the host took ownership of (its own input plus the guest's reply).
    pub allocations: u32,

    /// Regions the host released.
    pub deallocations: u32,

    /// Wall-clock duration of the invocation.
    pub duration: Option<Duration>,
}

impl CallMetrics {
    /// Regions taken but not released during the call.
    pub fn leaked(&self) -> u32 {
        self.allocations.saturating_sub(self.deallocations)
    }
}

impl GuestState {
    /// Create guest state for a new instance.
    ///
    /// `max_memory_bytes` bounds linear memory growth for the instance.
    pub fn new(instance_id: impl Into<String>, max_memory_bytes: usize) -> Self {
        // No preopens, env, or stdio: the guest only needs the clocks.
        let wasi = WasiCtxBuilder::new().build_p1();
        let limits = StoreLimitsBuilder::new()
            .memory_size(max_memory_bytes)
            .build();

        Self {
            wasi,
            limits,
            instance_id: instance_id.into(),
            logs: VecDeque::with_capacity(LOG_CAPACITY),
            metrics: CallMetrics::default(),
            call_started: None,
        }
    }

    /// Get the WASI context for linker registration.
    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }

    /// Add a log entry, evicting the oldest once full.
    pub fn log(&mut self, level: LogLevel, message: String) {
        if self.logs.len() == LOG_CAPACITY {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            level,
            message,
            timestamp: Instant::now(),
        });
    }

    /// Iterate over retained log entries, oldest first.
    pub fn logs(&self) -> impl Iterator<Item = &LogEntry> {
        self.logs.iter()
    }

    /// Take all retained log entries.
    pub fn drain_logs(&mut self) -> Vec<LogEntry> {
        self.logs.drain(..).collect()
    }

    /// Reset per-call accounting.
    pub fn begin_call(&mut self) {
        self.metrics = CallMetrics::default();
        self.call_started = Some(Instant::now());
    }

    /// Record the call duration.
    pub fn finish_call(&mut self) {
        self.metrics.duration = self.call_started.take().map(|start| start.elapsed());
    }
}

/// Create a Wasmtime store for one guest instance.
///
/// The store starts with a full fuel budget and, when the engine uses epoch
/// interruption, a deadline covering instantiation. Both are re-armed before
/// every export call.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    engine: &WasmEngine,
    config: &ExecutionConfig,
    instance_id: impl Into<String>,
) -> Result<Store<GuestState>, RuntimeError> {
    let max_memory_bytes = (engine.config().instance_memory_mb as usize) * 1024 * 1024;
    let state = GuestState::new(instance_id, max_memory_bytes);
    let mut store = Store::new(engine.inner(), state);

    store.limiter(|state| &mut state.limits);

    store
        .set_fuel(config.fuel_budget())
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;

    if let Some(ticks) = epoch_deadline_ticks(engine, config) {
        store.set_epoch_deadline(ticks);
    }

    Ok(store)
}

/// Epoch ticks that cover `timeout_ms`, or `None` without epoch interruption.
pub fn epoch_deadline_ticks(engine: &WasmEngine, config: &ExecutionConfig) -> Option<u64> {
    if !engine.is_epoch_enabled() {
        return None;
    }
    let tick_ms = engine.config().epoch_tick_ms.max(1);
    Some(config.timeout_ms.div_ceil(tick_ms).max(1))
}

/// Get remaining fuel from a store.
pub fn get_remaining_fuel(store: &Store<GuestState>) -> Option<u64> {
    store.get_fuel().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_calc_common::EngineConfig;

    #[test]
    fn test_guest_state_creation() {
        let state = GuestState::new("guest-0", 1 << 20);

        assert_eq!(state.instance_id, "guest-0");
        assert_eq!(state.logs().count(), 0);
        assert_eq!(state.metrics.fuel_consumed, 0);
    }

    #[test]
    fn test_guest_state_logging() {
        let mut state = GuestState::new("test", 1 << 20);

        state.log(LogLevel::Info, "Hello".into());
        state.log(LogLevel::Error, "World".into());

        let logs: Vec<_> = state.logs().collect();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].level, LogLevel::Info);
        assert_eq!(logs[0].message, "Hello");
        assert_eq!(logs[1].level, LogLevel::Error);

        assert_eq!(state.drain_logs().len(), 2);
        assert_eq!(state.logs().count(), 0);
    }

    #[test]
    fn test_log_buffer_is_bounded() {
        let mut state = GuestState::new("test", 1 << 20);

        for i in 0..LOG_CAPACITY + 10 {
            state.log(LogLevel::Debug, format!("entry {i}"));
        }

        let logs: Vec<_> = state.logs().collect();
        assert_eq!(logs.len(), LOG_CAPACITY);
        assert_eq!(logs[0].message, "entry 10");
    }

    #[test]
    fn test_log_level_display() {
        assert_eq!(LogLevel::Debug.to_string(), "DEBUG");
        assert_eq!(LogLevel::Info.to_string(), "INFO");
        assert_eq!(LogLevel::Warn.to_string(), "WARN");
        assert_eq!(LogLevel::Error.to_string(), "ERROR");
    }

    #[test]
    fn test_call_metrics_reset() {
        let mut state = GuestState::new("test", 1 << 20);
        state.metrics.allocations = 2;
        state.metrics.deallocations = 1;
        assert_eq!(state.metrics.leaked(), 1);

        state.begin_call();
        assert_eq!(state.metrics.allocations, 0);
        state.finish_call();
        assert!(state.metrics.duration.is_some());
    }

    #[test]
    fn test_store_fuel() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let exec_config = ExecutionConfig {
            max_fuel: 1000,
            fuel_metering: true,
            ..Default::default()
        };

        let store = create_store(&engine, &exec_config, "test").unwrap();
        assert_eq!(get_remaining_fuel(&store), Some(1000));
    }

    #[test]
    fn test_epoch_deadline_ticks() {
        let engine = WasmEngine::new(&EngineConfig {
            epoch_tick_ms: 10,
            ..Default::default()
        })
        .unwrap();
        let exec = ExecutionConfig {
            timeout_ms: 95,
            ..Default::default()
        };
        assert_eq!(epoch_deadline_ticks(&engine, &exec), Some(10));

        let engine = WasmEngine::new(&EngineConfig {
            epoch_interruption: false,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(epoch_deadline_ticks(&engine, &exec), None);
    }
}
