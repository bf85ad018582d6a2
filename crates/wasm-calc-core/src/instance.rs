//! Guest instance lifecycle and invocation.
//!
//! This module provides:
//! - [`InstanceFactory`]: Links host functions and builds fresh guest instances
//! - [`GuestInstance`]: One live guest that marshals expressions in and results out
//!
//! An invocation follows the guest calling convention:
//!
//! 1. `alloc` a region for the input and copy the UTF-8 bytes in
//! 2. call `parse` on that region
//! 3. read the reply region and `dealloc` it
//! 4. `dealloc` the input region, on every path
//!
//! Fuel and the epoch deadline are re-armed before every export call, so a
//! runaway guest is stopped inside the guest rather than only abandoned by
//! the caller.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tracing::{debug, instrument, warn};
use wasmtime::{
    Instance, Linker, Memory, Store, Trap, TypedFunc, WasmParams, WasmResults,
};

use wasm_calc_common::{ExecutionConfig, GuestError, ParseError, RuntimeError};

use crate::guest::{
    ALLOC_EXPORT, DEALLOC_EXPORT, MEMORY_EXPORT, NOW_EXPORT, OUTSTANDING_EXPORT, PARSE_EXPORT,
    STATUS_OK, STATUS_OUT_OF_MEMORY, STATUS_PARSE_ERROR,
};
use crate::store::{
    CallMetrics, GuestState, create_store, epoch_deadline_ticks, get_remaining_fuel,
};
use crate::{CompiledModule, WasmEngine, clock};

/// Builds guest instances from one compiled module.
///
/// # Thread Safety
///
/// `InstanceFactory` is thread-safe once host functions are registered and
/// is shared by every worker in a pool. Each instance gets its own [`Store`].
pub struct InstanceFactory {
    engine: WasmEngine,
    module: Arc<CompiledModule>,
    linker: Linker<GuestState>,
    execution: ExecutionConfig,
}

impl InstanceFactory {
    /// Create a factory with an empty linker.
    ///
    /// Host functions must be registered through [`InstanceFactory::linker_mut`]
    /// before the first instantiation.
    pub fn new(engine: WasmEngine, module: Arc<CompiledModule>, execution: ExecutionConfig) -> Self {
        let linker = Linker::new(engine.inner());

        Self {
            engine,
            module,
            linker,
            execution,
        }
    }

    /// Get a mutable reference to the linker.
    pub fn linker_mut(&mut self) -> &mut Linker<GuestState> {
        &mut self.linker
    }

    /// Get the engine.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    /// Get the compiled guest module.
    pub fn module(&self) -> &CompiledModule {
        &self.module
    }

    /// Get the per-call execution limits.
    pub fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }

    /// Instantiate a fresh guest and resolve its exports.
    ///
    /// # Errors
    ///
    /// Returns an error if instantiation fails, a required export is
    /// missing, or an export has the wrong signature.
    #[instrument(skip(self))]
    pub async fn instantiate(&self, instance_id: &str) -> Result<GuestInstance, RuntimeError> {
        let start = Instant::now();
        let mut store = create_store(&self.engine, &self.execution, instance_id)?;

        let instance = self
            .linker
            .instantiate_async(&mut store, self.module.module())
            .await
            .map_err(|e| RuntimeError::instantiation_failed(e.to_string()))?;

        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or_else(|| RuntimeError::missing_export(MEMORY_EXPORT))?;

        let alloc = required_func(&instance, &mut store, ALLOC_EXPORT)?;
        let dealloc = required_func(&instance, &mut store, DEALLOC_EXPORT)?;
        let parse = required_func(&instance, &mut store, PARSE_EXPORT)?;
        let now = optional_func(&instance, &mut store, NOW_EXPORT)?;
        let outstanding = optional_func(&instance, &mut store, OUTSTANDING_EXPORT)?;

        let budget = CallBudget {
            fuel: self.execution.fuel_budget(),
            epoch_ticks: epoch_deadline_ticks(&self.engine, &self.execution),
            timeout_ms: self.execution.timeout_ms,
        };

        debug!(
            duration_us = start.elapsed().as_micros(),
            has_clock = now.is_some(),
            "Guest instance ready"
        );

        Ok(GuestInstance {
            id: instance_id.to_string(),
            store,
            memory,
            alloc,
            dealloc,
            parse,
            now,
            outstanding,
            budget,
            max_input_bytes: self.execution.max_input_bytes,
            poisoned: false,
            calls: 0,
        })
    }
}

impl std::fmt::Debug for InstanceFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceFactory")
            .field("module", &self.module)
            .field("execution", &self.execution)
            .finish_non_exhaustive()
    }
}

/// Limits applied to every export call.
#[derive(Debug, Clone, Copy)]
struct CallBudget {
    fuel: u64,
    epoch_ticks: Option<u64>,
    timeout_ms: u64,
}

/// A live guest instance.
///
/// Not shareable: a guest's linear memory and bump state are only safe to
/// touch from one invocation at a time, so the owner holds it by `&mut`.
pub struct GuestInstance {
    id: String,
    store: Store<GuestState>,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    dealloc: TypedFunc<(i32, i32), ()>,
    parse: TypedFunc<(i32, i32), (i32, i32, i32)>,
    now: Option<TypedFunc<(), i64>>,
    outstanding: Option<TypedFunc<(), i32>>,
    budget: CallBudget,
    max_input_bytes: usize,
    poisoned: bool,
    calls: u64,
}

impl GuestInstance {
    /// Evaluate `input` in the guest.
    ///
    /// Returns the decimal result text on success.
    ///
    /// # Errors
    ///
    /// - [`GuestError::Parse`] when the guest rejects the expression
    /// - [`GuestError::Runtime`] when the input is too large, the guest
    ///   traps, runs out of fuel or time, or answers outside the protocol
    #[instrument(skip(self, input), fields(instance_id = %self.id, input_len = input.len()))]
    pub async fn invoke_parse(&mut self, input: &str) -> Result<String, GuestError> {
        self.store.data_mut().begin_call();
        self.calls += 1;

        let result = self.parse_in_guest(input).await;
        self.settle(&result).await;

        result
    }

    /// Read the guest's clock.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::MissingExport`] if the guest has no `now`
    /// export, or [`RuntimeError::InvalidClock`] for a negative reading.
    #[instrument(skip(self), fields(instance_id = %self.id))]
    pub async fn invoke_clock(&mut self) -> Result<SystemTime, GuestError> {
        self.store.data_mut().begin_call();
        self.calls += 1;

        let result = self.clock_in_guest().await;
        self.settle(&result).await;

        result
    }

    /// Returns `true` if the instance must not serve another call.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Accounting for the most recent invocation.
    pub fn last_call(&self) -> &CallMetrics {
        &self.store.data().metrics
    }

    /// Get the instance identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of invocations served.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Access the guest state (logs, metrics).
    pub fn state(&self) -> &GuestState {
        self.store.data()
    }

    async fn parse_in_guest(&mut self, input: &str) -> Result<String, GuestError> {
        let bytes = input.as_bytes();
        if bytes.len() > self.max_input_bytes {
            return Err(RuntimeError::InputTooLarge {
                len: bytes.len(),
                limit: self.max_input_bytes,
            }
            .into());
        }
        let len = i32::try_from(bytes.len()).map_err(|_| RuntimeError::InputTooLarge {
            len: bytes.len(),
            limit: self.max_input_bytes,
        })?;

        let ptr = self.take_region(len).await?;

        let parsed = match self.write_region(ptr, bytes) {
            Ok(()) => {
                call_export(&mut self.store, &self.parse, (ptr, len), self.budget, PARSE_EXPORT)
                    .await
            }
            Err(e) => Err(e),
        };

        // The input region is released whatever the guest did with it.
        let released = self.release_region(ptr, len).await;
        let (status, out_ptr, out_len) = parsed?;

        match status {
            STATUS_OK | STATUS_PARSE_ERROR => {
                // The reply region is owned by the host now; free it before
                // reporting a failed input release.
                self.store.data_mut().metrics.allocations += 1;
                let payload = self.read_region(out_ptr, out_len);
                let reply_released = self.release_region(out_ptr, out_len).await;
                released?;
                reply_released?;
                let payload = payload?;

                if status == STATUS_OK {
                    String::from_utf8(payload).map_err(|e| {
                        GuestError::from(RuntimeError::protocol(format!(
                            "result is not UTF-8: {e}"
                        )))
                    })
                } else {
                    let message = String::from_utf8(payload).map_err(|e| {
                        ParseError::with_source("guest returned a malformed error message", e)
                    })?;
                    Err(ParseError::new(message).into())
                }
            }
            STATUS_OUT_OF_MEMORY => {
                released?;
                Err(RuntimeError::memory("guest could not allocate its reply").into())
            }
            other => {
                released?;
                Err(RuntimeError::protocol(format!("unknown parse status {other}")).into())
            }
        }
    }

    async fn clock_in_guest(&mut self) -> Result<SystemTime, GuestError> {
        let now = self
            .now
            .as_ref()
            .ok_or_else(|| RuntimeError::missing_export(NOW_EXPORT))?;

        let nanos = call_export(&mut self.store, now, (), self.budget, NOW_EXPORT).await?;
        Ok(clock::from_guest_nanos(nanos)?)
    }

    /// Allocate `len` bytes in the guest. A null pointer is a guest OOM.
    async fn take_region(&mut self, len: i32) -> Result<i32, RuntimeError> {
        let ptr = call_export(&mut self.store, &self.alloc, len, self.budget, ALLOC_EXPORT).await?;
        if ptr == 0 {
            return Err(RuntimeError::memory(format!(
                "guest could not allocate {len} bytes"
            )));
        }
        self.store.data_mut().metrics.allocations += 1;
        Ok(ptr)
    }

    async fn release_region(&mut self, ptr: i32, len: i32) -> Result<(), RuntimeError> {
        call_export(
            &mut self.store,
            &self.dealloc,
            (ptr, len),
            self.budget,
            DEALLOC_EXPORT,
        )
        .await?;
        self.store.data_mut().metrics.deallocations += 1;
        Ok(())
    }

    fn write_region(&mut self, ptr: i32, bytes: &[u8]) -> Result<(), RuntimeError> {
        let offset = usize::try_from(ptr)
            .map_err(|_| RuntimeError::protocol(format!("alloc returned negative pointer {ptr}")))?;

        self.memory
            .write(&mut self.store, offset, bytes)
            .map_err(|e| RuntimeError::memory(format!("writing input at {offset}: {e}")))
    }

    fn read_region(&self, ptr: i32, len: i32) -> Result<Vec<u8>, RuntimeError> {
        let (offset, len) = match (usize::try_from(ptr), usize::try_from(len)) {
            (Ok(offset), Ok(len)) => (offset, len),
            _ => {
                return Err(RuntimeError::protocol(format!(
                    "reply region ({ptr}, {len}) is negative"
                )));
            }
        };

        let data = self.memory.data(&self.store);
        offset
            .checked_add(len)
            .and_then(|end| data.get(offset..end))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                RuntimeError::memory(format!(
                    "reply region {offset}+{len} exceeds guest memory of {} bytes",
                    data.len()
                ))
            })
    }

    /// Close out an invocation and decide whether the instance may be reused.
    async fn settle<T>(&mut self, result: &Result<T, GuestError>) {
        self.store.data_mut().finish_call();

        if let Err(e) = result {
            if e.poisons_instance() {
                warn!(instance_id = %self.id, error = %e, "Guest instance poisoned");
                self.poisoned = true;
                return;
            }
        }

        let leaked = self.store.data().metrics.leaked();
        if leaked > 0 {
            warn!(instance_id = %self.id, leaked, "Host regions left unreleased");
            self.poisoned = true;
            return;
        }

        if let Some(outstanding) = &self.outstanding {
            match call_export(
                &mut self.store,
                outstanding,
                (),
                self.budget,
                OUTSTANDING_EXPORT,
            )
            .await
            {
                Ok(0) => {}
                Ok(live) => {
                    warn!(instance_id = %self.id, live, "Guest reports live allocations after call");
                    self.poisoned = true;
                }
                Err(e) => {
                    warn!(instance_id = %self.id, error = %e, "Guest allocation check failed");
                    self.poisoned = true;
                }
            }
        }

        let metrics = &self.store.data().metrics;
        debug!(
            instance_id = %self.id,
            fuel_consumed = metrics.fuel_consumed,
            duration_us = metrics.duration.map(|d| d.as_micros()),
            "Guest call settled"
        );
    }
}

impl std::fmt::Debug for GuestInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestInstance")
            .field("id", &self.id)
            .field("poisoned", &self.poisoned)
            .field("calls", &self.calls)
            .finish_non_exhaustive()
    }
}

/// Call one guest export under a freshly armed budget.
async fn call_export<P, R>(
    store: &mut Store<GuestState>,
    func: &TypedFunc<P, R>,
    params: P,
    budget: CallBudget,
    export: &str,
) -> Result<R, RuntimeError>
where
    P: WasmParams + Send + Sync,
    R: WasmResults + Send + Sync,
{
    store
        .set_fuel(budget.fuel)
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;
    if let Some(ticks) = budget.epoch_ticks {
        store.set_epoch_deadline(ticks);
    }

    let result = func.call_async(&mut *store, params).await;

    let remaining = get_remaining_fuel(store).unwrap_or(0);
    let metrics = &mut store.data_mut().metrics;
    metrics.fuel_consumed = metrics
        .fuel_consumed
        .saturating_add(budget.fuel.saturating_sub(remaining));

    result.map_err(|e| classify_trap(export, &e, budget.timeout_ms))
}

fn required_func<P, R>(
    instance: &Instance,
    store: &mut Store<GuestState>,
    name: &str,
) -> Result<TypedFunc<P, R>, RuntimeError>
where
    P: WasmParams,
    R: WasmResults,
{
    optional_func(instance, store, name)?.ok_or_else(|| RuntimeError::missing_export(name))
}

fn optional_func<P, R>(
    instance: &Instance,
    store: &mut Store<GuestState>,
    name: &str,
) -> Result<Option<TypedFunc<P, R>>, RuntimeError>
where
    P: WasmParams,
    R: WasmResults,
{
    if instance.get_export(&mut *store, name).is_none() {
        return Ok(None);
    }

    instance
        .get_typed_func::<P, R>(&mut *store, name)
        .map(Some)
        .map_err(|e| RuntimeError::protocol(format!("export `{name}` has the wrong signature: {e}")))
}

/// Map a failed export call onto the runtime error taxonomy.
fn classify_trap(export: &str, error: &wasmtime::Error, timeout_ms: u64) -> RuntimeError {
    match error.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => RuntimeError::FuelExhausted,
        Some(Trap::Interrupt) => RuntimeError::ExecutionTimeout {
            duration_ms: timeout_ms,
        },
        Some(trap) => RuntimeError::Trap {
            message: format!("{export}: {error}"),
            code: Some(format!("{trap:?}")),
        },
        None => RuntimeError::trap(format!("{export}: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_out_of_fuel() {
        let err = wasmtime::Error::new(Trap::OutOfFuel);
        assert!(matches!(
            classify_trap(PARSE_EXPORT, &err, 10),
            RuntimeError::FuelExhausted
        ));
    }

    #[test]
    fn test_classify_interrupt() {
        let err = wasmtime::Error::new(Trap::Interrupt);
        assert!(matches!(
            classify_trap(PARSE_EXPORT, &err, 250),
            RuntimeError::ExecutionTimeout { duration_ms: 250 }
        ));
    }

    #[test]
    fn test_classify_other_trap() {
        let err = wasmtime::Error::new(Trap::UnreachableCodeReached);
        match classify_trap(DEALLOC_EXPORT, &err, 10) {
            RuntimeError::Trap { message, code } => {
                assert!(message.starts_with("dealloc"));
                assert_eq!(code.as_deref(), Some("UnreachableCodeReached"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_classify_host_error() {
        let err = wasmtime::Error::msg("host function failed");
        assert!(matches!(
            classify_trap(PARSE_EXPORT, &err, 10),
            RuntimeError::Trap { code: None, .. }
        ));
    }
}
