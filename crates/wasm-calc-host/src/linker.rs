//! Host function registration for Wasmtime linkers.
//!
//! This module registers everything the calculator guest imports and builds
//! the [`InstanceFactory`] the pool instantiates from.

use std::sync::Arc;

use tracing::warn;
use wasm_calc_common::{ExecutionConfig, RuntimeError};
use wasm_calc_core::guest::MEMORY_EXPORT;
use wasm_calc_core::{CompiledModule, GuestState, InstanceFactory, WasmEngine};
use wasmtime::{Caller, Linker};

use crate::logging::{LoggingHost, level_from_i32};

/// Build an instance factory with all host functions registered.
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn create_instance_factory(
    engine: WasmEngine,
    module: Arc<CompiledModule>,
    execution: ExecutionConfig,
) -> Result<InstanceFactory, RuntimeError> {
    let mut factory = InstanceFactory::new(engine, module, execution);
    register_all(factory.linker_mut())?;
    Ok(factory)
}

/// Register all standard host functions on a core module linker.
///
/// This registers:
/// - `wasi_snapshot_preview1::*` - WASI preview1, used by the guest for its clock
/// - `env::log` - Logging function for guest code
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register_all(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    register_wasi(linker)?;
    register_logging(linker)?;
    Ok(())
}

/// Register WASI preview1 with async host calls.
///
/// The context is built without preopens, environment, or stdio.
pub fn register_wasi(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    wasmtime_wasi::preview1::add_to_linker_async(linker, GuestState::wasi_mut).map_err(|e| {
        RuntimeError::invalid_config(format!("Failed to register WASI preview1: {e}"))
    })
}

/// Register the logging host function.
///
/// Registers `env::log(level: i32, ptr: i32, len: i32)` which allows guest
/// code to emit logs at various levels (debug, info, warn, error).
///
/// # Memory Protocol
///
/// The guest passes:
/// - `level`: Log level (0=debug, 1=info, 2=warn, 3=error)
/// - `ptr`: Pointer to the message string in guest memory
/// - `len`: Length of the message in bytes (UTF-8)
///
/// Malformed regions are dropped with a warning rather than trapping the guest.
pub fn register_logging(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "env",
            "log",
            |mut caller: Caller<'_, GuestState>, level: i32, ptr: i32, len: i32| {
                let (Ok(start), Ok(len)) = (usize::try_from(ptr), usize::try_from(len)) else {
                    warn!(ptr, len, "Invalid pointer or length (negative value)");
                    return;
                };

                let Some(memory) = caller
                    .get_export(MEMORY_EXPORT)
                    .and_then(wasmtime::Extern::into_memory)
                else {
                    warn!("Memory export not found in guest module");
                    return;
                };

                // Copy out before borrowing the state mutably.
                let message = {
                    let data = memory.data(&caller);
                    let Some(bytes) = start
                        .checked_add(len)
                        .and_then(|end| data.get(start..end))
                    else {
                        warn!(
                            start,
                            len,
                            memory_size = data.len(),
                            "Memory access out of bounds"
                        );
                        return;
                    };

                    String::from_utf8_lossy(bytes).into_owned()
                };

                LoggingHost::log(caller.data_mut(), level_from_i32(level), &message);
            },
        )
        .map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to register log function: {e}"))
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_calc_common::EngineConfig;

    #[test]
    fn test_register_logging() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let mut linker = Linker::new(engine.inner());

        let result = register_logging(&mut linker);
        assert!(result.is_ok());
    }

    #[test]
    fn test_register_all() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let mut linker = Linker::new(engine.inner());

        let result = register_all(&mut linker);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bundled_guest_logs_parse_errors() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let module = Arc::new(CompiledModule::bundled(engine.inner()).unwrap());
        let factory =
            create_instance_factory(engine, module, ExecutionConfig::default()).unwrap();

        let mut instance = factory.instantiate("guest-log").await.unwrap();
        let err = instance.invoke_parse("1/0").await.unwrap_err();
        assert!(err.to_string().contains("division by zero"));

        let logs: Vec<_> = instance.state().logs().collect();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "division by zero");
    }

    #[tokio::test]
    async fn test_bundled_guest_clock() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let module = Arc::new(CompiledModule::bundled(engine.inner()).unwrap());
        let factory =
            create_instance_factory(engine, module, ExecutionConfig::default()).unwrap();

        let mut instance = factory.instantiate("guest-clock").await.unwrap();
        let ts = instance.invoke_clock().await.unwrap();
        let skew = wasm_calc_core::clock::skew(ts, std::time::SystemTime::now());
        assert!(skew < std::time::Duration::from_secs(2));
    }
}
