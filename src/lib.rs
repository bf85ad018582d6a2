//! Concurrency-safe arithmetic evaluation backed by a WebAssembly guest.
//!
//! The evaluator itself lives in a WebAssembly module. This crate runs a
//! small pool of guest instances and makes them safe to call from many tasks
//! at once:
//!
//! - [`Binding`]: an explicitly constructed binding with its own pool
//! - [`parse`], [`must_parse`], [`parse_concurrent`], [`get_wasm_timestamp`]:
//!   the same operations on a process-wide binding created on first use
//! - [`CallContext`]: cancellation and deadlines for a call
//!
//! # Quick Start
//!
//! ```ignore
//! use wasm_calc::CallContext;
//!
//! let expr = wasm_calc::parse(&CallContext::background(), "1+2").await?;
//! assert_eq!(expr.raw(), "1+2");
//! assert_eq!(expr.result(), "3");
//! ```
//!
//! The process-wide binding reads its configuration from the TOML file named
//! by `WASM_CALC_CONFIG`, falling back to defaults.

use std::time::SystemTime;

use tokio::sync::OnceCell;
use tracing::error;

pub mod binding;
pub mod expression;

pub use binding::Binding;
pub use expression::Expression;
pub use wasm_calc_common::{
    BindingError, CONFIG_ENV_VAR, EngineConfig, ExecutionConfig, GuestConfig, ParseError,
    PoolConfig, RuntimeConfig, RuntimeError,
};
pub use wasm_calc_core::{CompiledModule, WasmEngine};
pub use wasm_calc_pool::{BatchOutcome, CallContext, PoolStatsSnapshot};

static GLOBAL: OnceCell<Binding> = OnceCell::const_new();

/// The process-wide binding, started on first use.
///
/// A failed start is not cached; the next call tries again.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the binding
/// fails to start.
pub async fn global() -> Result<&'static Binding, BindingError> {
    GLOBAL
        .get_or_try_init(|| async {
            let config = RuntimeConfig::from_env()
                .map_err(|e| RuntimeError::invalid_config(e.to_string()))?;
            Binding::new(&config).await.map_err(|e| {
                error!(error = %e, "Failed to start process-wide binding");
                BindingError::from(e)
            })
        })
        .await
}

/// Evaluate one expression on the process-wide binding.
///
/// # Errors
///
/// See [`Binding::parse`].
pub async fn parse(ctx: &CallContext, input: &str) -> Result<Expression, BindingError> {
    global().await?.parse(ctx, input).await
}

/// Evaluate one expression on the process-wide binding, panicking on failure.
///
/// Not for untrusted input.
///
/// # Panics
///
/// Panics if the binding cannot start or the expression fails.
pub async fn must_parse(input: &str) -> Expression {
    match global().await {
        Ok(binding) => binding.must_parse(input).await,
        Err(e) => panic!("must_parse({input:?}): {e}"),
    }
}

/// Evaluate every input concurrently on the process-wide binding.
///
/// See [`Binding::parse_concurrent`]. If the binding cannot start, every
/// slot is `None` and the start error is returned.
pub async fn parse_concurrent<S: AsRef<str>>(
    ctx: &CallContext,
    inputs: &[S],
) -> (Vec<Option<Expression>>, Option<BindingError>) {
    match global().await {
        Ok(binding) => binding.parse_concurrent(ctx, inputs).await,
        Err(e) => (vec![None; inputs.len()], Some(e)),
    }
}

/// Read the guest clock through the process-wide binding.
///
/// # Errors
///
/// See [`Binding::get_wasm_timestamp`].
pub async fn get_wasm_timestamp(ctx: &CallContext) -> Result<SystemTime, BindingError> {
    global().await?.get_wasm_timestamp(ctx).await
}
