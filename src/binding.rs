//! An explicit binding: one guest pool and the runtime that drives it.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::{info, instrument};

use wasm_calc_common::{BindingError, RuntimeConfig, RuntimeError};
use wasm_calc_core::{CompiledModule, WasmEngine};
use wasm_calc_host::create_instance_factory;
use wasm_calc_pool::{BatchOutcome, CallContext, Coordinator, PoolStatsSnapshot};

use crate::Expression;

/// Concurrency-safe access to the calculator guest.
///
/// Each binding owns its engine, its guest instances and a dedicated Tokio
/// runtime for them, so it can be used from any caller runtime. Clones share
/// the same pool.
///
/// # Example
///
/// ```ignore
/// use wasm_calc::{Binding, CallContext, RuntimeConfig};
///
/// let binding = Binding::new(&RuntimeConfig::default()).await?;
/// let expr = binding.parse(&CallContext::background(), "2*(3+4)").await?;
/// assert_eq!(expr.result(), "14");
/// ```
#[derive(Debug, Clone)]
pub struct Binding {
    coordinator: Coordinator,
}

impl Binding {
    /// Start a binding from configuration.
    ///
    /// Loads the guest named by `config.guest.module_path`, or the bundled
    /// calculator when unset.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the guest cannot be
    /// compiled, or the pool fails to start.
    #[instrument(skip(config), fields(module_path = ?config.guest.module_path))]
    pub async fn new(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;

        let engine = WasmEngine::new(&config.engine)?;
        let module = match &config.guest.module_path {
            Some(path) => CompiledModule::from_file(engine.inner(), path)?,
            None => CompiledModule::bundled(engine.inner())?,
        };

        Self::start(config, engine, module).await
    }

    /// Start a binding around an already compiled guest.
    ///
    /// `engine` must be the engine that compiled `module`; Wasmtime does not
    /// share compiled code between engines. `config.engine` is ignored in
    /// favour of the engine's own settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the pool fails
    /// to start.
    pub async fn with_module(
        config: &RuntimeConfig,
        engine: WasmEngine,
        module: CompiledModule,
    ) -> Result<Self, RuntimeError> {
        let mut config = config.clone();
        config.engine = engine.config().clone();
        config.validate()?;
        Self::start(&config, engine, module).await
    }

    async fn start(
        config: &RuntimeConfig,
        engine: WasmEngine,
        module: CompiledModule,
    ) -> Result<Self, RuntimeError> {
        let content_hash = module.content_hash().to_owned();
        let factory =
            create_instance_factory(engine, Arc::new(module), config.execution.clone())?;
        let coordinator = Coordinator::start(&config.pool, Arc::new(factory)).await?;

        info!(
            content_hash = %content_hash,
            pool_size = config.pool.pool_size,
            "Binding ready"
        );

        Ok(Self { coordinator })
    }

    /// Evaluate one expression.
    ///
    /// Returns as soon as the guest answers or `ctx` is done. A call
    /// abandoned mid-flight still runs to completion inside the pool; its
    /// result is discarded.
    ///
    /// # Errors
    ///
    /// - [`BindingError::Parse`] if the guest rejects the expression
    /// - [`BindingError::Cancelled`] / [`BindingError::DeadlineExceeded`] if `ctx` finishes first
    /// - [`BindingError::Runtime`] if the guest call fails
    /// - [`BindingError::Closed`] after [`Binding::close`]
    pub async fn parse(&self, ctx: &CallContext, input: &str) -> Result<Expression, BindingError> {
        let result = self.coordinator.submit(ctx, input).await?;
        Ok(Expression::new(input, result))
    }

    /// Evaluate one expression, panicking on any failure.
    ///
    /// Only use this with trusted, known-good input such as constants in
    /// tests or configuration. Untrusted input can make it panic.
    ///
    /// # Panics
    ///
    /// Panics if [`Binding::parse`] returns an error.
    pub async fn must_parse(&self, input: &str) -> Expression {
        match self.parse(&CallContext::background(), input).await {
            Ok(expr) => expr,
            Err(e) => panic!("must_parse({input:?}): {e}"),
        }
    }

    /// Evaluate every input concurrently.
    ///
    /// Slot `i` of the returned vector belongs to `inputs[i]` and is `None`
    /// if that input failed. The error is the first failure to complete, so
    /// successful slots are kept even when the batch reports an error.
    pub async fn parse_concurrent<S: AsRef<str>>(
        &self,
        ctx: &CallContext,
        inputs: &[S],
    ) -> (Vec<Option<Expression>>, Option<BindingError>) {
        self.parse_batch(ctx, inputs).await.into_parts()
    }

    /// Like [`Binding::parse_concurrent`], keeping every per-slot error.
    pub async fn parse_batch<S: AsRef<str>>(
        &self,
        ctx: &CallContext,
        inputs: &[S],
    ) -> BatchOutcome<Expression> {
        self.coordinator
            .submit_batch(ctx, inputs)
            .await
            .map(|index, result| Expression::new(inputs[index].as_ref(), result))
    }

    /// Read the current time from the guest's WASI clock.
    ///
    /// # Errors
    ///
    /// Same as [`Binding::parse`]; a guest without a `now` export yields
    /// [`RuntimeError::MissingExport`].
    pub async fn get_wasm_timestamp(&self, ctx: &CallContext) -> Result<SystemTime, BindingError> {
        self.coordinator.clock(ctx).await
    }

    /// Stop accepting calls. Calls already queued still complete.
    pub fn close(&self) {
        self.coordinator.close();
    }

    /// Returns `true` after [`Binding::close`].
    pub fn is_closed(&self) -> bool {
        self.coordinator.is_closed()
    }

    /// Number of guest instances serving this binding.
    pub fn pool_size(&self) -> usize {
        self.coordinator.pool_size()
    }

    /// Current pool counters.
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.coordinator.stats()
    }
}
