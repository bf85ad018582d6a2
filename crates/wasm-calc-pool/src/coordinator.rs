//! The call coordinator.
//!
//! [`Coordinator`] owns a dedicated multi-threaded Tokio runtime with one
//! worker task per guest instance. Callers push [`CallTicket`]s into a single
//! bounded queue; workers take them in arrival order, so the instance a
//! ticket lands on is only ever touched by that one worker.
//!
//! ```text
//!  submit ──► mpsc queue (FIFO, bounded) ──► worker 0 ── GuestInstance
//!  submit ──►                            ──► worker 1 ── GuestInstance
//!     ▲                                  ──► ...
//!     └──────────── oneshot reply ◄──────────┘
//! ```
//!
//! Cancellation is weak once a ticket is in flight: the caller stops waiting,
//! the worker finishes the guest call (bounded by fuel and the epoch
//! deadline), releases guest memory, and drops the result.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use wasm_calc_common::{BindingError, GuestError, PoolConfig, RuntimeError};
use wasm_calc_core::{GuestInstance, InstanceFactory, WasmEngine};

use crate::context::CallContext;
use crate::stats::{PoolStats, PoolStatsSnapshot};
use crate::ticket::{CallTicket, TicketKind, TicketOutput};

/// Name given to the coordinator's runtime threads.
pub const GUEST_THREAD_NAME: &str = "wasm-calc-guest";

type TicketQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<CallTicket>>>;

/// Cancellable, FIFO access to a pool of guest instances.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    sender: Mutex<Option<mpsc::Sender<CallTicket>>>,
    runtime: Mutex<Option<Runtime>>,
    stats: Arc<PoolStats>,
    shutdown: CancellationToken,
    pool_size: usize,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        // Dropping a runtime blocks, which is not allowed inside async code.
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

impl Coordinator {
    /// Start the pool: build the runtime, instantiate every guest, and start
    /// the epoch ticker.
    ///
    /// Returns once every worker holds a live instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be built or any instance
    /// fails to instantiate.
    #[instrument(skip(config, factory), fields(pool_size = config.pool_size))]
    pub async fn start(
        config: &PoolConfig,
        factory: Arc<InstanceFactory>,
    ) -> Result<Self, RuntimeError> {
        if config.pool_size == 0 || config.queue_depth == 0 {
            return Err(RuntimeError::invalid_config(
                "pool_size and queue_depth must be at least 1",
            ));
        }

        let shutdown = CancellationToken::new();

        // Instantiation runs under the epoch deadline too.
        if factory.engine().is_epoch_enabled() {
            spawn_epoch_ticker(
                factory.engine().clone(),
                factory.engine().config().epoch_tick(),
                shutdown.clone(),
            )?;
        }

        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.pool_size)
            .thread_name(GUEST_THREAD_NAME)
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                shutdown.cancel();
                return Err(e.into());
            }
        };

        let (sender, receiver) = mpsc::channel(config.queue_depth);
        let queue: TicketQueue = Arc::new(tokio::sync::Mutex::new(receiver));
        let stats = Arc::new(PoolStats::default());

        let mut ready = Vec::with_capacity(config.pool_size);
        for index in 0..config.pool_size {
            let (ready_tx, ready_rx) = oneshot::channel();
            let worker = Worker {
                index,
                generation: 0,
                factory: Arc::clone(&factory),
                queue: Arc::clone(&queue),
                stats: Arc::clone(&stats),
            };
            runtime.spawn(worker.run(ready_tx));
            ready.push(ready_rx);
        }

        for ready_rx in ready {
            let outcome = ready_rx.await.unwrap_or(Err(RuntimeError::ChannelClosed));
            if let Err(e) = outcome {
                error!(error = %e, "Guest worker failed to start");
                shutdown.cancel();
                runtime.shutdown_background();
                return Err(e);
            }
        }

        info!(
            pool_size = config.pool_size,
            queue_depth = config.queue_depth,
            "Call coordinator started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                sender: Mutex::new(Some(sender)),
                runtime: Mutex::new(Some(runtime)),
                stats,
                shutdown,
                pool_size: config.pool_size,
            }),
        })
    }

    /// Evaluate `input` on the next free instance.
    ///
    /// Waits until the guest answers or `ctx` is done, whichever comes first.
    ///
    /// # Errors
    ///
    /// - [`BindingError::Cancelled`] / [`BindingError::DeadlineExceeded`] when `ctx` is done
    /// - [`BindingError::Parse`] when the guest rejects the expression
    /// - [`BindingError::Runtime`] when the guest call fails
    /// - [`BindingError::Closed`] after [`Coordinator::close`]
    pub async fn submit(&self, ctx: &CallContext, input: &str) -> Result<String, BindingError> {
        match self.dispatch(ctx, TicketKind::Parse(input.to_owned())).await? {
            TicketOutput::Parsed(result) => Ok(result),
            TicketOutput::Timestamp(_) => Err(RuntimeError::protocol(
                "clock reading returned for a parse ticket",
            )
            .into()),
        }
    }

    /// Read the guest clock through the same queue as parse calls.
    ///
    /// # Errors
    ///
    /// Same as [`Coordinator::submit`].
    pub async fn clock(&self, ctx: &CallContext) -> Result<SystemTime, BindingError> {
        match self.dispatch(ctx, TicketKind::Clock).await? {
            TicketOutput::Timestamp(ts) => Ok(ts),
            TicketOutput::Parsed(_) => {
                Err(RuntimeError::protocol("parse result returned for a clock ticket").into())
            }
        }
    }

    #[instrument(skip(self, ctx, kind), fields(kind = kind.label()))]
    async fn dispatch(
        &self,
        ctx: &CallContext,
        kind: TicketKind,
    ) -> Result<TicketOutput, BindingError> {
        // Already done: never touch the queue or the guest.
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let sender = self.inner.sender.lock().clone().ok_or(BindingError::Closed)?;
        let (ticket, reply_rx) = CallTicket::new(kind, ctx.clone());

        tokio::select! {
            biased;
            err = ctx.done() => return Err(err),
            sent = sender.send(ticket) => sent.map_err(|_| BindingError::Closed)?,
        }
        drop(sender);

        tokio::select! {
            biased;
            err = ctx.done() => {
                debug!(reason = %err, "Caller stopped waiting");
                Err(err)
            }
            reply = reply_rx => match reply {
                Ok(result) => result.map_err(BindingError::from),
                // The worker dropped the ticket: either the context finished
                // while it was queued or the pool went away.
                Err(_) => Err(ctx
                    .err()
                    .unwrap_or(BindingError::Runtime(RuntimeError::ChannelClosed))),
            },
        }
    }

    /// Stop accepting tickets.
    ///
    /// Queued tickets are still served; workers exit once the queue is
    /// drained and their instances are dropped with them.
    pub fn close(&self) {
        if self.inner.sender.lock().take().is_some() {
            info!("Call coordinator closed");
        }
    }

    /// Returns `true` after [`Coordinator::close`].
    pub fn is_closed(&self) -> bool {
        self.inner.sender.lock().is_none()
    }

    /// Number of guest instances.
    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    /// Current pool counters.
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("pool_size", &self.inner.pool_size)
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}

/// One pool worker and the instance it owns.
struct Worker {
    index: usize,
    generation: u64,
    factory: Arc<InstanceFactory>,
    queue: TicketQueue,
    stats: Arc<PoolStats>,
}

impl Worker {
    async fn run(mut self, ready: oneshot::Sender<Result<(), RuntimeError>>) {
        let mut instance = match self.spawn_instance().await {
            Ok(instance) => {
                let _ = ready.send(Ok(()));
                instance
            }
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };

        loop {
            // Holding the lock across `recv` hands tickets out in arrival order.
            let next = self.queue.lock().await.recv().await;
            let Some(ticket) = next else {
                break;
            };

            if let Some(reason) = ticket.ctx.err() {
                self.stats.ticket_skipped();
                debug!(
                    ticket_id = %ticket.id,
                    reason = %reason,
                    "Skipping ticket for finished caller"
                );
                continue;
            }
            if ticket.is_abandoned() {
                self.stats.ticket_skipped();
                debug!(ticket_id = %ticket.id, "Skipping abandoned ticket");
                continue;
            }

            let queued_for = ticket.enqueued_at.elapsed();
            let result = self.serve(&mut instance, &ticket.kind, queued_for).await;

            let ticket_id = ticket.id;
            if !ticket.resolve(result) {
                debug!(ticket_id = %ticket_id, "Caller gone; result dropped");
            }

            if instance.is_poisoned() {
                self.stats.instance_recycled();
                match self.spawn_instance().await {
                    Ok(fresh) => instance = fresh,
                    Err(e) => {
                        error!(worker = self.index, error = %e, "Failed to replace guest instance");
                        break;
                    }
                }
            }
        }

        debug!(worker = self.index, calls = instance.calls(), "Guest worker stopped");
    }

    async fn serve(
        &self,
        instance: &mut GuestInstance,
        kind: &TicketKind,
        queued_for: Duration,
    ) -> Result<TicketOutput, GuestError> {
        self.stats.call_started();

        let result = match kind {
            TicketKind::Parse(input) => {
                instance.invoke_parse(input).await.map(TicketOutput::Parsed)
            }
            TicketKind::Clock => instance.invoke_clock().await.map(TicketOutput::Timestamp),
        };

        self.stats.call_finished(instance.last_call());

        if let Err(GuestError::Runtime(e)) = &result {
            if e.is_resource_limit() {
                self.stats.limit_hit();
                warn!(
                    worker = self.index,
                    instance_id = instance.id(),
                    error = %e,
                    "Guest call hit a resource limit"
                );
            }
        }

        debug!(
            worker = self.index,
            kind = kind.label(),
            ok = result.is_ok(),
            queued_us = queued_for.as_micros(),
            "Guest call finished"
        );

        result
    }

    async fn spawn_instance(&mut self) -> Result<GuestInstance, RuntimeError> {
        let id = format!("guest-{}-{}", self.index, self.generation);
        self.generation += 1;

        let instance = self.factory.instantiate(&id).await?;
        if self.generation > 1 {
            warn!(instance_id = %id, "Guest instance recycled");
        } else {
            debug!(instance_id = %id, "Guest instance created");
        }
        Ok(instance)
    }
}

/// Advance the engine epoch on a plain thread so a busy guest runtime
/// cannot starve it.
fn spawn_epoch_ticker(
    engine: WasmEngine,
    tick: Duration,
    shutdown: CancellationToken,
) -> Result<(), RuntimeError> {
    std::thread::Builder::new()
        .name("wasm-calc-epoch".into())
        .spawn(move || {
            while !shutdown.is_cancelled() {
                std::thread::sleep(tick);
                engine.increment_epoch();
            }
        })?;
    Ok(())
}
