//! Call coordination for wasm-calc.
//!
//! This crate makes concurrent use of a small pool of guest instances safe
//! and cancellable:
//!
//! - [`CallContext`]: Caller cancellation and deadlines
//! - [`CallTicket`]: One pending request and its reply channel
//! - [`Coordinator`]: FIFO dispatch onto per-instance workers
//! - [`BatchOutcome`]: Positionally aligned batch results
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use wasm_calc_pool::{CallContext, Coordinator};
//!
//! let coordinator = Coordinator::start(&config.pool, Arc::new(factory)).await?;
//! let result = coordinator.submit(&CallContext::background(), "1+2").await?;
//! assert_eq!(result, "3");
//! ```

pub mod batch;
pub mod context;
pub mod coordinator;
pub mod stats;
pub mod ticket;

pub use batch::BatchOutcome;
pub use context::CallContext;
pub use coordinator::Coordinator;
pub use stats::{PoolStats, PoolStatsSnapshot};
pub use ticket::{CallTicket, TicketKind, TicketOutput};
