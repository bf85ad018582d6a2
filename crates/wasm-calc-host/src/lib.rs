//! Host functions for the wasm-calc guest.
//!
//! The calculator guest imports two things from its host:
//!
//! - `wasi_snapshot_preview1`: only `clock_time_get` is used, to answer `now()`
//! - [`logging`]: `env.log`, which the guest calls to report parse failures
//!
//! [`linker::create_instance_factory`] wires both into an
//! [`InstanceFactory`](wasm_calc_core::InstanceFactory) ready to build instances.

pub mod linker;
pub mod logging;

pub use linker::{create_instance_factory, register_all};
pub use logging::LoggingHost;
