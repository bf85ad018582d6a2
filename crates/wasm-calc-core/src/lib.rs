//! Core Wasmtime runtime for wasm-calc.
//!
//! This crate provides the guest-facing half of the binding:
//! - [`WasmEngine`]: Configured Wasmtime engine with fuel and epoch interruption
//! - [`CompiledModule`]: The compiled calculator guest
//! - [`GuestState`]: Per-instance state reachable from host functions
//! - [`InstanceFactory`] and [`GuestInstance`]: Instantiation and the guest invoker
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  (Shared by every instance, thread-safe)                │
//! │  - Fuel metering, epoch interruption                    │
//! │  - Optional pooling allocator                           │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          CompiledModule + InstanceFactory               │
//! │  (Shared, read-only)                                    │
//! │  - Pre-compiled guest code                              │
//! │  - Linker with WASI clocks and env.log                  │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │         GuestInstance (Store<GuestState>)               │
//! │  (One per pool worker, never shared)                    │
//! │  - alloc / parse / dealloc marshaling                   │
//! │  - Poisoned on trap or leaked allocation                │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod clock;
pub mod engine;
pub mod guest;
pub mod instance;
pub mod module;
pub mod store;

pub use engine::WasmEngine;
pub use guest::CALCULATOR_WAT;
pub use instance::{GuestInstance, InstanceFactory};
pub use module::CompiledModule;
pub use store::{CallMetrics, GuestState, LogEntry, LogLevel};
