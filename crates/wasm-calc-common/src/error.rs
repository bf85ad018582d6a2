//! Error types for wasm-calc.
//!
//! This module defines the error taxonomy using `thiserror`:
//! - [`BindingError`]: What a caller of the binding sees
//! - [`ParseError`]: The guest rejected the expression
//! - [`RuntimeError`]: The guest or the host/guest channel failed
//! - [`GuestError`]: What a single guest invocation produces

use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// Errors returned to callers of the binding.
///
/// Cancellation is reported separately from guest failures so callers can
/// tell "I stopped waiting" apart from "the expression is invalid".
#[derive(Error, Debug)]
pub enum BindingError {
    /// The caller's context was cancelled.
    #[error("context canceled")]
    Cancelled,

    /// The caller's context deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The guest reported the expression as invalid.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The guest trapped or could not be reached.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// The binding has been shut down.
    #[error("binding is closed")]
    Closed,
}

impl BindingError {
    /// Returns `true` for `Cancelled` and `DeadlineExceeded`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    /// Returns `true` if the guest rejected the input.
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse(_))
    }

    /// Returns `true` if the guest or channel failed.
    pub fn is_runtime(&self) -> bool {
        matches!(self, Self::Runtime(_))
    }
}

impl From<GuestError> for BindingError {
    fn from(error: GuestError) -> Self {
        match error {
            GuestError::Parse(e) => Self::Parse(e),
            GuestError::Runtime(e) => Self::Runtime(e),
        }
    }
}

/// A guest-reported parse failure.
///
/// The message comes from the guest evaluator, e.g. `division by zero`.
#[derive(Error, Debug)]
#[error("parse error: {message}")]
pub struct ParseError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl ParseError {
    /// Create a parse error with a message and no underlying cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create a parse error wrapping an underlying cause.
    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Failures of the guest runtime or the host/guest channel.
///
/// None of these are retried by the binding.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// WebAssembly compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// Instantiating the guest module failed.
    #[error("Instantiation failed: {reason}")]
    InstantiationFailed {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// The guest module lacks a required export.
    #[error("Guest export missing: {name}")]
    MissingExport {
        /// Name of the missing export.
        name: String,
    },

    /// A WebAssembly trap occurred during execution.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
        /// Trap code if available.
        code: Option<String>,
    },

    /// Execution exhausted the configured fuel limit.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// Execution was interrupted after the configured timeout.
    #[error("Execution timeout after {duration_ms}ms")]
    ExecutionTimeout {
        /// The timeout duration in milliseconds.
        duration_ms: u64,
    },

    /// Guest memory could not be allocated, read, or written.
    #[error("Guest memory error: {reason}")]
    Memory {
        /// Description of the memory failure.
        reason: String,
    },

    /// The guest answered outside the calling convention.
    #[error("Guest protocol violation: {reason}")]
    Protocol {
        /// Description of the violation.
        reason: String,
    },

    /// The input exceeds the configured maximum.
    #[error("Input too large: {len} bytes (limit {limit})")]
    InputTooLarge {
        /// Input size in bytes.
        len: usize,
        /// Configured limit in bytes.
        limit: usize,
    },

    /// The guest clock returned a value that is not a valid time.
    #[error("Invalid guest clock value: {value}")]
    InvalidClock {
        /// The raw value returned by the guest.
        value: i64,
    },

    /// The worker that owned the call went away before answering.
    #[error("Guest worker channel closed")]
    ChannelClosed,

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

impl RuntimeError {
    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InstantiationFailed` error.
    pub fn instantiation_failed(reason: impl Into<String>) -> Self {
        Self::InstantiationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `MissingExport` error.
    pub fn missing_export(name: impl Into<String>) -> Self {
        Self::MissingExport { name: name.into() }
    }

    /// Create a new `Trap` error without a trap code.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
            code: None,
        }
    }

    /// Create a new `Memory` error.
    pub fn memory(reason: impl Into<String>) -> Self {
        Self::Memory {
            reason: reason.into(),
        }
    }

    /// Create a new `Protocol` error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            Self::FuelExhausted | Self::ExecutionTimeout { .. } | Self::InputTooLarge { .. }
        )
    }

    /// Returns `true` if the instance that produced this error can no longer
    /// be trusted and must be replaced before its next call.
    pub fn poisons_instance(&self) -> bool {
        matches!(
            self,
            Self::Trap { .. }
                | Self::FuelExhausted
                | Self::ExecutionTimeout { .. }
                | Self::Memory { .. }
                | Self::Protocol { .. }
        )
    }
}

/// Outcome of a failed guest invocation.
#[derive(Error, Debug)]
pub enum GuestError {
    /// The guest rejected the input.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The invocation itself failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl GuestError {
    /// Returns `true` if the instance must be replaced after this error.
    pub fn poisons_instance(&self) -> bool {
        match self {
            Self::Parse(_) => false,
            Self::Runtime(e) => e.poisons_instance(),
        }
    }
}
