//! The guest calling convention.
//!
//! A calculator guest is a core module exporting `memory`, `alloc`,
//! `dealloc`, and `parse`, plus optional `now` and `outstanding`. The host
//! owns every region it allocates and every reply region `parse` hands back,
//! and releases each one exactly once.

/// Source of the bundled calculator guest.
pub const CALCULATOR_WAT: &str = include_str!("../guest/calculator.wat");

/// Linear memory shared with the host.
pub const MEMORY_EXPORT: &str = "memory";

/// `alloc(len: i32) -> ptr: i32`, returns 0 on failure.
pub const ALLOC_EXPORT: &str = "alloc";

/// `dealloc(ptr: i32, len: i32)`.
pub const DEALLOC_EXPORT: &str = "dealloc";

/// `parse(ptr: i32, len: i32) -> (status: i32, out_ptr: i32, out_len: i32)`.
pub const PARSE_EXPORT: &str = "parse";

/// `now() -> i64`, nanoseconds since the Unix epoch.
pub const NOW_EXPORT: &str = "now";

/// `outstanding() -> i32`, allocations the guest still considers live.
pub const OUTSTANDING_EXPORT: &str = "outstanding";

/// The reply region holds the decimal result.
pub const STATUS_OK: i32 = 0;

/// The reply region holds a parse error message.
pub const STATUS_PARSE_ERROR: i32 = 1;

/// The guest could not allocate a reply; no region was handed back.
pub const STATUS_OUT_OF_MEMORY: i32 = 2;
