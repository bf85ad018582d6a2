//! Logging host function implementation.
//!
//! Guest log lines are kept in the instance's [`GuestState`] and forwarded to
//! `tracing` under the instance id.

use wasm_calc_core::{GuestState, LogLevel};
use tracing::{debug, error, info, warn};

/// Host implementation for `env.log`.
///
/// Logs are both:
/// 1. Stored in the [`GuestState`] ring buffer for later retrieval
/// 2. Emitted via the `tracing` crate for observability
pub struct LoggingHost;

impl LoggingHost {
    /// Log a message at the specified level.
    pub fn log(state: &mut GuestState, level: LogLevel, message: &str) {
        let instance_id = state.instance_id.as_str();
        match level {
            LogLevel::Debug => debug!(instance_id, guest_log = true, "{}", message),
            LogLevel::Info => info!(instance_id, guest_log = true, "{}", message),
            LogLevel::Warn => warn!(instance_id, guest_log = true, "{}", message),
            LogLevel::Error => error!(instance_id, guest_log = true, "{}", message),
        }

        state.log(level, message.to_string());
    }
}

/// Convert a numeric log level to [`LogLevel`].
///
/// Levels are 0=debug, 1=info, 2=warn, 3=error; anything else is Info.
pub fn level_from_i32(level: i32) -> LogLevel {
    match level {
        0 => LogLevel::Debug,
        2 => LogLevel::Warn,
        3 => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_stores_in_state() {
        let mut state = GuestState::new("guest-1", 1 << 20);

        LoggingHost::log(&mut state, LogLevel::Info, "Hello");
        LoggingHost::log(&mut state, LogLevel::Debug, "division by zero");

        let logs: Vec<_> = state.logs().collect();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "Hello");
        assert_eq!(logs[0].level, LogLevel::Info);
        assert_eq!(logs[1].message, "division by zero");
        assert_eq!(logs[1].level, LogLevel::Debug);
    }

    #[test]
    fn test_level_from_i32() {
        assert_eq!(level_from_i32(0), LogLevel::Debug);
        assert_eq!(level_from_i32(1), LogLevel::Info);
        assert_eq!(level_from_i32(2), LogLevel::Warn);
        assert_eq!(level_from_i32(3), LogLevel::Error);
        assert_eq!(level_from_i32(99), LogLevel::Info);
    }
}
