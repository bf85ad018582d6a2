//! Conversion of guest clock readings.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use wasm_calc_common::RuntimeError;

/// Convert a guest `now()` reading into a host timestamp.
///
/// # Errors
///
/// Returns [`RuntimeError::InvalidClock`] for negative readings, which the
/// bundled guest uses to signal that the WASI clock was unavailable.
pub fn from_guest_nanos(nanos: i64) -> Result<SystemTime, RuntimeError> {
    let unsigned = u64::try_from(nanos).map_err(|_| RuntimeError::InvalidClock { value: nanos })?;

    UNIX_EPOCH
        .checked_add(Duration::from_nanos(unsigned))
        .ok_or(RuntimeError::InvalidClock { value: nanos })
}

/// Absolute distance between two timestamps.
pub fn skew(a: SystemTime, b: SystemTime) -> Duration {
    match a.duration_since(b) {
        Ok(ahead) => ahead,
        Err(behind) => behind.duration(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_guest_nanos() {
        let ts = from_guest_nanos(1_500_000_000).unwrap();
        assert_eq!(ts, UNIX_EPOCH + Duration::from_millis(1500));

        assert_eq!(from_guest_nanos(0).unwrap(), UNIX_EPOCH);
    }

    #[test]
    fn test_negative_reading_rejected() {
        let err = from_guest_nanos(-1).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidClock { value: -1 }));
    }

    #[test]
    fn test_skew_is_symmetric() {
        let now = SystemTime::now();
        let later = now + Duration::from_millis(250);

        assert_eq!(skew(now, later), Duration::from_millis(250));
        assert_eq!(skew(later, now), Duration::from_millis(250));
        assert_eq!(skew(now, now), Duration::ZERO);
    }
}
