//! Shared provider traits for dependency injection.
//!
//! Time is the one ambient input the audit trail depends on, so it sits behind
//! a trait that tests can replace with a fixed clock.

use chrono::{DateTime, Utc};

/// Trait for providing timestamps.
///
/// # Example
///
/// ```
/// use aishell::providers::{TimeProvider, SystemTimeProvider};
///
/// let provider = SystemTimeProvider;
/// let timestamp = provider.now();
/// assert!(timestamp.timestamp() > 0);
/// ```
pub trait TimeProvider: Send + Sync {
    /// Returns the current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Default time provider using the system clock.
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a single instant.
pub struct FixedTimeProvider(pub DateTime<Utc>);

impl TimeProvider for FixedTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fixed_time_provider_returns_pinned_instant() {
        let instant = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let provider = FixedTimeProvider(instant);

        assert_eq!(provider.now(), instant);
        assert_eq!(provider.now(), provider.now());
    }

    #[test]
    fn test_system_time_provider_is_monotonic_enough() {
        let provider = SystemTimeProvider;
        let first = provider.now();
        let second = provider.now();
        assert!(second >= first);
    }
}
