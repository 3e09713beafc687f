//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Shared primitives and utilities for the relay runtime."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

/// Capture an instant suitable for latency measurements.
pub fn monotonic_now() -> Instant {
    Instant::now()
}

/// Seconds elapsed since `start`, as carried by `communication_time` messages.
pub fn elapsed_seconds(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}

/// Convert a duration into microseconds, saturating at `u64::MAX`.
pub fn duration_to_micros(duration: Duration) -> u64 {
    duration
        .as_secs()
        .saturating_mul(1_000_000)
        .saturating_add(u64::from(duration.subsec_micros()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn micros_saturate() {
        assert_eq!(duration_to_micros(Duration::from_millis(3)), 3_000);
        assert_eq!(duration_to_micros(Duration::MAX), u64::MAX);
    }

    #[test]
    fn elapsed_is_non_negative() {
        let start = monotonic_now();
        assert!(elapsed_seconds(start) >= 0.0);
    }
}
