//! Progress arithmetic for running transfers: fraction, emission gating,
//! smoothed network speed, and time-remaining estimation.

use std::time::Instant;

/// Minimum progress delta before another progress update may be emitted.
pub const MIN_PROGRESS_DELTA: f64 = 0.02;
/// Minimum interval between progress updates, in milliseconds.
pub const MIN_PROGRESS_INTERVAL_MS: u128 = 500;
/// Smoothing factor for the network speed EWMA (weight on the old value).
const SPEED_SMOOTHING: f64 = 0.75;

/// Per-task progress bookkeeping kept in the registry while a task runs.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    pub last_update: Instant,
    pub last_progress: f64,
    pub last_bytes_done: i64,
    /// Smoothed throughput in MB/s; negative means "not yet known".
    pub network_speed: f64,
}

impl Default for ProgressInfo {
    fn default() -> Self {
        Self {
            last_update: Instant::now(),
            last_progress: 0.0,
            last_bytes_done: 0,
            network_speed: -1.0,
        }
    }
}

/// Fraction complete for a single run, capped below 1.0 so only the final
/// update reports exactly 1.0. `start_byte` accounts for resumed ranges.
pub fn transfer_fraction(bytes_done: i64, start_byte: i64, content_length: i64) -> f64 {
    if content_length <= 0 {
        return 0.0;
    }
    let done = (bytes_done + start_byte) as f64;
    let total = (content_length + start_byte) as f64;
    (done / total).min(0.999)
}

/// Whether a progress update should be emitted now.
///
/// Requires a known content length, a progress delta above
/// [`MIN_PROGRESS_DELTA`], and at least [`MIN_PROGRESS_INTERVAL_MS`] since
/// the last emission.
pub fn should_emit(info: &ProgressInfo, progress: f64, content_length: i64, now: Instant) -> bool {
    content_length > 0
        && progress - info.last_progress > MIN_PROGRESS_DELTA
        && now.duration_since(info.last_update).as_millis() >= MIN_PROGRESS_INTERVAL_MS
}

/// Advance the bookkeeping after an emission: returns the updated info with
/// the EWMA-smoothed network speed (MB/s) folded in.
pub fn advance(info: &ProgressInfo, progress: f64, bytes_done: i64, now: Instant) -> ProgressInfo {
    let dt = now.duration_since(info.last_update).as_secs_f64();
    let speed = if dt > 0.0 {
        let raw = (bytes_done - info.last_bytes_done) as f64 / dt / 1_000_000.0;
        if info.network_speed < 0.0 {
            raw
        } else {
            SPEED_SMOOTHING * info.network_speed + (1.0 - SPEED_SMOOTHING) * raw
        }
    } else {
        info.network_speed
    };
    ProgressInfo {
        last_update: now,
        last_progress: progress,
        last_bytes_done: bytes_done,
        network_speed: speed,
    }
}

/// Estimated milliseconds remaining, or -1000 when unknowable.
pub fn time_remaining_ms(bytes_done: i64, content_length: i64, speed_mbps: f64) -> i64 {
    if content_length <= 0 || speed_mbps <= 0.0 {
        return -1000;
    }
    let remaining = (content_length - bytes_done).max(0) as f64;
    (remaining / (speed_mbps * 1_000_000.0) * 1000.0) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fraction_caps_below_one() {
        assert_eq!(transfer_fraction(0, 0, 100), 0.0);
        assert!((transfer_fraction(50, 0, 100) - 0.5).abs() < 1e-9);
        assert_eq!(transfer_fraction(100, 0, 100), 0.999);
        // Resume: 50 new bytes after a 50-byte start against 50 remaining.
        assert!((transfer_fraction(25, 50, 50) - 0.75).abs() < 1e-9);
        assert_eq!(transfer_fraction(10, 0, 0), 0.0);
    }

    #[test]
    fn emission_gate_requires_delta_and_interval() {
        let t0 = Instant::now();
        let info = ProgressInfo {
            last_update: t0,
            last_progress: 0.10,
            last_bytes_done: 100,
            network_speed: -1.0,
        };
        let later = t0 + Duration::from_millis(600);
        // Delta too small.
        assert!(!should_emit(&info, 0.11, 1000, later));
        // Interval too short.
        assert!(!should_emit(&info, 0.20, 1000, t0 + Duration::from_millis(100)));
        // Unknown content length.
        assert!(!should_emit(&info, 0.20, 0, later));
        assert!(should_emit(&info, 0.20, 1000, later));
    }

    #[test]
    fn speed_smoothing_converges() {
        let t0 = Instant::now();
        let mut info = ProgressInfo {
            last_update: t0,
            last_progress: 0.0,
            last_bytes_done: 0,
            network_speed: -1.0,
        };
        // 1 MB over 1 s -> 1 MB/s on first sample (no smoothing yet).
        info = advance(&info, 0.1, 1_000_000, t0 + Duration::from_secs(1));
        assert!((info.network_speed - 1.0).abs() < 1e-9);
        // Next second at 3 MB/s: EWMA keeps 75% of the old value.
        info = advance(&info, 0.4, 4_000_000, t0 + Duration::from_secs(2));
        assert!((info.network_speed - 1.5).abs() < 1e-9);
    }

    #[test]
    fn time_remaining_sentinel() {
        assert_eq!(time_remaining_ms(0, 0, 1.0), -1000);
        assert_eq!(time_remaining_ms(0, 100, -1.0), -1000);
        // 1 MB remaining at 1 MB/s -> 1000 ms.
        assert_eq!(time_remaining_ms(0, 1_000_000, 1.0), 1000);
    }
}
