//! Monotonic wall-clock time source producing (seconds, nanoseconds) pairs.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A (seconds, nanoseconds) timestamp, used both for the monotonic clock
/// that drives round deadlines and for the wall-clock time stamped onto
/// each minidump and `CONF` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl Timestamp {
    pub fn now_wall_clock() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            seconds: now.as_secs(),
            nanoseconds: now.subsec_nanos(),
        }
    }
}

/// Monotonic instant used for round deadlines; never observed by the signal
/// handler, only by the controller.
pub fn monotonic_now() -> Instant {
    Instant::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_clock_timestamp_is_plausible() {
        let ts = Timestamp::now_wall_clock();
        // Anything after 2020-01-01 and a valid nanosecond fraction.
        assert!(ts.seconds > 1_577_836_800);
        assert!(ts.nanoseconds < 1_000_000_000);
    }
}
