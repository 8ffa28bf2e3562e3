//! Clocks.

use crate::error::Errno;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::warn;

static ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);

/// Clock read by [`clock_gettime`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockId {
    /// Never goes backwards; arbitrary origin
    Monotonic,
    /// Wall clock since the Unix epoch
    Realtime,
}

/// Seconds and nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeSpec {
    /// Whole seconds
    pub sec: i64,
    /// Nanoseconds past `sec`
    pub nsec: i32,
}

impl From<Duration> for TimeSpec {
    fn from(d: Duration) -> Self {
        Self {
            sec: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
            nsec: d.subsec_nanos() as i32,
        }
    }
}

/// Seconds and microseconds since the Unix epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeVal {
    /// Whole seconds
    pub sec: i64,
    /// Microseconds past `sec`
    pub usec: i32,
}

/// Nanoseconds from an arbitrary monotonic origin
pub fn hrtime() -> u64 {
    u64::try_from(ORIGIN.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

fn since_epoch() -> Result<Duration, Errno> {
    SystemTime::now().duration_since(UNIX_EPOCH).map_err(|err| {
        warn!(%err, "System clock is before the Unix epoch");
        Errno::Unknown
    })
}

/// Read `clock`
pub fn clock_gettime(clock: ClockId) -> Result<TimeSpec, Errno> {
    match clock {
        ClockId::Monotonic => Ok(Duration::from_nanos(hrtime()).into()),
        ClockId::Realtime => since_epoch().map(TimeSpec::from),
    }
}

/// Wall clock with microsecond resolution
pub fn gettimeofday() -> Result<TimeVal, Errno> {
    let d = since_epoch()?;
    Ok(TimeVal {
        sec: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        usec: d.subsec_micros() as i32,
    })
}

/// Block the calling thread for `ms` milliseconds
pub fn sleep(ms: u32) {
    std::thread::sleep(Duration::from_millis(u64::from(ms)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hrtime_is_monotonic_across_sleep() {
        let before = hrtime();
        sleep(5);
        let after = hrtime();
        assert!(after - before >= 5_000_000);

        let a = clock_gettime(ClockId::Monotonic).unwrap();
        let b = clock_gettime(ClockId::Monotonic).unwrap();
        assert!(b >= a);
        assert!((0..1_000_000_000).contains(&b.nsec));
    }

    #[test]
    fn test_realtime_agrees_with_gettimeofday() {
        let spec = clock_gettime(ClockId::Realtime).unwrap();
        let val = gettimeofday().unwrap();
        // 2020-01-01T00:00:00Z
        assert!(spec.sec > 1_577_836_800);
        assert!((val.sec - spec.sec).abs() <= 1);
        assert!((0..1_000_000).contains(&val.usec));
    }

    #[test]
    fn test_timespec_from_duration() {
        let spec = TimeSpec::from(Duration::new(3, 250));
        assert_eq!(spec, TimeSpec { sec: 3, nsec: 250 });
        assert_eq!(
            serde_json::to_string(&ClockId::Monotonic).unwrap(),
            "\"monotonic\""
        );
    }
}
