use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Longest timeout, SLA, or hold-open window accepted from config or a DAG
/// definition: ten years.
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 3600;

/// Convert configured seconds to a signed duration, clamped to
/// [`MAX_DURATION_SECS`] so deadline arithmetic cannot overflow.
pub fn seconds(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

/// Wall-clock source for SLA deadlines, backoff timestamps, and ledger records.
///
/// Production code injects [`SystemClock`]; tests inject [`ManualClock`] so
/// multi-hour SLAs can elapse instantly.
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|p| *p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::hours(12));
        assert_eq!(clock.now(), start + Duration::hours(12));
    }

    #[test]
    fn seconds_clamps_instead_of_wrapping() {
        assert_eq!(seconds(90), Duration::seconds(90));
        assert_eq!(seconds(u64::MAX), Duration::seconds(MAX_DURATION_SECS as i64));
        let far = Utc::now() + seconds(u64::MAX);
        assert!(far > Utc::now());
    }
}
