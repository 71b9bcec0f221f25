use crate::Error;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);
const MAX_PENALTY: Duration = Duration::from_secs(3600);

struct WindowEntry {
    window_start: Instant,
    count: u64,
    violations: u32,
    /// UTC day the violations counter belongs to. Violations reset
    /// together with the daily budgets, not with the minute window.
    day: NaiveDate,
}

/// Fixed one-minute request windows keyed by identity.
///
/// A key that exceeds its limit accrues a violation; the retry-after
/// it is told doubles with each consecutive violation, capped at one
/// hour.
pub struct MinuteWindow {
    entries: Mutex<HashMap<String, WindowEntry>>,
}

impl Default for MinuteWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl MinuteWindow {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request against `key`. Ok when the key is still
    /// within `limit` for the current window.
    pub fn check(&self, key: &str, limit: u64) -> Result<(), Error> {
        self.check_at(key, limit, Instant::now(), Utc::now().date_naive())
    }

    fn check_at(
        &self,
        key: &str,
        limit: u64,
        now: Instant,
        today: NaiveDate,
    ) -> Result<(), Error> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(|| WindowEntry {
            window_start: now,
            count: 0,
            violations: 0,
            day: today,
        });

        if entry.day != today {
            entry.violations = 0;
            entry.day = today;
        }

        if now.duration_since(entry.window_start) >= WINDOW {
            entry.window_start = now;
            entry.count = 0;
        }

        if entry.count >= limit {
            entry.violations = entry.violations.saturating_add(1);
            let penalty = WINDOW
                .checked_mul(1u32 << (entry.violations - 1).min(6))
                .unwrap_or(MAX_PENALTY)
                .min(MAX_PENALTY);
            return Err(Error::TooManyRequests(penalty));
        }

        entry.count += 1;
        Ok(())
    }

    /// Drop windows that have lapsed and carry no violations worth
    /// remembering for the rest of the day.
    pub fn sweep(&self) {
        let now = Instant::now();
        let today = Utc::now().date_naive();
        self.entries.lock().retain(|_, entry| {
            let lapsed = now.duration_since(entry.window_start) >= WINDOW;
            !lapsed || (entry.violations > 0 && entry.day == today)
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    #[test]
    fn within_limit() {
        let w = MinuteWindow::new();
        let start = Instant::now();
        for _ in 0..5 {
            w.check_at("ip:10.0.0.1", 5, start, day()).unwrap();
        }
        assert_eq!(
            w.check_at("ip:10.0.0.1", 5, start, day()),
            Err(Error::TooManyRequests(Duration::from_secs(60)))
        );
    }

    #[test]
    fn window_rolls_over() {
        let w = MinuteWindow::new();
        let start = Instant::now();
        w.check_at("k", 1, start, day()).unwrap();
        assert!(w.check_at("k", 1, start, day()).is_err());
        // A fresh window admits again
        w.check_at("k", 1, start + Duration::from_secs(61), day())
            .unwrap();
    }

    #[test]
    fn penalty_doubles_and_caps() {
        let w = MinuteWindow::new();
        let start = Instant::now();
        w.check_at("k", 1, start, day()).unwrap();

        let expect = [60u64, 120, 240, 480, 960, 1920, 3600, 3600];
        for secs in expect {
            match w.check_at("k", 1, start, day()) {
                Err(Error::TooManyRequests(d)) => assert_eq!(d, Duration::from_secs(secs)),
                other => panic!("expected throttle, got {other:?}"),
            }
        }
    }

    #[test]
    fn violations_reset_on_new_day() {
        let w = MinuteWindow::new();
        let start = Instant::now();
        w.check_at("k", 1, start, day()).unwrap();
        assert!(w.check_at("k", 1, start, day()).is_err());
        assert!(w.check_at("k", 1, start, day()).is_err());

        let tomorrow = day().succ_opt().unwrap();
        let later = start + Duration::from_secs(61);
        w.check_at("k", 1, later, tomorrow).unwrap();
        // First violation of the new day starts the penalty ladder over
        assert_eq!(
            w.check_at("k", 1, later, tomorrow),
            Err(Error::TooManyRequests(Duration::from_secs(60)))
        );
    }

    #[test]
    fn budget_is_monotonic_within_window() {
        // Successful checks only ever consume budget; a concurrent
        // observer never sees the count go backwards mid-window.
        let w = MinuteWindow::new();
        let start = Instant::now();
        let mut admitted = 0;
        for _ in 0..10 {
            if w
                .check_at("k", 7, start + Duration::from_secs(1), day())
                .is_ok()
            {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 7);
    }

    #[test]
    fn sweep_keeps_violators() {
        let w = MinuteWindow::new();
        let today = Utc::now().date_naive();
        let old = Instant::now() - Duration::from_secs(120);
        w.check_at("clean", 5, old, today).unwrap();
        w.check_at("dirty", 1, old, today).unwrap();
        assert!(w.check_at("dirty", 1, old, today).is_err());

        w.sweep();
        assert_eq!(w.len(), 1);
    }
}
