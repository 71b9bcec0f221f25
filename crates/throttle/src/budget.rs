use crate::Error;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

struct BudgetEntry {
    day: NaiveDate,
    used: u64,
}

/// Outcome of a successful reservation. `granted` may be smaller
/// than the requested quantity when the budget is nearly exhausted.
#[derive(Debug, PartialEq, Serialize)]
pub struct Reservation {
    pub granted: u64,
    pub used_today: u64,
    pub remaining: u64,
}

/// Per-key daily quantity budgets, reset at the next UTC midnight.
pub struct DailyBudget {
    entries: Mutex<HashMap<String, BudgetEntry>>,
}

impl Default for DailyBudget {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn until_utc_midnight(now: DateTime<Utc>) -> Duration {
    let next = now
        .date_naive()
        .succ_opt()
        .expect("date overflow")
        .and_hms_opt(0, 0, 0)
        .expect("midnight exists")
        .and_utc();
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

impl DailyBudget {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically reserve up to `requested` units for `key` against a
    /// daily `cap`. Grants `min(requested, remaining)`; a fully
    /// exhausted budget is an error carrying the time until the
    /// budget resets.
    pub fn reserve(&self, key: &str, requested: u64, cap: u64) -> Result<Reservation, Error> {
        self.reserve_at(key, requested, cap, Utc::now())
    }

    fn reserve_at(
        &self,
        key: &str,
        requested: u64,
        cap: u64,
        now: DateTime<Utc>,
    ) -> Result<Reservation, Error> {
        let today = now.date_naive();
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| BudgetEntry { day: today, used: 0 });

        if entry.day != today {
            entry.day = today;
            entry.used = 0;
        }

        let remaining = cap.saturating_sub(entry.used);
        if remaining == 0 {
            return Err(Error::DailyExhausted(until_utc_midnight(now)));
        }

        let granted = requested.min(remaining);
        entry.used += granted;

        Ok(Reservation {
            granted,
            used_today: entry.used,
            remaining: cap.saturating_sub(entry.used),
        })
    }

    /// Units consumed today by `key`.
    pub fn used_today(&self, key: &str) -> u64 {
        self.used_today_at(key, Utc::now().date_naive())
    }

    fn used_today_at(&self, key: &str, today: NaiveDate) -> u64 {
        let entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.day == today => entry.used,
            _ => 0,
        }
    }

    /// Return unused units from an earlier reservation, e.g. when a
    /// request is refused by a later admission layer.
    pub fn release(&self, key: &str, units: u64) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.used = entry.used.saturating_sub(units);
        }
    }

    /// Drop buckets from previous days.
    pub fn sweep(&self) {
        let today = Utc::now().date_naive();
        self.entries.lock().retain(|_, entry| entry.day == today);
    }
}
