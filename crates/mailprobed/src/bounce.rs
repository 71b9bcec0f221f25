use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

const RETENTION: Duration = Duration::from_secs(30 * 24 * 3600);

/// Crowd-sourced bounce reports. Only a hash of the address is kept,
/// along with the set of reporting sources, so a report can raise a
/// flag without the address itself being persisted anywhere.
pub struct BounceReports {
    entries: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    reporters: HashSet<String>,
    last_report: Instant,
}

fn email_hash(email: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(email.trim().to_lowercase().as_bytes());
    hex::encode(hasher.finalize())
}

impl Default for BounceReports {
    fn default() -> Self {
        Self::new()
    }
}

impl BounceReports {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, email: &str, reporter: &str) {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(email_hash(email))
            .or_insert_with(|| Entry {
                reporters: HashSet::new(),
                last_report: Instant::now(),
            });
        entry.reporters.insert(reporter.to_string());
        entry.last_report = Instant::now();
    }

    /// Distinct sources that have reported this address as bouncing.
    pub fn unique_reporters(&self, email: &str) -> usize {
        self.entries
            .lock()
            .get(&email_hash(email))
            .map(|entry| entry.reporters.len())
            .unwrap_or(0)
    }

    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries
            .lock()
            .retain(|_, entry| now.duration_since(entry.last_report) < RETENTION);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counts_unique_reporters() {
        let reports = BounceReports::new();
        reports.record("bad@example.com", "10.0.0.1");
        reports.record("bad@example.com", "10.0.0.1");
        reports.record("bad@example.com", "10.0.0.2");
        assert_eq!(reports.unique_reporters("bad@example.com"), 2);
        assert_eq!(reports.unique_reporters("other@example.com"), 0);
    }

    #[test]
    fn case_folded_before_hashing() {
        let reports = BounceReports::new();
        reports.record("  Bad@Example.COM ", "10.0.0.1");
        assert_eq!(reports.unique_reporters("bad@example.com"), 1);
    }
}
