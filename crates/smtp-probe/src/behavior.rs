use crate::SmtpDisposition;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const MIN_SAMPLE: u64 = 10;
const CATCH_ALL_RATE: f64 = 0.9;
const IDLE_EVICTION: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Default, Clone)]
pub struct HostStats {
    pub total: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub catch_all: u64,
}

struct HostEntry {
    stats: HostStats,
    last_seen: Instant,
}

/// Rolling per-MX-host outcome counters, kept across requests.
///
/// A host that has accepted nearly every recipient we have ever asked
/// it about is almost certainly a catch-all, even when a single
/// session's random-recipient probe happened to be rejected.
pub struct ServerBehavior {
    hosts: Mutex<HashMap<String, HostEntry>>,
}

impl Default for ServerBehavior {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBehavior {
    pub fn new() -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, host: &str, disposition: &SmtpDisposition) {
        let mut hosts = self.hosts.lock();
        let entry = hosts.entry(host.to_string()).or_insert_with(|| HostEntry {
            stats: HostStats::default(),
            last_seen: Instant::now(),
        });
        entry.last_seen = Instant::now();
        entry.stats.total += 1;
        match disposition {
            SmtpDisposition::Accepted => entry.stats.accepted += 1,
            SmtpDisposition::Rejected => entry.stats.rejected += 1,
            SmtpDisposition::CatchAll => entry.stats.catch_all += 1,
            SmtpDisposition::Greylisted | SmtpDisposition::Error => {}
        }
    }

    /// True once the host has a meaningful sample and its accept rate
    /// is suspiciously high.
    pub fn is_suspected_catch_all(&self, host: &str) -> bool {
        let hosts = self.hosts.lock();
        match hosts.get(host) {
            Some(entry) if entry.stats.total >= MIN_SAMPLE => {
                let accepting = (entry.stats.accepted + entry.stats.catch_all) as f64;
                accepting / entry.stats.total as f64 > CATCH_ALL_RATE
            }
            _ => false,
        }
    }

    pub fn stats(&self, host: &str) -> Option<HostStats> {
        self.hosts.lock().get(host).map(|entry| entry.stats.clone())
    }

    pub fn sweep(&self) {
        let now = Instant::now();
        self.hosts
            .lock()
            .retain(|_, entry| now.duration_since(entry.last_seen) < IDLE_EVICTION);
    }
}
