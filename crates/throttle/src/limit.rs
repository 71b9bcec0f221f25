use crate::Error;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
struct Counters {
    counts: Mutex<HashMap<String, u64>>,
}

/// Per-key concurrency leases. Acquisition never waits: a key at its
/// limit is refused immediately and the caller surfaces the refusal.
#[derive(Clone)]
pub struct ConcurrencyGate {
    inner: Arc<Counters>,
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrencyGate {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Counters {
                counts: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn acquire(&self, key: &str, limit: u64) -> Result<Lease, Error> {
        let mut counts = self.inner.counts.lock();
        let count = counts.entry(key.to_string()).or_insert(0);
        if *count >= limit {
            return Err(Error::TooManyLeases);
        }
        *count += 1;
        Ok(Lease {
            gate: Arc::clone(&self.inner),
            key: key.to_string(),
        })
    }

    pub fn current(&self, key: &str) -> u64 {
        self.inner.counts.lock().get(key).copied().unwrap_or(0)
    }
}

/// Held for the duration of a request; the slot is returned on Drop
/// so refused or panicking requests cannot leak capacity.
#[derive(Debug)]
pub struct Lease {
    gate: Arc<Counters>,
    key: String,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut counts = self.gate.counts.lock();
        if let Some(count) = counts.get_mut(&self.key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&self.key);
            }
        }
    }
}
