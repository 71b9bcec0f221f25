use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Serializes calls to one upstream and enforces a minimum interval
/// between them. Holding the lock across the sleep is what makes the
/// queue single-consumer: callers line up on the mutex and each one
/// stamps the clock before letting the next through.
pub struct Pacer {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    pub async fn admit(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let due = prev + self.min_interval;
            let now = Instant::now();
            if due > now {
                tokio::time::sleep(due - now).await;
            }
        }
        *last = Some(Instant::now());
    }
}
