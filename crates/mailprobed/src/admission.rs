//! Request admission: the layered gates every verification request
//! passes before any outbound work starts. Failure at any layer
//! short-circuits with a specific refusal.

use crate::config::Config;
use std::time::Duration;
use thiserror::Error;
use throttle::{ConcurrencyGate, DailyBudget, Error as ThrottleError, Lease, MinuteWindow};

const GLOBAL_KEY: &str = "global";

/// Who is asking: an authenticated agent, or a bare client IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Agent(String),
    Ip(String),
}

impl Identity {
    pub fn key(&self) -> String {
        match self {
            Self::Agent(uid) => format!("agent:{uid}"),
            Self::Ip(ip) => format!("ip:{ip}"),
        }
    }

    pub fn is_agent(&self) -> bool {
        matches!(self, Self::Agent(_))
    }
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("batch of {got} exceeds the maximum of {max} addresses")]
    BatchTooLarge { got: usize, max: usize },
    #[error("rate limit exceeded")]
    RateLimited { retry_after: Duration },
    #[error("daily email quota exhausted")]
    DailyExhausted { retry_after: Duration },
    #[error("service is at its daily capacity")]
    GlobalExhausted,
    #[error("too many concurrent requests")]
    TooManyConcurrent,
}

/// A granted admission. Dropping it releases the concurrency slot.
#[derive(Debug)]
pub struct Admission {
    pub granted: usize,
    pub used_today: u64,
    pub remaining: u64,
    pub requests_today: u64,
    #[allow(dead_code)]
    lease: Lease,
}

struct ClassLimits {
    rpm: u64,
    daily: u64,
    concurrent: u64,
}

pub struct Gates {
    rpm: MinuteWindow,
    daily: DailyBudget,
    requests: DailyBudget,
    global: DailyBudget,
    concurrency: ConcurrencyGate,
    bounce_rpm: MinuteWindow,
    config: Config,
}

impl Gates {
    pub fn new(config: Config) -> Self {
        Self {
            rpm: MinuteWindow::new(),
            daily: DailyBudget::new(),
            requests: DailyBudget::new(),
            global: DailyBudget::new(),
            concurrency: ConcurrencyGate::new(),
            bounce_rpm: MinuteWindow::new(),
            config,
        }
    }

    fn limits(&self, identity: &Identity) -> ClassLimits {
        if identity.is_agent() {
            ClassLimits {
                rpm: self.config.agent_rpm,
                daily: self.config.agent_daily_emails,
                concurrent: self.config.agent_max_concurrent,
            }
        } else {
            ClassLimits {
                rpm: self.config.ip_rpm,
                daily: self.config.ip_daily_emails,
                concurrent: self.config.ip_max_concurrent,
            }
        }
    }

    pub fn daily_limit(&self, identity: &Identity) -> u64 {
        self.limits(identity).daily
    }

    pub fn used_today(&self, identity: &Identity) -> u64 {
        self.daily.used_today(&identity.key())
    }

    /// Run the admission layers in order. The successful result
    /// carries how many of the requested addresses may actually be
    /// verified; the rest were shed against an almost-empty budget.
    pub fn admit(&self, identity: &Identity, requested: usize) -> Result<Admission, AdmissionError> {
        let limits = self.limits(identity);
        let key = identity.key();

        self.rpm
            .check(&key, limits.rpm)
            .map_err(|err| match err {
                ThrottleError::TooManyRequests(retry_after) => {
                    AdmissionError::RateLimited { retry_after }
                }
                _ => AdmissionError::RateLimited {
                    retry_after: Duration::from_secs(60),
                },
            })?;

        if requested > self.config.max_batch_size {
            return Err(AdmissionError::BatchTooLarge {
                got: requested,
                max: self.config.max_batch_size,
            });
        }

        let reservation = self
            .daily
            .reserve(&key, requested as u64, limits.daily)
            .map_err(|err| match err {
                ThrottleError::DailyExhausted(retry_after) => {
                    AdmissionError::DailyExhausted { retry_after }
                }
                _ => AdmissionError::DailyExhausted {
                    retry_after: Duration::from_secs(60),
                },
            })?;

        let global = match self.global.reserve(
            GLOBAL_KEY,
            reservation.granted,
            self.config.global_daily_emails,
        ) {
            Ok(global) => global,
            Err(_) => {
                self.daily.release(&key, reservation.granted);
                return Err(AdmissionError::GlobalExhausted);
            }
        };

        // The ceiling may grant less than the identity budget did;
        // hand the difference back.
        let granted = global.granted;
        if granted < reservation.granted {
            self.daily.release(&key, reservation.granted - granted);
        }

        let lease = match self.concurrency.acquire(&key, limits.concurrent) {
            Ok(lease) => lease,
            Err(_) => {
                self.daily.release(&key, granted);
                self.global.release(GLOBAL_KEY, granted);
                return Err(AdmissionError::TooManyConcurrent);
            }
        };

        let requests_today = self
            .requests
            .reserve(&key, 1, u64::MAX)
            .map(|r| r.used_today)
            .unwrap_or(0);

        Ok(Admission {
            granted: granted as usize,
            used_today: self.daily.used_today(&key),
            remaining: limits.daily.saturating_sub(self.daily.used_today(&key)),
            requests_today,
            lease,
        })
    }

    /// The bounce endpoint has its own small per-IP window.
    pub fn admit_bounce(&self, ip: &str) -> Result<(), AdmissionError> {
        self.bounce_rpm
            .check(&format!("bounce:{ip}"), self.config.bounce_rpm)
            .map_err(|err| match err {
                ThrottleError::TooManyRequests(retry_after) => {
                    AdmissionError::RateLimited { retry_after }
                }
                _ => AdmissionError::RateLimited {
                    retry_after: Duration::from_secs(60),
                },
            })
    }

    pub fn sweep(&self) {
        self.rpm.sweep();
        self.bounce_rpm.sweep();
        self.daily.sweep();
        self.requests.sweep();
        self.global.sweep();
    }
}
