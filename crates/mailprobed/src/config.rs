use serde::Deserialize;
use std::time::Duration;

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Runtime tunables, all overridable through the environment.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub max_batch_size: usize,

    pub dns_cache_ttl_secs: u64,
    pub dns_timeout_secs: u64,
    pub dns_concurrency: usize,

    pub smtp_timeout_secs: u64,
    pub smtp_port: u16,
    pub smtp_helo_domain: String,
    pub smtp_mail_from: String,
    pub greylist_retry_secs: u64,

    pub http_timeout_secs: u64,
    pub hibp_api_key: Option<String>,

    pub ip_rpm: u64,
    pub ip_daily_emails: u64,
    pub ip_max_concurrent: u64,
    pub agent_rpm: u64,
    pub agent_daily_emails: u64,
    pub agent_max_concurrent: u64,
    pub global_daily_emails: u64,
    pub bounce_rpm: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
            dns_cache_ttl_secs: 600,
            dns_timeout_secs: 5,
            dns_concurrency: 20,
            smtp_timeout_secs: 10,
            smtp_port: 25,
            smtp_helo_domain: "verifier.mailprobe.dev".to_string(),
            smtp_mail_from: "verify@mailprobe.dev".to_string(),
            greylist_retry_secs: 5,
            http_timeout_secs: 10,
            hibp_api_key: None,
            ip_rpm: 10,
            ip_daily_emails: 200,
            ip_max_concurrent: 2,
            agent_rpm: 60,
            agent_daily_emails: 5000,
            agent_max_concurrent: 10,
            global_daily_emails: 50_000,
            bounce_rpm: 5,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_batch_size: env_u64("MAILPROBE_MAX_BATCH", default.max_batch_size as u64) as usize,
            dns_cache_ttl_secs: env_u64("MAILPROBE_DNS_CACHE_TTL", default.dns_cache_ttl_secs),
            dns_timeout_secs: env_u64("MAILPROBE_DNS_TIMEOUT", default.dns_timeout_secs),
            dns_concurrency: env_u64("MAILPROBE_DNS_CONCURRENCY", default.dns_concurrency as u64)
                as usize,
            smtp_timeout_secs: env_u64("MAILPROBE_SMTP_TIMEOUT", default.smtp_timeout_secs),
            smtp_port: env_u64("MAILPROBE_SMTP_PORT", default.smtp_port as u64) as u16,
            smtp_helo_domain: env_string("MAILPROBE_SMTP_HELO", &default.smtp_helo_domain),
            smtp_mail_from: env_string("MAILPROBE_SMTP_MAIL_FROM", &default.smtp_mail_from),
            greylist_retry_secs: env_u64("MAILPROBE_GREYLIST_RETRY", default.greylist_retry_secs),
            http_timeout_secs: env_u64("MAILPROBE_HTTP_TIMEOUT", default.http_timeout_secs),
            hibp_api_key: std::env::var("MAILPROBE_HIBP_API_KEY").ok().filter(|k| !k.is_empty()),
            ip_rpm: env_u64("MAILPROBE_IP_RPM", default.ip_rpm),
            ip_daily_emails: env_u64("MAILPROBE_IP_DAILY", default.ip_daily_emails),
            ip_max_concurrent: env_u64("MAILPROBE_IP_CONCURRENT", default.ip_max_concurrent),
            agent_rpm: env_u64("MAILPROBE_AGENT_RPM", default.agent_rpm),
            agent_daily_emails: env_u64("MAILPROBE_AGENT_DAILY", default.agent_daily_emails),
            agent_max_concurrent: env_u64(
                "MAILPROBE_AGENT_CONCURRENT",
                default.agent_max_concurrent,
            ),
            global_daily_emails: env_u64("MAILPROBE_GLOBAL_DAILY", default.global_daily_emails),
            bounce_rpm: env_u64("MAILPROBE_BOUNCE_RPM", default.bounce_rpm),
        }
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs)
    }

    pub fn smtp_timeout(&self) -> Duration {
        Duration::from_secs(self.smtp_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn greylist_retry(&self) -> Duration {
        Duration::from_secs(self.greylist_retry_secs)
    }
}
