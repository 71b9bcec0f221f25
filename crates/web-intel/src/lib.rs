//! Web-derived domain intelligence: whether the domain serves a live
//! website, whether that website is a parking page, and how old the
//! registration is according to RDAP. All collectors are best-effort;
//! a timeout or error degrades to "no signal".

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::LazyLock;
use std::time::Duration;
use ttl_cache::TtlCache;

/// Phrases that betray a registrar parking page. Matched against the
/// case-folded start of the response body.
const PARKED_PHRASES: &[&str] = &[
    "buy this domain",
    "this domain is for sale",
    "domain is for sale",
    "purchase this domain",
    "this domain is parked",
    "domain parking",
    "parked free",
    "sedoparking",
    "this webpage was generated by the domain owner",
    "get this domain",
    "domain may be for sale",
];

/// Only the leading slice of the body is scanned.
const BODY_SCAN_LIMIT: usize = 10 * 1024;

static INTEL_CACHE: LazyLock<TtlCache<String, WebIntel>> =
    LazyLock::new(|| TtlCache::new("web_intel"));

const INTEL_CACHE_TTL: Duration = Duration::from_secs(600);

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WebIntel {
    pub website_alive: Option<bool>,
    pub is_parked: Option<bool>,
    pub domain_age_days: Option<i64>,
}

#[derive(Deserialize)]
struct RdapResponse {
    #[serde(default)]
    events: Vec<RdapEvent>,
}

#[derive(Deserialize)]
struct RdapEvent {
    #[serde(rename = "eventAction")]
    event_action: String,
    #[serde(rename = "eventDate")]
    event_date: Option<String>,
}

pub fn looks_parked(body: &str) -> bool {
    let lowered: String = body
        .chars()
        .take(BODY_SCAN_LIMIT)
        .collect::<String>()
        .to_lowercase();
    PARKED_PHRASES
        .iter()
        .any(|phrase| lowered.contains(phrase))
}

pub struct IntelCollector {
    client: reqwest::Client,
    timeout: Duration,
    rdap_base: String,
}

impl IntelCollector {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            rdap_base: "https://rdap.org".to_string(),
        }
    }

    pub fn with_rdap_base(mut self, base: impl Into<String>) -> Self {
        self.rdap_base = base.into();
        self
    }

    /// Gather website and registration-age intel for a domain, served
    /// from the process-wide cache when fresh.
    pub async fn gather(&self, domain: &str) -> WebIntel {
        if let Some(cached) = INTEL_CACHE.get(domain) {
            return cached;
        }

        let (website, age) = tokio::join!(self.check_website(domain), self.domain_age_days(domain));

        let intel = WebIntel {
            website_alive: website.map(|(alive, _)| alive),
            is_parked: website.map(|(_, parked)| parked),
            domain_age_days: age,
        };

        INTEL_CACHE.insert(domain.to_string(), intel.clone(), INTEL_CACHE_TTL);
        intel
    }

    /// (alive, parked). Alive means the GET (redirects included)
    /// landed on a 2xx.
    pub async fn check_website(&self, domain: &str) -> Option<(bool, bool)> {
        let url = format!("http://{domain}");
        let response = match self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!("website check {url}: {err:#}");
                return None;
            }
        };

        if !response.status().is_success() {
            return Some((false, false));
        }

        // Pull at most the scan window; parking pages put their
        // pitch right at the top.
        let mut body = Vec::new();
        let mut response = response;
        while body.len() < BODY_SCAN_LIMIT {
            match response.chunk().await {
                Ok(Some(chunk)) => body.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!("website body {url}: {err:#}");
                    break;
                }
            }
        }
        body.truncate(BODY_SCAN_LIMIT);

        let parked = looks_parked(&String::from_utf8_lossy(&body));
        Some((true, parked))
    }

    /// Whole days since the RDAP registration event.
    pub async fn domain_age_days(&self, domain: &str) -> Option<i64> {
        let url = format!("{}/domain/{domain}", self.rdap_base);
        let response = match self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!("rdap {url}: {err:#}");
                return None;
            }
        };

        if !response.status().is_success() {
            return None;
        }

        let rdap: RdapResponse = match response.json().await {
            Ok(rdap) => rdap,
            Err(err) => {
                tracing::debug!("rdap parse {url}: {err:#}");
                return None;
            }
        };

        let registered = rdap
            .events
            .iter()
            .find(|event| event.event_action == "registration")
            .and_then(|event| event.event_date.as_deref())?;

        let registered = DateTime::parse_from_rfc3339(registered).ok()?;
        Some((Utc::now() - registered.with_timezone(&Utc)).num_days())
    }
}
