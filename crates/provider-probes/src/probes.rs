use crate::hosting::is_consumer_gmail;
use crate::pacing::Pacer;
use md5::{Digest, Md5};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Upstream endpoints, overridable so tests can stand in for the
/// real services.
#[derive(Clone, Debug)]
pub struct Endpoints {
    pub microsoft: String,
    pub google: String,
    pub apple: String,
    pub gravatar: String,
    pub github: String,
    pub pgp: String,
    pub hibp: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            microsoft: "https://login.microsoftonline.com/common/GetCredentialType".to_string(),
            google: "https://android.clients.google.com/auth".to_string(),
            apple: "https://appleid.apple.com/appleauth/auth/federate".to_string(),
            gravatar: "https://gravatar.com".to_string(),
            github: "https://api.github.com".to_string(),
            pgp: "https://keys.openpgp.org".to_string(),
            hibp: "https://haveibeenpwned.com".to_string(),
        }
    }
}

const USER_AGENT: &str = "Mozilla/5.0 (compatible; mailprobe/0.1)";

pub fn gravatar_hash(email: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(email.trim().to_lowercase().as_bytes());
    hex::encode(hasher.finalize())
}

fn encode(email: &str) -> String {
    utf8_percent_encode(email, NON_ALPHANUMERIC).to_string()
}

#[derive(Deserialize)]
struct CredentialType {
    #[serde(rename = "IfExistsResult")]
    if_exists_result: Option<i64>,
}

#[derive(Deserialize)]
struct Federate {
    #[serde(rename = "hasSWP")]
    has_swp: Option<bool>,
}

#[derive(Deserialize)]
struct UserSearch {
    total_count: Option<i64>,
}

/// HTTP probes against mailbox-provider endpoints. Every probe is
/// tri-state: Some(true) the account exists, Some(false) it does
/// not, None the upstream was inconclusive. Calls to one provider
/// are serialized and spaced to respect its tolerance.
pub struct ProviderProber {
    client: reqwest::Client,
    endpoints: Endpoints,
    timeout: Duration,
    hibp_api_key: Option<String>,
    microsoft_pacer: Pacer,
    google_pacer: Pacer,
    apple_pacer: Pacer,
    gravatar_pacer: Pacer,
    github_pacer: Pacer,
    pgp_pacer: Pacer,
    hibp_pacer: Pacer,
}

impl ProviderProber {
    pub fn new(client: reqwest::Client, timeout: Duration, hibp_api_key: Option<String>) -> Self {
        Self::with_endpoints(client, timeout, hibp_api_key, Endpoints::default())
    }

    pub fn with_endpoints(
        client: reqwest::Client,
        timeout: Duration,
        hibp_api_key: Option<String>,
        endpoints: Endpoints,
    ) -> Self {
        Self {
            client,
            endpoints,
            timeout,
            hibp_api_key,
            microsoft_pacer: Pacer::new(Duration::from_millis(500)),
            google_pacer: Pacer::new(Duration::from_secs(3)),
            apple_pacer: Pacer::new(Duration::from_secs(2)),
            gravatar_pacer: Pacer::new(Duration::from_millis(200)),
            github_pacer: Pacer::new(Duration::from_millis(6500)),
            pgp_pacer: Pacer::new(Duration::from_millis(300)),
            hibp_pacer: Pacer::new(Duration::from_millis(1600)),
        }
    }

    pub fn has_hibp_key(&self) -> bool {
        self.hibp_api_key.is_some()
    }

    /// GetCredentialType reports whether a username resolves to an
    /// account anywhere in the Microsoft cloud.
    pub async fn microsoft(&self, email: &str) -> Option<bool> {
        self.microsoft_pacer.admit().await;

        let response = self
            .client
            .post(&self.endpoints.microsoft)
            .timeout(self.timeout)
            .json(&json!({ "username": email }))
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            return None;
        }

        let body: CredentialType = response.json().await.ok()?;
        match body.if_exists_result {
            Some(0) | Some(5) | Some(6) => Some(true),
            Some(1) => Some(false),
            _ => None,
        }
    }

    /// The Android auth endpoint leaks account existence in its
    /// error strings. `BadAuthentication` is only meaningful for the
    /// consumer domains; Workspace tenants can return it for
    /// non-existent accounts too.
    pub async fn google(&self, email: &str, domain: &str) -> Option<bool> {
        self.google_pacer.admit().await;

        let response = self
            .client
            .post(&self.endpoints.google)
            .timeout(self.timeout)
            .header("user-agent", USER_AGENT)
            .form(&[
                ("accountType", "HOSTED_OR_GOOGLE"),
                ("Email", email),
                ("has_permission", "1"),
                ("add_account", "1"),
                ("EncryptedPasswd", "AFcb4KQyhk"),
                ("service", "ac2dm"),
                ("source", "android"),
                ("device_country", "us"),
                ("operatorCountry", "us"),
                ("lang", "en"),
                ("sdk_version", "21"),
            ])
            .send()
            .await
            .ok()?;

        let body = response.text().await.ok()?;

        if body.contains("NeedsBrowser") || body.contains("DeviceManagementRequiredOrSyncDisabled")
        {
            return Some(true);
        }
        if body.contains("BadAuthentication") {
            return if is_consumer_gmail(domain) {
                Some(true)
            } else {
                None
            };
        }
        if body.contains("INVALID_EMAIL") {
            return Some(false);
        }
        None
    }

    /// The federate endpoint reports Sign in With Apple eligibility
    /// for existing accounts.
    pub async fn apple(&self, email: &str) -> Option<bool> {
        self.apple_pacer.admit().await;

        let response = self
            .client
            .post(&self.endpoints.apple)
            .timeout(self.timeout)
            .header("user-agent", USER_AGENT)
            .json(&json!({ "accountName": email, "rememberMe": false }))
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            return None;
        }

        let body: Federate = response.json().await.ok()?;
        Some(body.has_swp == Some(true))
    }

    pub async fn gravatar(&self, email: &str) -> Option<bool> {
        self.gravatar_pacer.admit().await;

        let url = format!(
            "{}/avatar/{}?d=404",
            self.endpoints.gravatar,
            gravatar_hash(email)
        );
        let response = self
            .client
            .head(&url)
            .timeout(self.timeout)
            .send()
            .await
            .ok()?;

        match response.status().as_u16() {
            200 => Some(true),
            404 => Some(false),
            _ => None,
        }
    }

    pub async fn github(&self, email: &str) -> Option<bool> {
        self.github_pacer.admit().await;

        let url = format!("{}/search/users", self.endpoints.github);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .header("user-agent", USER_AGENT)
            .query(&[("q", format!("{email} in:email"))])
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            return None;
        }

        let body: UserSearch = response.json().await.ok()?;
        match body.total_count {
            Some(count) if count > 0 => Some(true),
            Some(_) => Some(false),
            None => None,
        }
    }

    pub async fn pgp(&self, email: &str) -> Option<bool> {
        self.pgp_pacer.admit().await;

        let url = format!("{}/vks/v1/by-email/{}", self.endpoints.pgp, encode(email));
        let response = self
            .client
            .head(&url)
            .timeout(self.timeout)
            .send()
            .await
            .ok()?;

        match response.status().as_u16() {
            200 => Some(true),
            404 => Some(false),
            _ => None,
        }
    }

    pub async fn hibp(&self, email: &str) -> Option<bool> {
        let api_key = self.hibp_api_key.as_deref()?;
        self.hibp_pacer.admit().await;

        let url = format!(
            "{}/api/v3/breachedaccount/{}?truncateResponse=true",
            self.endpoints.hibp,
            encode(email)
        );
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .header("hibp-api-key", api_key)
            .header("user-agent", USER_AGENT)
            .send()
            .await
            .ok()?;

        match response.status().as_u16() {
            200 => Some(true),
            404 => Some(false),
            _ => None,
        }
    }
}
