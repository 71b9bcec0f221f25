//! The batch pipeline: parse, coalesce per-domain lookups, probe,
//! and fuse. Every address that clears admission produces a result,
//! even when every collector came back empty-handed.

use crate::bounce::BounceReports;
use crate::config::Config;
use crate::email::{self, EmailAddress};
use crate::fusion::{fuse, Evidence, Status};
use crate::pattern::{analyze_local, bulk_anomalies};
use crate::typo::suggest_domain;
use crate::wordlists::{is_disposable_domain, is_role_account};
use dns_probe::{collect_signals, dnsbl_listed, lookup_mx, DomainSignals, MxLookup, Resolver};
use provider_probes::{detect_hosting, is_major_provider, HostedBy, ProviderChecks, ProviderProber};
use serde::Serialize;
use smtp_probe::{
    probe_mailbox, ProbeConfig, ServerBehavior, SmtpDisposition, SmtpProbeResult, SmtpTimeouts,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{OnceCell, Semaphore};
use web_intel::{IntelCollector, WebIntel};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmtpSummary {
    pub verdict: SmtpDisposition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub real_latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random_latency_ms: Option<u64>,
}

impl From<&SmtpProbeResult> for SmtpSummary {
    fn from(result: &SmtpProbeResult) -> Self {
        Self {
            verdict: result.disposition,
            code: result.code,
            host: result.host.clone(),
            real_latency_ms: result.real_latency.map(|d| d.as_millis() as u64),
            random_latency_ms: result.random_latency.map(|d| d.as_millis() as u64),
        }
    }
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainIntelReport {
    pub website_alive: Option<bool>,
    pub is_parked: Option<bool>,
    pub domain_age_days: Option<i64>,
    pub blacklisted: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResult {
    pub email: String,
    pub domain: String,
    pub mx: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp: Option<SmtpSummary>,
    pub status: Status,
    pub confidence: u8,
    pub notes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_email: Option<String>,
    pub provider_checks: ProviderChecks,
    pub domain_intel: DomainIntelReport,
}

/// Everything learned about one domain, computed once per batch no
/// matter how many addresses share it.
struct DomainData {
    mx: Option<MxLookup>,
    signals: DomainSignals,
    intel: WebIntel,
    blacklisted: Option<bool>,
}

type DomainJobs = HashMap<String, Arc<OnceCell<DomainData>>>;

pub struct Engine {
    resolver: Arc<dyn Resolver>,
    behavior: ServerBehavior,
    prober: ProviderProber,
    intel: IntelCollector,
    pub bounces: BounceReports,
    probe_cfg: ProbeConfig,
    outbound: Arc<Semaphore>,
}

impl Engine {
    pub fn new(
        config: Config,
        resolver: Arc<dyn Resolver>,
        prober: ProviderProber,
        intel: IntelCollector,
    ) -> Self {
        let probe_cfg = ProbeConfig {
            helo_domain: config.smtp_helo_domain.clone(),
            mail_from: config.smtp_mail_from.clone(),
            port: config.smtp_port,
            timeouts: SmtpTimeouts::uniform(config.smtp_timeout()),
            greylist_retry_delay: config.greylist_retry(),
        };
        let outbound = Arc::new(Semaphore::new(config.dns_concurrency));

        Self {
            resolver,
            behavior: ServerBehavior::new(),
            prober,
            intel,
            bounces: BounceReports::new(),
            probe_cfg,
            outbound,
        }
    }

    pub fn sweep(&self) {
        self.behavior.sweep();
        self.bounces.sweep();
    }

    pub async fn verify_batch(&self, raw_emails: &[String]) -> Vec<VerifyResult> {
        let parsed: Vec<Option<EmailAddress>> =
            raw_emails.iter().map(|raw| email::parse(raw)).collect();

        let anomalies = bulk_anomalies(&parsed);

        let mut jobs: DomainJobs = HashMap::new();
        for email in parsed.iter().flatten() {
            jobs.entry(email.domain.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()));
        }
        let jobs = Arc::new(jobs);

        let batch_size = raw_emails.len();
        let tasks = parsed.iter().enumerate().map(|(index, maybe)| {
            let jobs = Arc::clone(&jobs);
            let anomalous = anomalies.contains(&index);
            async move {
                self.verify_one(&raw_emails[index], maybe.as_ref(), &jobs, anomalous, batch_size)
                    .await
            }
        });

        futures::future::join_all(tasks).await
    }

    async fn verify_one(
        &self,
        raw: &str,
        parsed: Option<&EmailAddress>,
        jobs: &DomainJobs,
        bulk_anomaly: bool,
        batch_size: usize,
    ) -> VerifyResult {
        let Some(email) = parsed else {
            let verdict = fuse(&Evidence::default());
            return VerifyResult {
                email: email::normalize(raw),
                domain: String::new(),
                mx: None,
                smtp: None,
                status: verdict.status,
                confidence: verdict.confidence,
                notes: verdict.notes,
                suggested_email: None,
                provider_checks: ProviderChecks::default(),
                domain_intel: DomainIntelReport::default(),
            };
        };

        let _permit = self.outbound.acquire().await;

        // Unreachable fallback: a missing entry must not take the
        // whole batch down
        let fallback;
        let cell = match jobs.get(&email.domain) {
            Some(cell) => cell,
            None => {
                fallback = Arc::new(OnceCell::new());
                &fallback
            }
        };
        let data = cell.get_or_init(|| self.domain_data(&email.domain)).await;

        let mut evidence = Evidence {
            syntax_valid: true,
            disposable: is_disposable_domain(&email.domain),
            role_account: is_role_account(&email.local),
            analysis: Some(analyze_local(&email.local)),
            bulk_anomaly,
            suggested_domain: suggest_domain(&email.domain).map(String::from),
            bounce_reporters: self.bounces.unique_reporters(&email.address),
            spf: data.signals.spf,
            dmarc: data.signals.dmarc,
            website_alive: data.intel.website_alive,
            is_parked: data.intel.is_parked,
            domain_age_days: data.intel.domain_age_days,
            blacklisted: data.blacklisted,
            ..Evidence::default()
        };

        match &data.mx {
            None => {
                evidence.mx = None;
            }
            Some(mx) if !mx.has_mx => {
                evidence.mx = Some(false);
            }
            Some(mx) => {
                evidence.mx = Some(true);
                evidence.via_implicit_mx = mx.via_implicit_mx;
                evidence.major_provider = is_major_provider(&email.domain, &mx.hosts);

                let smtp = probe_mailbox(
                    &self.probe_cfg,
                    &self.behavior,
                    &mx.hosts,
                    &email.address,
                    &email.domain,
                )
                .await;

                evidence.providers = self
                    .provider_checks(email, &mx.hosts, Some(&smtp), batch_size)
                    .await;
                evidence.smtp = Some(smtp);
            }
        }

        let verdict = fuse(&evidence);

        VerifyResult {
            email: email.address.clone(),
            domain: email.domain.clone(),
            mx: evidence.mx,
            smtp: evidence.smtp.as_ref().map(SmtpSummary::from),
            status: verdict.status,
            confidence: verdict.confidence,
            notes: verdict.notes,
            suggested_email: evidence
                .suggested_domain
                .as_ref()
                .map(|canonical| format!("{}@{canonical}", email.local)),
            provider_checks: evidence.providers,
            domain_intel: DomainIntelReport {
                website_alive: evidence.website_alive,
                is_parked: evidence.is_parked,
                domain_age_days: evidence.domain_age_days,
                blacklisted: evidence.blacklisted,
            },
        }
    }

    async fn domain_data(&self, domain: &str) -> DomainData {
        let mx = lookup_mx(self.resolver.as_ref(), domain).await.ok();

        let (signals, intel) = tokio::join!(
            collect_signals(self.resolver.as_ref(), domain),
            self.intel.gather(domain)
        );

        let blacklisted = match &mx {
            Some(lookup) if lookup.has_mx => self.first_host_blacklisted(lookup).await,
            _ => None,
        };

        DomainData {
            mx,
            signals,
            intel,
            blacklisted,
        }
    }

    async fn first_host_blacklisted(&self, mx: &MxLookup) -> Option<bool> {
        let host = mx.hosts.first()?;
        // Host entries may carry a :port override; strip it for the
        // address lookup
        let host = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);

        let ip = if let Ok(ip) = host.parse::<IpAddr>() {
            ip
        } else {
            self.resolver
                .resolve_ip(host)
                .await
                .ok()?
                .into_iter()
                .find(|ip| ip.is_ipv4())?
        };

        dnsbl_listed(self.resolver.as_ref(), ip).await
    }

    /// Which provider probes run depends on the SMTP outcome: the
    /// hosting platforms act as a second opinion when SMTP was
    /// inconclusive, and as a veto check on a rejection.
    async fn provider_checks(
        &self,
        email: &EmailAddress,
        mx_hosts: &[String],
        smtp: Option<&SmtpProbeResult>,
        batch_size: usize,
    ) -> ProviderChecks {
        let mut checks = ProviderChecks::default();
        let disposition = smtp.map(|s| s.disposition);
        let inconclusive = matches!(disposition, None | Some(SmtpDisposition::Error));
        let rejected = disposition == Some(SmtpDisposition::Rejected);

        if inconclusive || rejected {
            match detect_hosting(&email.domain, mx_hosts) {
                Some(HostedBy::Microsoft) => {
                    checks.microsoft = self.prober.microsoft(&email.address).await;
                }
                Some(HostedBy::Google) => {
                    checks.google = self.prober.google(&email.address, &email.domain).await;
                }
                Some(HostedBy::Apple) => {
                    checks.apple = self.prober.apple(&email.address).await;
                }
                // No account probe exists for the other platforms
                Some(_) => {}
                None if inconclusive => {
                    // Hosting unknown: the address could still be a
                    // Microsoft/Google/Apple account on a custom domain
                    let (microsoft, google, apple) = tokio::join!(
                        self.prober.microsoft(&email.address),
                        self.prober.google(&email.address, &email.domain),
                        self.prober.apple(&email.address)
                    );
                    checks.microsoft = microsoft;
                    checks.google = google;
                    checks.apple = apple;
                }
                None => {}
            }
        }

        if inconclusive {
            let (gravatar, pgp) = tokio::join!(
                self.prober.gravatar(&email.address),
                self.prober.pgp(&email.address)
            );
            checks.gravatar = gravatar;
            checks.pgp = pgp;

            // GitHub's search quota is too tight for bulk traffic
            if batch_size == 1 {
                checks.github = self.prober.github(&email.address).await;
            }
            if self.prober.has_hibp_key() {
                checks.hibp = self.prober.hibp(&email.address).await;
            }
        }

        checks
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use dns_probe::{Answer, DnsError, Name, RecordType, TestResolver};
    use parking_lot::Mutex;
    use provider_probes::Endpoints;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Counts queries per (name, rrtype) so tests can prove lookup
    /// coalescing.
    struct CountingResolver {
        inner: TestResolver,
        counts: Mutex<HashMap<(String, RecordType), usize>>,
    }

    impl CountingResolver {
        fn new(inner: TestResolver) -> Self {
            Self {
                inner,
                counts: Mutex::new(HashMap::new()),
            }
        }

        fn count(&self, name: &str, rrtype: RecordType) -> usize {
            self.counts
                .lock()
                .get(&(name.to_string(), rrtype))
                .copied()
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl Resolver for CountingResolver {
        async fn resolve(&self, name: Name, rrtype: RecordType) -> Result<Answer, DnsError> {
            *self
                .counts
                .lock()
                .entry((name.to_ascii(), rrtype))
                .or_insert(0) += 1;
            self.inner.resolve(name, rrtype).await
        }
    }

    fn dead_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    fn dead_endpoints() -> Endpoints {
        let base = format!("http://127.0.0.1:{}", dead_port());
        Endpoints {
            microsoft: base.clone(),
            google: base.clone(),
            apple: base.clone(),
            gravatar: base.clone(),
            github: base.clone(),
            pgp: base.clone(),
            hibp: base,
        }
    }

    fn test_engine(resolver: Arc<dyn Resolver>, smtp_port: u16) -> Engine {
        let config = Config {
            smtp_port,
            smtp_timeout_secs: 2,
            greylist_retry_secs: 0,
            http_timeout_secs: 1,
            ..Config::default()
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        let prober = ProviderProber::with_endpoints(
            client.clone(),
            Duration::from_millis(500),
            None,
            dead_endpoints(),
        );
        let intel = IntelCollector::new(client, Duration::from_millis(500))
            .with_rdap_base(format!("http://127.0.0.1:{}", dead_port()));
        Engine::new(config, resolver, prober, intel)
    }

    async fn accepting_smtp_server(real_rcpt: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    sock.write_all(b"220 mx ESMTP\r\n").await.ok();
                    let mut buf = [0u8; 1024];
                    let mut pending = String::new();
                    loop {
                        let Ok(n) = sock.read(&mut buf).await else {
                            return;
                        };
                        if n == 0 {
                            return;
                        }
                        pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                        while let Some(pos) = pending.find("\r\n") {
                            let line: String = pending.drain(..pos + 2).collect();
                            let reply: &[u8] = if line.starts_with("EHLO") {
                                b"250 mx\r\n"
                            } else if line.starts_with("MAIL FROM:") {
                                b"250 Ok\r\n"
                            } else if line.starts_with(&format!("RCPT TO:<{real_rcpt}")) {
                                b"250 Ok\r\n"
                            } else if line.starts_with("RCPT TO:") {
                                b"550 5.1.1 no such user\r\n"
                            } else if line.starts_with("QUIT") {
                                sock.write_all(b"221 Bye\r\n").await.ok();
                                return;
                            } else {
                                b"250 Ok\r\n"
                            };
                            if sock.write_all(reply).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn accepted_mailbox_end_to_end() {
        let smtp_port = accepting_smtp_server("alice@scenario-accept.test").await;
        let resolver = TestResolver::default()
            .with_zone(
                r#"
$ORIGIN scenario-accept.test.
scenario-accept.test. 600 IN MX 10 127.0.0.1.
"#,
            )
            .with_txt("scenario-accept.test", "v=spf1 -all")
            .with_txt("_dmarc.scenario-accept.test", "v=DMARC1; p=none;");

        let engine = test_engine(Arc::new(resolver), smtp_port);
        let results = engine
            .verify_batch(&["Alice@scenario-accept.test".to_string()])
            .await;

        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.email, "alice@scenario-accept.test");
        assert_eq!(result.mx, Some(true));
        assert_eq!(result.status, Status::Valid);
        assert!(result.confidence >= 85, "got {}", result.confidence);
        let smtp = result.smtp.as_ref().unwrap();
        assert_eq!(smtp.verdict, SmtpDisposition::Accepted);
    }

    #[tokio::test]
    async fn no_mx_domain_is_invalid() {
        let resolver = TestResolver::default();
        let engine = test_engine(Arc::new(resolver), dead_port());
        let results = engine
            .verify_batch(&["user@scenario-nomx.test".to_string()])
            .await;

        assert_eq!(results[0].status, Status::Invalid);
        assert_eq!(results[0].mx, Some(false));
        assert!(results[0].confidence <= 5);
        assert!(results[0].smtp.is_none());
    }

    #[tokio::test]
    async fn empty_string_is_invalid_syntax() {
        let resolver = TestResolver::default();
        let engine = test_engine(Arc::new(resolver), dead_port());
        let results = engine.verify_batch(&["".to_string()]).await;

        assert_eq!(results[0].status, Status::Invalid);
        assert_eq!(results[0].confidence, 0);
        assert_eq!(results[0].notes, vec!["Invalid syntax".to_string()]);
    }

    #[tokio::test]
    async fn typo_domain_gets_suggestion() {
        let resolver = TestResolver::default();
        let engine = test_engine(Arc::new(resolver), dead_port());
        let results = engine.verify_batch(&["user@gmial.com".to_string()]).await;

        assert_eq!(
            results[0].suggested_email.as_deref(),
            Some("user@gmail.com")
        );
        assert!(results[0]
            .notes
            .contains(&"Did you mean gmail.com?".to_string()));
    }

    #[tokio::test]
    async fn domain_lookups_are_coalesced_per_batch() {
        let resolver = Arc::new(CountingResolver::new(
            TestResolver::default().with_zone(
                r#"
$ORIGIN scenario-coalesce.test.
scenario-coalesce.test. 600 IN MX 10 127.0.0.1.
"#,
            ),
        ));
        let smtp_port = accepting_smtp_server("a@scenario-coalesce.test").await;
        let engine = test_engine(resolver.clone(), smtp_port);

        let batch: Vec<String> = ["a", "b", "c", "d"]
            .iter()
            .map(|local| format!("{local}@scenario-coalesce.test"))
            .collect();
        let results = engine.verify_batch(&batch).await;
        assert_eq!(results.len(), 4);

        assert_eq!(
            resolver.count("scenario-coalesce.test.", RecordType::MX),
            1,
            "MX resolved once for the whole batch"
        );
        assert_eq!(
            resolver.count("_dmarc.scenario-coalesce.test.", RecordType::TXT),
            1,
            "DMARC probed once for the whole batch"
        );
    }

    #[tokio::test]
    async fn every_admitted_address_gets_a_result() {
        let resolver = TestResolver::default();
        let engine = test_engine(Arc::new(resolver), dead_port());
        let batch = vec![
            "".to_string(),
            "not-an-email".to_string(),
            "user@scenario-missing.test".to_string(),
        ];
        let results = engine.verify_batch(&batch).await;
        assert_eq!(results.len(), 3);
    }
}
