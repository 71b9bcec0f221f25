//! SMTP mailbox probing.
//!
//! One TCP session per candidate MX host walks the deterministic
//! command sequence banner, EHLO, opportunistic STARTTLS, MAIL FROM,
//! RCPT to the real mailbox, RCPT to a random mailbox, QUIT. The
//! paired RCPT outcomes distinguish a mailbox that exists from a
//! server that accepts anything.

use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

mod behavior;
mod client;
mod tls;

pub use behavior::{HostStats, ServerBehavior};
pub use client::{ClientError, Command, Response, SmtpClient, SmtpTimeouts};

/// Response phrases that indicate the recipient itself is unknown,
/// as opposed to a policy rejection of the probing client. A 5xx on
/// the real recipient only counts as proof of absence when one of
/// these matches.
const USER_UNKNOWN_PHRASES: &[&str] = &[
    "5.1.1",
    "user unknown",
    "does not exist",
    "mailbox not found",
    "no such user",
    "undeliverable",
    "unknown user",
    "invalid recipient",
    "recipient not found",
    "address rejected",
    "mailbox unavailable",
    "user not found",
];

/// How many MX hosts to try before giving up.
const MAX_HOSTS: usize = 2;

// Sessions to the same exchanger are serialized so that a batch full
// of one domain does not open parallel connections to its MX.
static HOST_LOCKS: LazyLock<DashMap<String, Arc<tokio::sync::Mutex<()>>>> =
    LazyLock::new(DashMap::new);

fn host_lock(host: &str) -> Arc<tokio::sync::Mutex<()>> {
    HOST_LOCKS
        .entry(host.to_string())
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SmtpDisposition {
    Accepted,
    Rejected,
    CatchAll,
    Greylisted,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmtpProbeResult {
    pub disposition: SmtpDisposition,
    pub code: Option<u16>,
    pub host: Option<String>,
    pub banner: Option<String>,
    /// Round trip of the RCPT for the real mailbox.
    pub real_latency: Option<Duration>,
    /// Round trip of the RCPT for the random mailbox.
    pub random_latency: Option<Duration>,
    /// Set when an accepted session was re-classified because the
    /// host historically accepts nearly everything.
    pub historical_catch_all: bool,
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub helo_domain: String,
    pub mail_from: String,
    pub port: u16,
    pub timeouts: SmtpTimeouts,
    pub greylist_retry_delay: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            helo_domain: "probe.invalid".to_string(),
            mail_from: "verify@probe.invalid".to_string(),
            port: 25,
            timeouts: SmtpTimeouts::default(),
            greylist_retry_delay: Duration::from_secs(5),
        }
    }
}

/// A local part that no sane mail system has a mailbox for. High
/// entropy maximizes the chance that a non-catch-all server rejects
/// it.
pub fn random_local_part() -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let rand: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("xvrf-{ts}-{rand}-nonexist")
}

struct SessionOutcome {
    disposition: SmtpDisposition,
    code: Option<u16>,
    banner: Option<String>,
    real_latency: Option<Duration>,
    random_latency: Option<Duration>,
}

impl SessionOutcome {
    fn error(code: Option<u16>, banner: Option<String>) -> Self {
        Self {
            disposition: SmtpDisposition::Error,
            code,
            banner,
            real_latency: None,
            random_latency: None,
        }
    }
}

fn is_user_unknown(content: &str) -> bool {
    let lowered = content.to_ascii_lowercase();
    USER_UNKNOWN_PHRASES
        .iter()
        .any(|phrase| lowered.contains(phrase))
}

/// Split an optional `:port` suffix off a host entry; used by tests
/// and by deployments that front port 25 elsewhere.
fn host_and_port(entry: &str, default_port: u16) -> (String, u16) {
    if let Some((host, port)) = entry.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            return (host.to_string(), port);
        }
    }
    (entry.to_string(), default_port)
}

/// Probe whether `email` is deliverable by walking the first MX
/// hosts in preference order. The first host that yields a verdict
/// other than `Error` wins.
pub async fn probe_mailbox(
    cfg: &ProbeConfig,
    behavior: &ServerBehavior,
    hosts: &[String],
    email: &str,
    domain: &str,
) -> SmtpProbeResult {
    let mut last_host = None;
    let mut last_outcome = None;

    for entry in hosts.iter().take(MAX_HOSTS) {
        let (host, port) = host_and_port(entry, cfg.port);
        let lock = host_lock(&host);
        let _guard = lock.lock().await;

        let mut outcome = run_session(cfg, &host, port, email, domain).await;

        if outcome.disposition == SmtpDisposition::Greylisted {
            // Standard greylisting defers first contact; one delayed
            // retry on the same host usually gets through.
            tokio::time::sleep(cfg.greylist_retry_delay).await;
            let retry = run_session(cfg, &host, port, email, domain).await;
            if retry.disposition != SmtpDisposition::Error {
                outcome = retry;
            }
        }

        behavior.record(&host, &outcome.disposition);

        if outcome.disposition != SmtpDisposition::Error {
            let mut result = SmtpProbeResult {
                disposition: outcome.disposition,
                code: outcome.code,
                host: Some(host.clone()),
                banner: outcome.banner,
                real_latency: outcome.real_latency,
                random_latency: outcome.random_latency,
                historical_catch_all: false,
            };
            if result.disposition == SmtpDisposition::Accepted
                && behavior.is_suspected_catch_all(&host)
            {
                result.disposition = SmtpDisposition::CatchAll;
                result.historical_catch_all = true;
            }
            return result;
        }

        last_host = Some(host);
        last_outcome = Some(outcome);
    }

    let outcome = last_outcome.unwrap_or_else(|| SessionOutcome::error(None, None));
    SmtpProbeResult {
        disposition: SmtpDisposition::Error,
        code: outcome.code,
        host: last_host,
        banner: outcome.banner,
        real_latency: None,
        random_latency: None,
        historical_catch_all: false,
    }
}

async fn run_session(
    cfg: &ProbeConfig,
    host: &str,
    port: u16,
    email: &str,
    domain: &str,
) -> SessionOutcome {
    let mut client = match SmtpClient::connect(host, port, cfg.timeouts).await {
        Ok(client) => client,
        Err(err) => {
            tracing::debug!("connect {host}:{port}: {err:#}");
            return SessionOutcome::error(None, None);
        }
    };

    let banner = match client
        .read_response(None, cfg.timeouts.banner_timeout)
        .await
    {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!("banner from {host}: {err:#}");
            return SessionOutcome::error(None, None);
        }
    };
    if banner.code != 220 {
        return SessionOutcome::error(Some(banner.code), Some(banner.content));
    }
    let banner_text = banner.content;

    match client.ehlo(&cfg.helo_domain).await {
        Ok(response) if response.code == 250 => {}
        Ok(response) => {
            return SessionOutcome::error(Some(response.code), Some(banner_text));
        }
        Err(err) => {
            tracing::debug!("EHLO to {host}: {err:#}");
            return SessionOutcome::error(None, Some(banner_text));
        }
    }

    if client.has_capability("STARTTLS") {
        match client.starttls().await {
            Ok(true) => {
                // Capabilities must be re-learned on the encrypted
                // channel before MAIL.
                match client.ehlo(&cfg.helo_domain).await {
                    Ok(response) if response.code == 250 => {}
                    Ok(response) => {
                        return SessionOutcome::error(Some(response.code), Some(banner_text));
                    }
                    Err(err) => {
                        tracing::debug!("EHLO after STARTTLS to {host}: {err:#}");
                        return SessionOutcome::error(None, Some(banner_text));
                    }
                }
            }
            // Refused: continue the plaintext session
            Ok(false) => {}
            Err(err) => {
                tracing::debug!("STARTTLS with {host}: {err:#}");
                return SessionOutcome::error(None, Some(banner_text));
            }
        }
    }

    match client
        .send_command(&Command::MailFrom(cfg.mail_from.clone()))
        .await
    {
        Ok(response) if response.is_success() => {}
        Ok(response) => {
            client.quit().await;
            return SessionOutcome::error(Some(response.code), Some(banner_text));
        }
        Err(err) => {
            tracing::debug!("MAIL FROM to {host}: {err:#}");
            return SessionOutcome::error(None, Some(banner_text));
        }
    }

    let started = Instant::now();
    let real = match client
        .send_command(&Command::RcptTo(email.to_string()))
        .await
    {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!("RCPT to {host}: {err:#}");
            return SessionOutcome::error(None, Some(banner_text));
        }
    };
    let real_latency = started.elapsed();

    if real.is_transient() {
        client.quit().await;
        return SessionOutcome {
            disposition: SmtpDisposition::Greylisted,
            code: Some(real.code),
            banner: Some(banner_text),
            real_latency: Some(real_latency),
            random_latency: None,
        };
    }

    if real.is_permanent() {
        client.quit().await;
        let disposition = if is_user_unknown(&real.content) {
            SmtpDisposition::Rejected
        } else {
            // Policy rejections say nothing about the mailbox
            SmtpDisposition::Error
        };
        return SessionOutcome {
            disposition,
            code: Some(real.code),
            banner: Some(banner_text),
            real_latency: Some(real_latency),
            random_latency: None,
        };
    }

    if !real.is_success() {
        client.quit().await;
        return SessionOutcome::error(Some(real.code), Some(banner_text));
    }

    // The real mailbox was accepted; a second probe for a mailbox
    // that cannot exist tells us whether that means anything.
    let random = format!("{}@{domain}", random_local_part());
    let started = Instant::now();
    let random_response = match client.send_command(&Command::RcptTo(random)).await {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!("random RCPT to {host}: {err:#}");
            return SessionOutcome::error(None, Some(banner_text));
        }
    };
    let random_latency = started.elapsed();

    client.quit().await;

    let disposition = if random_response.is_success() {
        SmtpDisposition::CatchAll
    } else {
        SmtpDisposition::Accepted
    };

    SessionOutcome {
        disposition,
        code: Some(real.code),
        banner: Some(banner_text),
        real_latency: Some(real_latency),
        random_latency: Some(random_latency),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct ScriptSession {
        banner: &'static str,
        steps: Vec<(&'static str, &'static str)>,
    }

    async fn serve_scripts(sessions: Vec<ScriptSession>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for session in sessions {
                let (mut sock, _) = listener.accept().await.unwrap();
                sock.write_all(session.banner.as_bytes()).await.unwrap();
                let mut pending = String::new();
                let mut buf = vec![0u8; 1024];
                'steps: for (expect, reply) in session.steps {
                    loop {
                        if let Some(pos) = pending.find("\r\n") {
                            let line: String = pending.drain(..pos + 2).collect();
                            assert!(
                                line.starts_with(expect),
                                "expected {expect:?}, got {line:?}"
                            );
                            sock.write_all(reply.as_bytes()).await.unwrap();
                            continue 'steps;
                        }
                        let n = sock.read(&mut buf).await.unwrap();
                        if n == 0 {
                            return;
                        }
                        pending.push_str(std::str::from_utf8(&buf[..n]).unwrap());
                    }
                }
            }
        });
        addr
    }

    fn test_config() -> ProbeConfig {
        ProbeConfig {
            helo_domain: "probe.test".to_string(),
            mail_from: "verify@probe.test".to_string(),
            port: 25,
            timeouts: SmtpTimeouts::uniform(Duration::from_secs(5)),
            greylist_retry_delay: Duration::from_millis(10),
        }
    }

    fn hosts_for(addr: SocketAddr) -> Vec<String> {
        vec![format!("127.0.0.1:{}", addr.port())]
    }

    #[tokio::test]
    async fn accepted_when_random_is_rejected() {
        let addr = serve_scripts(vec![ScriptSession {
            banner: "220 mx.example.test ESMTP\r\n",
            steps: vec![
                ("EHLO", "250-mx.example.test\r\n250 PIPELINING\r\n"),
                ("MAIL FROM:<verify@probe.test>", "250 2.1.0 Ok\r\n"),
                ("RCPT TO:<alice@example.test>", "250 2.1.5 Ok\r\n"),
                ("RCPT TO:<xvrf-", "550 5.1.1 no such user\r\n"),
                ("QUIT", "221 2.0.0 Bye\r\n"),
            ],
        }])
        .await;

        let behavior = ServerBehavior::new();
        let result = probe_mailbox(
            &test_config(),
            &behavior,
            &hosts_for(addr),
            "alice@example.test",
            "example.test",
        )
        .await;

        assert_eq!(result.disposition, SmtpDisposition::Accepted);
        assert_eq!(result.code, Some(250));
        assert!(result.real_latency.is_some());
        assert!(result.random_latency.is_some());
        assert_eq!(result.banner.as_deref(), Some("mx.example.test ESMTP"));
    }

    #[tokio::test]
    async fn catch_all_when_both_are_accepted() {
        let addr = serve_scripts(vec![ScriptSession {
            banner: "220 mx.example.test ESMTP\r\n",
            steps: vec![
                ("EHLO", "250 mx.example.test\r\n"),
                ("MAIL FROM:", "250 Ok\r\n"),
                ("RCPT TO:<bob@example.test>", "250 Ok\r\n"),
                ("RCPT TO:<xvrf-", "250 Ok\r\n"),
                ("QUIT", "221 Bye\r\n"),
            ],
        }])
        .await;

        let behavior = ServerBehavior::new();
        let result = probe_mailbox(
            &test_config(),
            &behavior,
            &hosts_for(addr),
            "bob@example.test",
            "example.test",
        )
        .await;

        assert_eq!(result.disposition, SmtpDisposition::CatchAll);
    }

    #[tokio::test]
    async fn greylisted_then_retry_succeeds() {
        let addr = serve_scripts(vec![
            ScriptSession {
                banner: "220 mx ESMTP\r\n",
                steps: vec![
                    ("EHLO", "250 mx\r\n"),
                    ("MAIL FROM:", "250 Ok\r\n"),
                    ("RCPT TO:", "450 4.7.1 greylisted, try again later\r\n"),
                    ("QUIT", "221 Bye\r\n"),
                ],
            },
            ScriptSession {
                banner: "220 mx ESMTP\r\n",
                steps: vec![
                    ("EHLO", "250 mx\r\n"),
                    ("MAIL FROM:", "250 Ok\r\n"),
                    ("RCPT TO:<carol@example.test>", "250 Ok\r\n"),
                    ("RCPT TO:<xvrf-", "550 no such user\r\n"),
                    ("QUIT", "221 Bye\r\n"),
                ],
            },
        ])
        .await;

        let behavior = ServerBehavior::new();
        let result = probe_mailbox(
            &test_config(),
            &behavior,
            &hosts_for(addr),
            "carol@example.test",
            "example.test",
        )
        .await;

        assert_eq!(result.disposition, SmtpDisposition::Accepted);
    }

    #[tokio::test]
    async fn greylisted_when_retry_also_defers() {
        let session = || ScriptSession {
            banner: "220 mx ESMTP\r\n",
            steps: vec![
                ("EHLO", "250 mx\r\n"),
                ("MAIL FROM:", "250 Ok\r\n"),
                ("RCPT TO:", "451 4.7.1 try again later\r\n"),
                ("QUIT", "221 Bye\r\n"),
            ],
        };
        let addr = serve_scripts(vec![session(), session()]).await;

        let behavior = ServerBehavior::new();
        let result = probe_mailbox(
            &test_config(),
            &behavior,
            &hosts_for(addr),
            "dave@example.test",
            "example.test",
        )
        .await;

        assert_eq!(result.disposition, SmtpDisposition::Greylisted);
        assert_eq!(result.code, Some(451));
    }

    #[tokio::test]
    async fn user_unknown_phrase_means_rejected() {
        let addr = serve_scripts(vec![ScriptSession {
            banner: "220 mx ESMTP\r\n",
            steps: vec![
                ("EHLO", "250 mx\r\n"),
                ("MAIL FROM:", "250 Ok\r\n"),
                ("RCPT TO:", "550 5.1.1 mailbox not found\r\n"),
                ("QUIT", "221 Bye\r\n"),
            ],
        }])
        .await;

        let behavior = ServerBehavior::new();
        let result = probe_mailbox(
            &test_config(),
            &behavior,
            &hosts_for(addr),
            "nobody@example.test",
            "example.test",
        )
        .await;

        assert_eq!(result.disposition, SmtpDisposition::Rejected);
        assert_eq!(result.code, Some(550));
    }

    #[tokio::test]
    async fn policy_rejection_is_not_proof_of_absence() {
        let addr = serve_scripts(vec![ScriptSession {
            banner: "220 mx ESMTP\r\n",
            steps: vec![
                ("EHLO", "250 mx\r\n"),
                ("MAIL FROM:", "250 Ok\r\n"),
                ("RCPT TO:", "550 5.7.1 service refused due to sender reputation\r\n"),
                ("QUIT", "221 Bye\r\n"),
            ],
        }])
        .await;

        let behavior = ServerBehavior::new();
        let result = probe_mailbox(
            &test_config(),
            &behavior,
            &hosts_for(addr),
            "eve@example.test",
            "example.test",
        )
        .await;

        assert_eq!(result.disposition, SmtpDisposition::Error);
    }

    #[tokio::test]
    async fn starttls_refusal_falls_back_to_plaintext() {
        let addr = serve_scripts(vec![ScriptSession {
            banner: "220 mx ESMTP\r\n",
            steps: vec![
                ("EHLO", "250-mx\r\n250-STARTTLS\r\n250 PIPELINING\r\n"),
                ("STARTTLS", "454 4.7.0 TLS not available due to temporary reason\r\n"),
                ("MAIL FROM:", "250 Ok\r\n"),
                ("RCPT TO:<frank@example.test>", "250 Ok\r\n"),
                ("RCPT TO:<xvrf-", "550 no such user\r\n"),
                ("QUIT", "221 Bye\r\n"),
            ],
        }])
        .await;

        let behavior = ServerBehavior::new();
        let result = probe_mailbox(
            &test_config(),
            &behavior,
            &hosts_for(addr),
            "frank@example.test",
            "example.test",
        )
        .await;

        assert_eq!(result.disposition, SmtpDisposition::Accepted);
    }

    #[tokio::test]
    async fn second_host_wins_after_first_errors() {
        let bad = serve_scripts(vec![ScriptSession {
            banner: "554 go away\r\n",
            steps: vec![],
        }])
        .await;
        let good = serve_scripts(vec![ScriptSession {
            banner: "220 mx2 ESMTP\r\n",
            steps: vec![
                ("EHLO", "250 mx2\r\n"),
                ("MAIL FROM:", "250 Ok\r\n"),
                ("RCPT TO:<grace@example.test>", "250 Ok\r\n"),
                ("RCPT TO:<xvrf-", "550 no such user\r\n"),
                ("QUIT", "221 Bye\r\n"),
            ],
        }])
        .await;

        let behavior = ServerBehavior::new();
        let hosts = vec![
            format!("127.0.0.1:{}", bad.port()),
            format!("127.0.0.1:{}", good.port()),
        ];
        let result = probe_mailbox(
            &test_config(),
            &behavior,
            &hosts,
            "grace@example.test",
            "example.test",
        )
        .await;

        assert_eq!(result.disposition, SmtpDisposition::Accepted);
        assert_eq!(result.host.as_deref(), Some("127.0.0.1"));
    }

    #[tokio::test]
    async fn only_first_two_hosts_are_tried() {
        // Two dead listeners followed by one that would accept; the
        // third host must never be contacted.
        let dead1 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port1 = dead1.local_addr().unwrap().port();
        drop(dead1);
        let dead2 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port2 = dead2.local_addr().unwrap().port();
        drop(dead2);

        let good = serve_scripts(vec![ScriptSession {
            banner: "220 mx3 ESMTP\r\n",
            steps: vec![],
        }])
        .await;

        let behavior = ServerBehavior::new();
        let hosts = vec![
            format!("127.0.0.1:{dead_port1}"),
            format!("127.0.0.1:{dead_port2}"),
            format!("127.0.0.1:{}", good.port()),
        ];
        let result = probe_mailbox(
            &test_config(),
            &behavior,
            &hosts,
            "henry@example.test",
            "example.test",
        )
        .await;

        assert_eq!(result.disposition, SmtpDisposition::Error);
    }

    #[tokio::test]
    async fn historical_catch_all_downgrades_accepted() {
        let behavior = ServerBehavior::new();
        for _ in 0..12 {
            behavior.record("127.0.0.1", &SmtpDisposition::Accepted);
        }

        let addr = serve_scripts(vec![ScriptSession {
            banner: "220 mx ESMTP\r\n",
            steps: vec![
                ("EHLO", "250 mx\r\n"),
                ("MAIL FROM:", "250 Ok\r\n"),
                ("RCPT TO:<iris@example.test>", "250 Ok\r\n"),
                ("RCPT TO:<xvrf-", "550 no such user\r\n"),
                ("QUIT", "221 Bye\r\n"),
            ],
        }])
        .await;

        let result = probe_mailbox(
            &test_config(),
            &behavior,
            &hosts_for(addr),
            "iris@example.test",
            "example.test",
        )
        .await;

        assert_eq!(result.disposition, SmtpDisposition::CatchAll);
        assert!(result.historical_catch_all);
    }

    #[test]
    fn random_local_shape() {
        let local = random_local_part();
        assert!(local.starts_with("xvrf-"));
        assert!(local.ends_with("-nonexist"));
        assert!(local.len() > 20);
    }

    #[test]
    fn phrase_classification() {
        assert!(is_user_unknown("5.1.1 User unknown"));
        assert!(is_user_unknown("The mailbox NOT FOUND on this server"));
        assert!(is_user_unknown("address rejected: no such account"));
        assert!(!is_user_unknown("rejected by policy"));
        assert!(!is_user_unknown("greylisted, come back later"));
    }
}
