/// Which mailbox platform hosts a domain, when we can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostedBy {
    Microsoft,
    Google,
    Apple,
    Yahoo,
    Proton,
}

const MICROSOFT_DOMAINS: &[&str] = &["outlook.com", "hotmail.com", "live.com", "msn.com"];
const GOOGLE_DOMAINS: &[&str] = &["gmail.com", "googlemail.com"];
const APPLE_DOMAINS: &[&str] = &["icloud.com", "me.com", "mac.com"];
const YAHOO_DOMAINS: &[&str] = &["yahoo.com", "ymail.com", "rocketmail.com", "aol.com"];
const PROTON_DOMAINS: &[&str] = &["proton.me", "protonmail.com", "pm.me"];

/// MX hostname suffixes that identify hosted platforms for custom
/// domains.
const MX_PATTERNS: &[(&str, HostedBy)] = &[
    (".mail.protection.outlook.com", HostedBy::Microsoft),
    ("olc.protection.outlook.com", HostedBy::Microsoft),
    ("aspmx.l.google.com", HostedBy::Google),
    ("smtp.google.com", HostedBy::Google),
    (".googlemail.com", HostedBy::Google),
    (".mail.icloud.com", HostedBy::Apple),
    (".yahoodns.net", HostedBy::Yahoo),
    ("mail.protonmail.ch", HostedBy::Proton),
];

/// Identify the hosting platform from the consumer brand domain or,
/// for custom domains, from MX hostname patterns.
pub fn detect_hosting(domain: &str, mx_hosts: &[String]) -> Option<HostedBy> {
    let domain = domain.to_ascii_lowercase();

    for (set, host) in [
        (MICROSOFT_DOMAINS, HostedBy::Microsoft),
        (GOOGLE_DOMAINS, HostedBy::Google),
        (APPLE_DOMAINS, HostedBy::Apple),
        (YAHOO_DOMAINS, HostedBy::Yahoo),
        (PROTON_DOMAINS, HostedBy::Proton),
    ] {
        if set.contains(&domain.as_str()) {
            return Some(host);
        }
    }

    for mx in mx_hosts {
        let mx = mx.to_ascii_lowercase();
        let mx = mx.trim_end_matches('.');
        for (pattern, host) in MX_PATTERNS {
            if mx.ends_with(pattern) {
                return Some(*host);
            }
        }
    }

    None
}

/// Major consumer mailbox hosts block RCPT-based probing; an SMTP
/// error against one of them is expected, not a bad sign.
pub fn is_major_provider(domain: &str, mx_hosts: &[String]) -> bool {
    detect_hosting(domain, mx_hosts).is_some()
}

/// True for the consumer Google domains where a `BadAuthentication`
/// auth outcome still proves the account exists.
pub fn is_consumer_gmail(domain: &str) -> bool {
    GOOGLE_DOMAINS.contains(&domain.to_ascii_lowercase().as_str())
}
