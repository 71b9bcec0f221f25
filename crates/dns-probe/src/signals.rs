use crate::resolver::{DnsError, Resolver};
use crate::{fully_qualify, query};
use hickory_resolver::proto::rr::RecordType;
use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;
use ttl_cache::TtlCache;

/// Selector labels probed under `_domainkey`. These cover the common
/// hosted-mail and ESP defaults.
const DKIM_SELECTORS: &[&str] = &[
    "default",
    "google",
    "selector1",
    "selector2",
    "k1",
    "k2",
    "s1",
    "s2",
    "dkim",
    "mail",
    "smtp",
    "mandrill",
    "zoho",
];

pub const DNSBL_ZONES: &[&str] = &["zen.spamhaus.org", "bl.spamcop.net", "b.barracudacentral.org"];

/// Caches domain name to discovered DKIM selectors
static DKIM_CACHE: LazyLock<TtlCache<String, Vec<String>>> =
    LazyLock::new(|| TtlCache::new("dns_probe_dkim"));

const DKIM_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Authentication and policy records published by a domain. `None`
/// means the probe could not complete, not that the record is absent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DomainSignals {
    pub spf: Option<bool>,
    pub dmarc: Option<bool>,
    pub dkim_selectors: Vec<String>,
    pub mta_sts: Option<bool>,
    pub bimi: Option<bool>,
}

async fn txt_begins_with(
    resolver: &dyn Resolver,
    name: &str,
    prefix: &str,
) -> Result<bool, DnsError> {
    let name = fully_qualify(name)?;
    let answer = query(resolver, name, RecordType::TXT).await?;
    Ok(answer.as_txt().iter().any(|txt| txt.starts_with(prefix)))
}

/// Gather SPF, DMARC, MTA-STS and BIMI presence plus the DKIM
/// selector scan in one pass. Individual probe failures degrade to
/// `None` rather than failing the whole collection.
pub async fn collect_signals(resolver: &dyn Resolver, domain: &str) -> DomainSignals {
    let dmarc_name = format!("_dmarc.{domain}");
    let mta_sts_name = format!("_mta-sts.{domain}");
    let bimi_name = format!("_bimi.{domain}");
    let (spf, dmarc, mta_sts, bimi, dkim) = tokio::join!(
        txt_begins_with(resolver, domain, "v=spf1"),
        txt_begins_with(resolver, &dmarc_name, "v=DMARC1"),
        txt_begins_with(resolver, &mta_sts_name, "v=STSv1"),
        txt_begins_with(resolver, &bimi_name, "v=BIMI1"),
        dkim_selectors(resolver, domain),
    );

    DomainSignals {
        spf: spf.ok(),
        dmarc: dmarc.ok(),
        mta_sts: mta_sts.ok(),
        bimi: bimi.ok(),
        dkim_selectors: dkim,
    }
}

/// Scan the well-known selector list for published DKIM keys. A
/// selector counts as present when any TXT record exists under it.
pub async fn dkim_selectors(resolver: &dyn Resolver, domain: &str) -> Vec<String> {
    if let Some(cached) = DKIM_CACHE.get(domain) {
        return cached;
    }

    let probes = DKIM_SELECTORS.iter().map(|selector| async move {
        let name = format!("{selector}._domainkey.{domain}");
        match fully_qualify(&name) {
            Ok(name) => match query(resolver, name, RecordType::TXT).await {
                Ok(answer) if !answer.as_txt().is_empty() => Some(selector.to_string()),
                _ => None,
            },
            Err(_) => None,
        }
    });

    let found: Vec<String> = futures::future::join_all(probes)
        .await
        .into_iter()
        .flatten()
        .collect();

    DKIM_CACHE.insert(domain.to_string(), found.clone(), DKIM_CACHE_TTL);
    found
}

/// True when `ip` appears in any of the configured blacklist zones.
/// Listing is signalled by the zone resolving the reversed address.
pub async fn dnsbl_listed(resolver: &dyn Resolver, ip: IpAddr) -> Option<bool> {
    let reversed = crate::reverse_ipv4(ip)?;

    for zone in DNSBL_ZONES {
        let name = match fully_qualify(&format!("{reversed}.{zone}")) {
            Ok(name) => name,
            Err(_) => continue,
        };
        match query(resolver, name, RecordType::A).await {
            Ok(answer) if !answer.as_addr().is_empty() => return Some(true),
            Ok(_) => continue,
            // A zone that cannot be queried tells us nothing about
            // the other zones; keep going.
            Err(_) => continue,
        }
    }
    Some(false)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::TestResolver;

    #[tokio::test]
    async fn spf_and_dmarc_presence() {
        let resolver = TestResolver::default()
            .with_txt("sender.test", "v=spf1 include:_spf.example.com ~all")
            .with_txt("_dmarc.sender.test", "v=DMARC1; p=reject;");

        let signals = collect_signals(&resolver, "sender.test").await;
        assert_eq!(signals.spf, Some(true));
        assert_eq!(signals.dmarc, Some(true));
        assert_eq!(signals.mta_sts, Some(false));
        assert_eq!(signals.bimi, Some(false));
    }

    #[tokio::test]
    async fn unrelated_txt_is_not_spf() {
        let resolver = TestResolver::default()
            .with_txt("plain.test", "google-site-verification=abc123");

        let signals = collect_signals(&resolver, "plain.test").await;
        assert_eq!(signals.spf, Some(false));
    }

    #[tokio::test]
    async fn dkim_selector_scan() {
        let resolver = TestResolver::default()
            .with_txt(
                "selector1._domainkey.corp.test",
                "v=DKIM1; k=rsa; p=MIGfMA0",
            )
            .with_txt("google._domainkey.corp.test", "v=DKIM1; k=rsa; p=MIGfMA0");

        let found = dkim_selectors(&resolver, "corp.test").await;
        assert_eq!(
            found,
            vec!["google".to_string(), "selector1".to_string()]
        );
    }

    #[tokio::test]
    async fn dnsbl_hit_and_miss() {
        let resolver = TestResolver::default().with_zone(
            r#"
$ORIGIN zen.spamhaus.org.
4.3.2.192.zen.spamhaus.org. 600 IN A 127.0.0.2
"#,
        );

        let listed = dnsbl_listed(&resolver, "192.2.3.4".parse().unwrap()).await;
        assert_eq!(listed, Some(true));

        let clean = dnsbl_listed(&resolver, "198.51.100.1".parse().unwrap()).await;
        assert_eq!(clean, Some(false));

        // DNSBL zones are IPv4-only
        let v6 = dnsbl_listed(&resolver, "2001:db8::1".parse().unwrap()).await;
        assert_eq!(v6, None);
    }
}
