//! Domain resolution for the verification engine: MX discovery with
//! the RFC 5321 implicit-MX fallback, plus the DNS-side domain signal
//! collectors (SPF, DMARC, DKIM selector scan, MTA-STS, BIMI, DNSBL).

pub use hickory_resolver::proto::rr::RecordType;
pub use hickory_resolver::Name;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use ttl_cache::TtlCache;

mod resolver;
mod signals;

pub use resolver::{Answer, DnsError, HickoryResolver, Resolver, TestResolver};
pub use signals::{collect_signals, dkim_selectors, dnsbl_listed, DomainSignals, DNSBL_ZONES};

/// Caches domain name to computed MX lookup results
static MX_CACHE: LazyLock<TtlCache<String, MxLookup>> =
    LazyLock::new(|| TtlCache::new("dns_probe_mx"));

/// Maximum number of concurrent DNS queries permitted
static DNS_MAX_CONCURRENCY: AtomicUsize = AtomicUsize::new(20);
static DNS_CONCURRENCY_SEMA: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(DNS_MAX_CONCURRENCY.load(Ordering::SeqCst)));

/// 5 seconds in ms
static DNS_TIMEOUT_MS: AtomicUsize = AtomicUsize::new(5000);

/// 10 minutes in ms
static MX_CACHE_TTL_MS: AtomicUsize = AtomicUsize::new(600 * 1000);

/// Must be called before the first query is issued to take effect on
/// the shared semaphore.
pub fn set_dns_concurrency_limit(n: usize) {
    DNS_MAX_CONCURRENCY.store(n, Ordering::SeqCst);
}

pub fn set_dns_timeout(duration: Duration) {
    DNS_TIMEOUT_MS.store(duration.as_millis() as usize, Ordering::Relaxed);
}

pub fn get_dns_timeout() -> Duration {
    Duration::from_millis(DNS_TIMEOUT_MS.load(Ordering::Relaxed) as u64)
}

pub fn set_mx_cache_ttl(duration: Duration) {
    MX_CACHE_TTL_MS.store(duration.as_millis() as usize, Ordering::Relaxed);
}

fn get_mx_cache_ttl() -> Duration {
    Duration::from_millis(MX_CACHE_TTL_MS.load(Ordering::Relaxed) as u64)
}

pub fn fully_qualify(domain_name: &str) -> Result<Name, DnsError> {
    let mut name = Name::from_str_relaxed(domain_name)
        .map_err(|err| DnsError::InvalidName(format!("invalid name {domain_name}: {err}")))?
        .to_lowercase();
    name.set_fqdn(true);
    Ok(name)
}

/// The result of MX discovery for a domain.
#[derive(Clone, Debug, PartialEq)]
pub struct MxLookup {
    pub has_mx: bool,
    /// Exchange hosts ordered by ascending preference. When the
    /// lookup fell back to the implicit MX this is the domain itself.
    pub hosts: Vec<String>,
    pub via_implicit_mx: bool,
}

impl MxLookup {
    fn none() -> Self {
        Self {
            has_mx: false,
            hosts: vec![],
            via_implicit_mx: false,
        }
    }

    fn implicit(domain: &str) -> Self {
        Self {
            has_mx: true,
            hosts: vec![domain.to_string()],
            via_implicit_mx: true,
        }
    }
}

/// Resolve the mail exchangers for `domain`.
///
/// Empty MX answers and NXDOMAIN fall back to an A/AAAA lookup per
/// RFC 5321 section 5.1; any resolved address designates the domain
/// itself as its own exchanger. Timeouts and other resolution
/// failures surface as errors so the caller can report the domain as
/// unknown rather than undeliverable.
pub async fn lookup_mx(resolver: &dyn Resolver, domain: &str) -> Result<MxLookup, DnsError> {
    let name = fully_qualify(domain)?;
    let key = name.to_ascii();

    if let Some(cached) = MX_CACHE.get(&key) {
        return Ok(cached);
    }

    let lookup = query_mx(resolver, domain, name).await?;
    MX_CACHE.insert(key, lookup.clone(), get_mx_cache_ttl());
    Ok(lookup)
}

async fn query_mx(resolver: &dyn Resolver, domain: &str, name: Name) -> Result<MxLookup, DnsError> {
    let answer = query(resolver, name, RecordType::MX).await?;

    let mut records = answer.as_mx();
    if records.is_empty() {
        // No MX published. Any A/AAAA record makes the domain its own
        // implicit exchanger; NXDOMAIN with no addresses means the
        // domain cannot receive mail at all.
        let addrs = match timeout(get_dns_timeout(), resolver.resolve_ip(domain)).await {
            Ok(Ok(addrs)) => addrs,
            Ok(Err(_)) | Err(_) if answer.nxdomain => vec![],
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(DnsError::TimedOut(domain.to_string())),
        };
        if addrs.is_empty() {
            return Ok(MxLookup::none());
        }
        return Ok(MxLookup::implicit(domain));
    }

    records.sort_unstable_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    Ok(MxLookup {
        has_mx: true,
        hosts: records
            .into_iter()
            .map(|(_, host)| host.trim_end_matches('.').to_string())
            .collect(),
        via_implicit_mx: false,
    })
}

pub(crate) async fn query(
    resolver: &dyn Resolver,
    name: Name,
    rrtype: RecordType,
) -> Result<Answer, DnsError> {
    let display = name.to_ascii();
    match timeout(get_dns_timeout(), async {
        let _permit = DNS_CONCURRENCY_SEMA.acquire().await;
        resolver.resolve(name, rrtype).await
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err(DnsError::TimedOut(display)),
    }
}

/// Reversed dotted-quad form used for DNSBL membership queries.
pub fn reverse_ipv4(ip: IpAddr) -> Option<String> {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            Some(format!("{}.{}.{}.{}", o[3], o[2], o[1], o[0]))
        }
        IpAddr::V6(_) => None,
    }
}
