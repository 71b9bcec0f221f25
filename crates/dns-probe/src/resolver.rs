use async_trait::async_trait;
use hickory_proto::ProtoErrorKind;
use hickory_resolver::proto::op::response_code::ResponseCode;
use hickory_resolver::proto::rr::{LowerName, RData, RecordSet, RecordType, RrKey};
use hickory_resolver::proto::serialize::txt::Parser;
use hickory_resolver::{Name, ResolveError, TokioResolver};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug)]
pub struct Answer {
    pub records: Vec<RData>,
    pub nxdomain: bool,
    pub expires: Instant,
    pub response_code: ResponseCode,
}

impl Answer {
    pub fn as_txt(&self) -> Vec<String> {
        let mut result = vec![];
        for r in &self.records {
            if let Some(txt) = r.as_txt() {
                let mut joined = String::new();
                for t in txt.iter() {
                    joined.push_str(&String::from_utf8_lossy(t));
                }
                result.push(joined);
            }
        }
        result
    }

    pub fn as_addr(&self) -> Vec<IpAddr> {
        let mut result = vec![];
        for r in &self.records {
            if let Some(a) = r.as_a() {
                result.push(a.0.into());
            } else if let Some(a) = r.as_aaaa() {
                result.push(a.0.into());
            }
        }
        result
    }

    /// (preference, exchange) pairs from MX records, unsorted.
    pub fn as_mx(&self) -> Vec<(u16, String)> {
        let mut result = vec![];
        for r in &self.records {
            if let Some(mx) = r.as_mx() {
                result.push((mx.preference(), mx.exchange().to_lowercase().to_string()));
            }
        }
        result
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum DnsError {
    #[error("invalid DNS name: {0}")]
    InvalidName(String),
    #[error("DNS: {0}")]
    ResolveFailed(String),
    #[error("DNS query for {0} timed out")]
    TimedOut(String),
}

impl DnsError {
    pub(crate) fn from_resolve(name: &impl fmt::Display, err: ResolveError) -> Self {
        DnsError::ResolveFailed(format!("failed to query DNS for {name}: {err}"))
    }
}

#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve(&self, name: Name, rrtype: RecordType) -> Result<Answer, DnsError>;

    async fn resolve_txt(&self, name: &str) -> Result<Answer, DnsError> {
        let name = Name::from_utf8(name)
            .map_err(|err| DnsError::InvalidName(format!("invalid name {name}: {err}")))?;
        self.resolve(name, RecordType::TXT).await
    }

    /// Combined A and AAAA lookup.
    async fn resolve_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        let name = Name::from_utf8(host)
            .map_err(|err| DnsError::InvalidName(format!("invalid name {host}: {err}")))?;

        let (v4, v6) = tokio::join!(
            self.resolve(name.clone(), RecordType::A),
            self.resolve(name, RecordType::AAAA)
        );

        let mut addrs = vec![];
        let mut errors = vec![];
        match v4 {
            Ok(answer) => addrs.extend(answer.as_addr()),
            Err(err) => errors.push(err),
        }
        match v6 {
            Ok(answer) => addrs.extend(answer.as_addr()),
            Err(err) => errors.push(err),
        }

        if addrs.is_empty() && !errors.is_empty() {
            return Err(errors.remove(0));
        }
        Ok(addrs)
    }
}

/// The production resolver, backed by the system configuration in
/// /etc/resolv.conf.
pub struct HickoryResolver {
    inner: TokioResolver,
}

impl HickoryResolver {
    pub fn new() -> Result<Self, hickory_resolver::ResolveError> {
        Ok(Self {
            inner: TokioResolver::builder_tokio()?.build(),
        })
    }
}

impl From<TokioResolver> for HickoryResolver {
    fn from(inner: TokioResolver) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Resolver for HickoryResolver {
    async fn resolve(&self, name: Name, rrtype: RecordType) -> Result<Answer, DnsError> {
        match self.inner.lookup(name.clone(), rrtype).await {
            Ok(result) => {
                let expires = result.valid_until();
                let records = result.iter().cloned().collect();
                Ok(Answer {
                    records,
                    nxdomain: false,
                    expires,
                    response_code: ResponseCode::NoError,
                })
            }
            Err(err) => match err.proto().map(|err| err.kind()) {
                Some(ProtoErrorKind::NoRecordsFound {
                    negative_ttl,
                    response_code,
                    ..
                }) => Ok(Answer {
                    records: vec![],
                    nxdomain: *response_code == ResponseCode::NXDomain,
                    response_code: *response_code,
                    expires: Instant::now()
                        + Duration::from_secs(negative_ttl.unwrap_or(60) as u64),
                }),
                _ => Err(DnsError::from_resolve(&name, err)),
            },
        }
    }
}

/// Zone-file backed resolver for tests.
#[derive(Debug, Default)]
pub struct TestResolver {
    records: BTreeMap<Name, BTreeMap<RrKey, RecordSet>>,
}

impl TestResolver {
    pub fn with_zone(mut self, zone: &str) -> Self {
        let (mut name, records) = Parser::new(zone, None, None).parse().unwrap();
        // The parser can produce names with varying FQDN-ness; pin
        // them all to FQDN so lookups behave consistently.
        name.set_fqdn(true);
        let fqdn_records = records
            .into_iter()
            .map(|(key, value)| {
                if key.name().is_fqdn() {
                    (key, value)
                } else {
                    let mut name: Name = key.name().into();
                    name.set_fqdn(true);
                    (RrKey::new(LowerName::new(&name), key.record_type), value)
                }
            })
            .collect();
        self.records.insert(name, fqdn_records);
        self
    }

    pub fn with_txt(mut self, domain: &str, value: &str) -> Self {
        use hickory_resolver::proto::rr::rdata::TXT;

        let fqdn = format!("{domain}.");
        let authority = Name::from_str(&fqdn).unwrap();
        let key = RrKey {
            name: LowerName::from_str(&fqdn).unwrap(),
            record_type: RecordType::TXT,
        };

        let mut records = RecordSet::new(authority.clone(), RecordType::TXT, 0);
        records.add_rdata(RData::TXT(TXT::new(vec![value.to_string()])));
        self.records
            .entry(authority)
            .or_default()
            .insert(key, records);
        self
    }

    fn get(&self, full: &Name, record_type: RecordType) -> Answer {
        let mut full_fqdn = full.clone();
        full_fqdn.set_fqdn(true);
        let mut authority = full_fqdn.clone();

        let records = loop {
            if let Some(records) = self.records.get(&authority) {
                break records;
            }

            if authority.num_labels() > 1 {
                authority = authority.base_name();
                continue;
            }

            return Answer {
                records: vec![],
                nxdomain: true,
                expires: Instant::now() + Duration::from_secs(60),
                response_code: ResponseCode::NXDomain,
            };
        };

        let records = records.get(&RrKey {
            name: LowerName::from(&full_fqdn),
            record_type,
        });

        match records {
            Some(records) => Answer {
                records: records
                    .records_without_rrsigs()
                    .map(|r| r.data().clone())
                    .collect(),
                nxdomain: false,
                expires: Instant::now() + Duration::from_secs(60),
                response_code: ResponseCode::NoError,
            },
            None => Answer {
                records: vec![],
                nxdomain: false,
                expires: Instant::now() + Duration::from_secs(60),
                response_code: ResponseCode::NoError,
            },
        }
    }
}

#[async_trait]
impl Resolver for TestResolver {
    async fn resolve(&self, name: Name, rrtype: RecordType) -> Result<Answer, DnsError> {
        Ok(self.get(&name, rrtype))
    }
}
