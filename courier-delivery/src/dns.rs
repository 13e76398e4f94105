//! MX and address lookups.
//!
//! [`DnsService`] is the seam the delivery engine resolves through, so tests
//! can count and script lookups. [`HickoryDnsService`] is the production
//! implementation: MX answers are cached for their record TTL, clamped to the
//! configured bounds.

use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use courier_common::outgoing;
use dashmap::DashMap;
use hickory_resolver::{
    ResolveError, TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider,
    proto::rr::Record,
};
use serde::Deserialize;
use thiserror::Error;

/// TTL assumed when an answer carries no records to take one from.
const FALLBACK_TTL_SECS: u32 = 300;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// The lookup could not be completed. Retrying later may succeed.
    #[error("DNS lookup for {domain} failed: {reason}")]
    LookupFailed { domain: String, reason: String },

    #[error("DNS lookup for {0} timed out")]
    Timeout(String),

    #[error("Unable to initialise DNS resolver: {0}")]
    Init(String),
}

impl DnsError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::LookupFailed { .. } | Self::Timeout(_))
    }

    fn lookup(domain: &str, err: &ResolveError) -> Self {
        Self::LookupFailed {
            domain: domain.to_string(),
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Replaces the record TTL for every cache entry when set.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    #[serde(default = "default_min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    #[serde(default = "default_max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_min_cache_ttl_secs() -> u64 {
    60
}

const fn default_max_cache_ttl_secs() -> u64 {
    3600
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: None,
            min_cache_ttl_secs: default_min_cache_ttl_secs(),
            max_cache_ttl_secs: default_max_cache_ttl_secs(),
        }
    }
}

impl DnsConfig {
    fn cache_ttl(&self, record_ttl: u32) -> Duration {
        let secs = self.cache_ttl_secs.unwrap_or_else(|| {
            u64::from(record_ttl).clamp(
                self.min_cache_ttl_secs,
                self.max_cache_ttl_secs.max(self.min_cache_ttl_secs),
            )
        });
        Duration::from_secs(secs)
    }
}

/// One mail exchanger for a domain. Lower preference is tried first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxHost {
    pub exchange: String,
    pub preference: u16,
}

impl MxHost {
    #[must_use]
    pub fn new(exchange: impl Into<String>, preference: u16) -> Self {
        Self {
            exchange: exchange.into(),
            preference,
        }
    }
}

#[async_trait]
pub trait DnsService: Send + Sync {
    /// Mail exchangers for `domain`, best preference first.
    ///
    /// A domain without MX records but with an address is its own implicit
    /// exchanger. A domain that does not exist, or has neither, yields an
    /// empty list: that is an answer, not an error.
    ///
    /// # Errors
    ///
    /// [`DnsError::is_temporary`] errors when the lookup itself failed.
    async fn find_mx_records(&self, domain: &str) -> Result<Arc<[MxHost]>, DnsError>;

    /// Addresses of `host`. Empty when the name has no A/AAAA records.
    ///
    /// # Errors
    ///
    /// [`DnsError::is_temporary`] errors when the lookup itself failed.
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError>;
}

#[derive(Debug, Clone)]
struct CachedMx {
    hosts: Arc<[MxHost]>,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct HickoryDnsService {
    resolver: TokioResolver,
    cache: DashMap<String, CachedMx>,
    config: DnsConfig,
}

impl HickoryDnsService {
    /// Builds a resolver from the system configuration.
    ///
    /// # Errors
    ///
    /// When the system resolver configuration cannot be read.
    pub fn new(config: DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())
            .map_err(|err| DnsError::Init(err.to_string()))?
            .with_options(opts)
            .build();

        Ok(Self {
            resolver,
            cache: DashMap::new(),
            config,
        })
    }

    async fn find_mx_uncached(&self, domain: &str) -> Result<(Vec<MxHost>, u32), DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let ttl = lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(Record::ttl)
                    .min()
                    .unwrap_or(FALLBACK_TTL_SECS);

                let mut hosts: Vec<MxHost> = lookup
                    .iter()
                    .map(|mx| {
                        MxHost::new(
                            mx.exchange().to_utf8().trim_end_matches('.'),
                            mx.preference(),
                        )
                    })
                    .collect();

                if hosts.is_empty() {
                    return self.implicit_mx(domain).await;
                }

                hosts.sort_by_key(|host| host.preference);
                Ok((hosts, ttl))
            }
            Err(err) if err.is_nx_domain() => {
                outgoing!(level = DEBUG, domain, "Domain does not exist");
                Ok((Vec::new(), FALLBACK_TTL_SECS))
            }
            Err(err) if err.is_no_records_found() => {
                outgoing!(level = DEBUG, domain, "No MX records, trying the domain itself");
                self.implicit_mx(domain).await
            }
            Err(err) => {
                outgoing!(level = WARN, domain, %err, "MX lookup failed");
                Err(DnsError::lookup(domain, &err))
            }
        }
    }

    async fn implicit_mx(&self, domain: &str) -> Result<(Vec<MxHost>, u32), DnsError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) => {
                let ttl = lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(Record::ttl)
                    .min()
                    .unwrap_or(FALLBACK_TTL_SECS);

                if lookup.iter().next().is_none() {
                    Ok((Vec::new(), ttl))
                } else {
                    Ok((vec![MxHost::new(domain, 0)], ttl))
                }
            }
            Err(err) if err.is_no_records_found() || err.is_nx_domain() => {
                Ok((Vec::new(), FALLBACK_TTL_SECS))
            }
            Err(err) => {
                outgoing!(level = WARN, domain, %err, "A/AAAA lookup failed");
                Err(DnsError::lookup(domain, &err))
            }
        }
    }
}

#[async_trait]
impl DnsService for HickoryDnsService {
    async fn find_mx_records(&self, domain: &str) -> Result<Arc<[MxHost]>, DnsError> {
        let key = domain.to_ascii_lowercase();

        if let Some(cached) = self.cache.get(&key) {
            if cached.expires_at > Instant::now() {
                return Ok(Arc::clone(&cached.hosts));
            }
        }

        let (hosts, record_ttl) = self.find_mx_uncached(&key).await?;
        let hosts: Arc<[MxHost]> = hosts.into();
        let ttl = self.config.cache_ttl(record_ttl);

        outgoing!(level = DEBUG, domain = %key, hosts = hosts.len(), ?ttl, "Caching MX answer");
        self.cache.insert(
            key,
            CachedMx {
                hosts: Arc::clone(&hosts),
                expires_at: Instant::now() + ttl,
            },
        );

        Ok(hosts)
    }

    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => Ok(lookup.iter().collect()),
            Err(err) if err.is_no_records_found() || err.is_nx_domain() => Ok(Vec::new()),
            Err(err) => Err(DnsError::lookup(host, &err)),
        }
    }
}
