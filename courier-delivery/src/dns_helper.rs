//! Turns a destination domain into the ordered list of hosts to try.

use std::{
    collections::VecDeque,
    fmt::{self, Display},
    net::{IpAddr, SocketAddr},
    str::FromStr,
    sync::Arc,
};

use courier_common::outgoing;
use serde::{Deserialize, Serialize};

use crate::{
    config::ConfigError,
    dns::{DnsError, DnsService},
};

/// A statically configured relay, `host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gateway {
    pub host: String,
    pub port: Option<u16>,
}

impl FromStr for Gateway {
    type Err = ConfigError;

    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        let entry = entry.trim();
        let invalid = || ConfigError::Gateway(entry.to_string());

        let (host, port) = if let Some(rest) = entry.strip_prefix('[') {
            let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
            match rest {
                "" => (host, None),
                _ => (host, Some(rest.strip_prefix(':').ok_or_else(invalid)?)),
            }
        } else if entry.matches(':').count() == 1 {
            let (host, port) = entry.split_once(':').ok_or_else(invalid)?;
            (host, Some(port))
        } else {
            (entry, None)
        };

        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(invalid());
        }

        let port = port
            .map(|port| port.parse::<u16>().map_err(|_| invalid()))
            .transpose()?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// One concrete place to connect to: the host name it was found under and
/// the resolved socket address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAddress {
    hostname: String,
    address: SocketAddr,
}

impl HostAddress {
    #[must_use]
    pub fn new(hostname: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            hostname: hostname.into(),
            address,
        }
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }
}

impl Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.hostname, self.address)
    }
}

#[derive(Debug, Clone)]
struct Target {
    host: String,
    port: u16,
}

enum Lookup {
    Dns(Arc<dyn DnsService>),
    /// Gateways are resolved by the operating system, never through DNS service.
    System,
}

/// Lazily resolved candidate hosts, in the order they should be tried.
///
/// Each target name is only resolved when the previous one has been used up.
/// Names that do not resolve are skipped. Single pass: once drained it stays
/// empty.
pub struct HostAddressIterator {
    targets: VecDeque<Target>,
    resolved: VecDeque<HostAddress>,
    lookup: Lookup,
}

impl HostAddressIterator {
    fn new(targets: VecDeque<Target>, lookup: Lookup) -> Self {
        Self {
            targets,
            resolved: VecDeque::new(),
            lookup,
        }
    }

    /// An iterator over already resolved addresses.
    #[must_use]
    pub fn from_addresses(addresses: impl IntoIterator<Item = HostAddress>) -> Self {
        Self {
            targets: VecDeque::new(),
            resolved: addresses.into_iter().collect(),
            lookup: Lookup::System,
        }
    }

    pub async fn has_next(&mut self) -> bool {
        self.fill().await
    }

    pub async fn next(&mut self) -> Option<HostAddress> {
        if self.fill().await {
            self.resolved.pop_front()
        } else {
            None
        }
    }

    async fn fill(&mut self) -> bool {
        while self.resolved.is_empty() {
            let Some(target) = self.targets.pop_front() else {
                return false;
            };

            let addresses = self.resolve(&target).await;
            if addresses.is_empty() {
                outgoing!(
                    level = INFO,
                    host = %target.host,
                    "Mail server has no usable address, skipping it"
                );
            }

            self.resolved.extend(
                addresses
                    .into_iter()
                    .map(|address| HostAddress::new(target.host.clone(), address)),
            );
        }

        true
    }

    async fn resolve(&self, target: &Target) -> Vec<SocketAddr> {
        if let Ok(ip) = target.host.parse::<IpAddr>() {
            return vec![SocketAddr::new(ip, target.port)];
        }

        match &self.lookup {
            Lookup::Dns(dns) => match dns.lookup_ip(&target.host).await {
                Ok(ips) => ips
                    .into_iter()
                    .map(|ip| SocketAddr::new(ip, target.port))
                    .collect(),
                Err(err) => {
                    outgoing!(level = DEBUG, host = %target.host, %err, "Address lookup failed");
                    Vec::new()
                }
            },
            Lookup::System => match tokio::net::lookup_host((target.host.as_str(), target.port))
                .await
            {
                Ok(addresses) => addresses.collect(),
                Err(err) => {
                    outgoing!(level = DEBUG, host = %target.host, %err, "Address lookup failed");
                    Vec::new()
                }
            },
        }
    }
}

/// Chooses between the configured gateways and the destination's MX hosts.
#[derive(Clone)]
pub struct DnsHelper {
    dns: Arc<dyn DnsService>,
    gateways: Arc<[Gateway]>,
    gateway_port: u16,
    smtp_port: u16,
}

impl DnsHelper {
    pub fn new(
        dns: Arc<dyn DnsService>,
        gateways: Arc<[Gateway]>,
        gateway_port: u16,
        smtp_port: u16,
    ) -> Self {
        Self {
            dns,
            gateways,
            gateway_port,
            smtp_port,
        }
    }

    /// Candidate hosts for `domain`.
    ///
    /// With gateways configured the domain is ignored and the gateways are
    /// returned in configuration order without consulting DNS.
    ///
    /// # Errors
    ///
    /// A temporary [`DnsError`] when the MX lookup could not be completed.
    /// A domain with no mail servers is an empty iterator, not an error.
    pub async fn retrieve_host_address_iterator(
        &self,
        domain: &str,
    ) -> Result<HostAddressIterator, DnsError> {
        if !self.gateways.is_empty() {
            let targets = self
                .gateways
                .iter()
                .map(|gateway| Target {
                    host: gateway.host.clone(),
                    port: gateway.port.unwrap_or(self.gateway_port),
                })
                .collect();

            return Ok(HostAddressIterator::new(targets, Lookup::System));
        }

        let mut hosts = self.dns.find_mx_records(domain).await?.to_vec();
        hosts.sort_by_key(|host| host.preference);

        outgoing!(level = DEBUG, domain, hosts = ?hosts, "Mail exchangers found");

        let targets = hosts
            .into_iter()
            .map(|host| Target {
                host: host.exchange,
                port: self.smtp_port,
            })
            .collect();

        Ok(HostAddressIterator::new(
            targets,
            Lookup::Dns(Arc::clone(&self.dns)),
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tracing::{Event, Subscriber};
    use tracing_subscriber::{
        Layer,
        layer::{Context, SubscriberExt},
        registry::LookupSpan,
        util::SubscriberInitExt,
    };

    use super::*;
    use crate::dns::MxHost;

    #[derive(Default)]
    struct ScriptedDns {
        mx: Vec<MxHost>,
        mx_calls: AtomicUsize,
        ip_calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl DnsService for ScriptedDns {
        async fn find_mx_records(&self, domain: &str) -> Result<Arc<[MxHost]>, DnsError> {
            self.mx_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DnsError::Timeout(domain.to_string()));
            }
            Ok(self.mx.clone().into())
        }

        async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
            self.ip_calls.fetch_add(1, Ordering::SeqCst);
            match host {
                "mx1.example.com" => Ok(vec!["192.0.2.1".parse().unwrap(), "192.0.2.2".parse().unwrap()]),
                "mx2.example.com" => Ok(vec!["192.0.2.3".parse().unwrap()]),
                _ => Ok(Vec::new()),
            }
        }
    }

    fn helper(dns: Arc<ScriptedDns>, gateways: &[&str]) -> DnsHelper {
        let gateways: Vec<Gateway> = gateways.iter().map(|g| g.parse().unwrap()).collect();
        DnsHelper::new(dns, gateways.into(), 25, 25)
    }

    async fn drain(mut iterator: HostAddressIterator) -> Vec<String> {
        let mut seen = Vec::new();
        while let Some(host) = iterator.next().await {
            seen.push(host.address().to_string());
        }
        seen
    }

    #[test]
    fn parses_gateway_entries() {
        assert_eq!(
            "relay.example.com".parse::<Gateway>().unwrap(),
            Gateway { host: "relay.example.com".to_string(), port: None }
        );
        assert_eq!(
            "relay.example.com:2525".parse::<Gateway>().unwrap(),
            Gateway { host: "relay.example.com".to_string(), port: Some(2525) }
        );
        assert_eq!(
            "[2001:db8::1]:587".parse::<Gateway>().unwrap(),
            Gateway { host: "2001:db8::1".to_string(), port: Some(587) }
        );
        assert_eq!(
            "2001:db8::1".parse::<Gateway>().unwrap(),
            Gateway { host: "2001:db8::1".to_string(), port: None }
        );
        assert!("relay:port".parse::<Gateway>().is_err());
        assert!(":25".parse::<Gateway>().is_err());
        assert!("[::1".parse::<Gateway>().is_err());
    }

    #[tokio::test]
    async fn orders_by_preference_and_skips_unresolvable_hosts() {
        let dns = Arc::new(ScriptedDns {
            mx: vec![
                MxHost::new("mx2.example.com", 20),
                MxHost::new("dangling.example.com", 5),
                MxHost::new("mx1.example.com", 10),
            ],
            ..ScriptedDns::default()
        });

        let iterator = helper(Arc::clone(&dns), &[])
            .retrieve_host_address_iterator("example.com")
            .await
            .unwrap();

        assert_eq!(
            drain(iterator).await,
            vec!["192.0.2.1:25", "192.0.2.2:25", "192.0.2.3:25"]
        );
        assert_eq!(dns.mx_calls.load(Ordering::SeqCst), 1);
    }

    #[derive(Clone, Default)]
    struct SpanRecorder(Arc<parking_lot::Mutex<Vec<Option<String>>>>);

    impl<S> Layer<S> for SpanRecorder
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
            if event.metadata().target() == module_path!() {
                self.0
                    .lock()
                    .push(ctx.event_span(event).map(|span| span.name().to_string()));
            }
        }
    }

    #[tokio::test]
    async fn host_selection_is_logged_as_outgoing_traffic() {
        let recorder = SpanRecorder::default();
        let _guard = tracing_subscriber::registry()
            .with(recorder.clone())
            .set_default();

        let dns = Arc::new(ScriptedDns {
            mx: vec![
                MxHost::new("dangling.example.com", 5),
                MxHost::new("mx2.example.com", 20),
            ],
            ..ScriptedDns::default()
        });
        let iterator = helper(dns, &[])
            .retrieve_host_address_iterator("example.com")
            .await
            .unwrap();
        assert_eq!(drain(iterator).await, vec!["192.0.2.3:25"]);

        let spans = recorder.0.lock().clone();
        assert!(spans.len() >= 2, "{spans:?}");
        assert!(
            spans.iter().all(|span| span.as_deref() == Some("outgoing")),
            "{spans:?}"
        );
    }

    #[tokio::test]
    async fn resolves_lazily() {
        let dns = Arc::new(ScriptedDns {
            mx: vec![MxHost::new("mx1.example.com", 10), MxHost::new("mx2.example.com", 20)],
            ..ScriptedDns::default()
        });

        let mut iterator = helper(Arc::clone(&dns), &[])
            .retrieve_host_address_iterator("example.com")
            .await
            .unwrap();
        assert_eq!(dns.ip_calls.load(Ordering::SeqCst), 0);

        iterator.next().await.unwrap();
        iterator.next().await.unwrap();
        assert_eq!(dns.ip_calls.load(Ordering::SeqCst), 1);

        iterator.next().await.unwrap();
        assert_eq!(dns.ip_calls.load(Ordering::SeqCst), 2);
        assert!(!iterator.has_next().await);
    }

    #[tokio::test]
    async fn empty_answer_is_an_empty_iterator() {
        let dns = Arc::new(ScriptedDns::default());
        let mut iterator = helper(dns, &[])
            .retrieve_host_address_iterator("nowhere.example")
            .await
            .unwrap();

        assert!(!iterator.has_next().await);
    }

    #[tokio::test]
    async fn lookup_failure_is_temporary_error() {
        let dns = Arc::new(ScriptedDns {
            fail: true,
            ..ScriptedDns::default()
        });

        let Err(err) = helper(dns, &[])
            .retrieve_host_address_iterator("example.com")
            .await
        else {
            panic!("lookup should fail");
        };
        assert!(err.is_temporary());
    }

    #[tokio::test]
    async fn gateways_bypass_dns() {
        let dns = Arc::new(ScriptedDns {
            mx: vec![MxHost::new("mx1.example.com", 10)],
            ..ScriptedDns::default()
        });

        let iterator = helper(Arc::clone(&dns), &["127.0.0.2:2525", "127.0.0.3"])
            .retrieve_host_address_iterator("example.com")
            .await
            .unwrap();

        assert_eq!(drain(iterator).await, vec!["127.0.0.2:2525", "127.0.0.3:25"]);
        assert_eq!(dns.mx_calls.load(Ordering::SeqCst), 0);
        assert_eq!(dns.ip_calls.load(Ordering::SeqCst), 0);
    }
}
