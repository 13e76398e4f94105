#![allow(dead_code)]

pub mod mock_server;

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use courier_common::{Mail, MailAddress};
use courier_delivery::{
    DeliveryConfiguration, DnsError, DnsService, MxHost, RemoteDeliveryConfig,
};

/// Every domain has the MX hosts given, all of which live on the loopback
/// interface.
pub struct LoopbackDns {
    hosts: Vec<String>,
    pub lookups: AtomicUsize,
}

impl LoopbackDns {
    pub fn new(hosts: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            hosts: hosts.iter().map(ToString::to_string).collect(),
            lookups: AtomicUsize::new(0),
        })
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DnsService for LoopbackDns {
    async fn find_mx_records(&self, _domain: &str) -> Result<Arc<[MxHost]>, DnsError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .hosts
            .iter()
            .zip((10..).step_by(10))
            .map(|(host, preference)| MxHost::new(host.clone(), preference))
            .collect())
    }

    async fn lookup_ip(&self, _host: &str) -> Result<Vec<IpAddr>, DnsError> {
        Ok(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
    }
}

pub fn address(value: &str) -> MailAddress {
    value.parse().expect("valid test address")
}

pub fn mail(name: &str, sender: Option<&str>, recipients: &[&str]) -> Mail {
    Mail::new(
        name,
        sender.map(address),
        recipients.iter().copied().map(address).collect(),
        b"From: sender@example.org\r\nSubject: integration\r\n\r\nHello there.\r\n.leading dot\r\n"
            .as_slice(),
    )
}

/// Settings pointing every MX connection at `port` with short timeouts.
pub fn settings(port: u16) -> RemoteDeliveryConfig {
    let mut settings = RemoteDeliveryConfig {
        smtp_port: port,
        helo_name: "courier.example.org".to_string(),
        ..RemoteDeliveryConfig::default()
    };
    settings.smtp_timeouts.connect_secs = 2;
    settings
}

pub fn config(settings: RemoteDeliveryConfig) -> Arc<DeliveryConfiguration> {
    settings.validate().expect("valid test configuration")
}
