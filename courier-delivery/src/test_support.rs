//! Test doubles shared by the unit tests of this crate.

use std::{
    collections::VecDeque,
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use courier_common::{Mail, MailAddress};
use parking_lot::Mutex;

use crate::{
    bounce::{BounceError, Bouncer},
    classify::{ProtocolError, SendFailure},
    config::{DeliveryConfiguration, RemoteDeliveryConfig},
    deliverer::MailDelivrer,
    dns::{DnsError, DnsService, MxHost},
    dns_helper::HostAddress,
    queue::QueueError,
    result::DeliveryFailure,
    smtp_transaction::HostDelivery,
};

pub enum Mx {
    /// `mx1.<domain>` .. `mxN.<domain>`, resolving to `192.0.2.N`.
    Hosts(u8),
    Unreachable,
}

pub struct TestDns(pub Mx);

#[async_trait]
impl DnsService for TestDns {
    async fn find_mx_records(&self, domain: &str) -> Result<Arc<[MxHost]>, DnsError> {
        match self.0 {
            Mx::Hosts(count) => Ok((1..=count)
                .map(|n| MxHost::new(format!("mx{n}.{domain}"), u16::from(n) * 10))
                .collect()),
            Mx::Unreachable => Err(DnsError::Timeout(domain.to_string())),
        }
    }

    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        let n = host
            .strip_prefix("mx")
            .and_then(|rest| rest.split('.').next())
            .and_then(|n| n.parse::<u8>().ok())
            .ok_or_else(|| DnsError::LookupFailed {
                domain: host.to_string(),
                reason: "unknown test host".to_string(),
            })?;

        Ok(vec![IpAddr::from([192, 0, 2, n])])
    }
}

/// Answers each attempt with the next scripted result; succeeds once the
/// script runs out.
#[derive(Default)]
pub struct ScriptedHosts {
    script: Mutex<VecDeque<Result<(), SendFailure>>>,
    pub attempts: Mutex<Vec<(HostAddress, Vec<MailAddress>)>>,
    repeat: Option<SendFailure>,
}

impl ScriptedHosts {
    pub fn new(script: impl IntoIterator<Item = Result<(), SendFailure>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        })
    }

    /// Fails every attempt with `failure`.
    pub fn always(failure: SendFailure) -> Arc<Self> {
        Arc::new(Self {
            repeat: Some(failure),
            ..Self::default()
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.lock().len()
    }
}

#[async_trait]
impl HostDelivery for ScriptedHosts {
    async fn try_delivery_to_host(
        &self,
        _mail: &Mail,
        recipients: &[MailAddress],
        host: &HostAddress,
    ) -> Result<(), SendFailure> {
        self.attempts.lock().push((host.clone(), recipients.to_vec()));

        if let Some(failure) = &self.repeat {
            return Err(failure.clone());
        }
        self.script.lock().pop_front().unwrap_or(Ok(()))
    }
}

pub struct PanickingHosts;

#[async_trait]
impl HostDelivery for PanickingHosts {
    async fn try_delivery_to_host(
        &self,
        _mail: &Mail,
        _recipients: &[MailAddress],
        _host: &HostAddress,
    ) -> Result<(), SendFailure> {
        panic!("transport exploded");
    }
}

#[derive(Default)]
pub struct RecordingBouncer {
    /// Recipients and cause of every bounce.
    pub bounced: Mutex<Vec<(Vec<MailAddress>, Option<String>)>>,
    pub calls: AtomicUsize,
    pub fail: bool,
}

impl RecordingBouncer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Bouncer for RecordingBouncer {
    async fn bounce(&self, mail: &Mail, cause: Option<&DeliveryFailure>) -> Result<(), BounceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(BounceError::Queue {
                mail: mail.name().to_string(),
                source: QueueError::Closed,
            });
        }

        self.bounced
            .lock()
            .push((mail.recipients().to_vec(), cause.map(ToString::to_string)));
        Ok(())
    }
}

pub fn address(value: &str) -> MailAddress {
    value.parse().unwrap_or_else(|err| panic!("{value}: {err}"))
}

pub fn mail(recipients: &[&str]) -> Mail {
    Mail::new(
        "mail-1",
        Some(address("sender@example.org")),
        recipients.iter().copied().map(address).collect(),
        b"Subject: test\r\n\r\nbody".as_slice(),
    )
}

pub fn connection_refused() -> SendFailure {
    SendFailure::Connection(ProtocolError::new("connection refused"))
}

pub fn config(config: RemoteDeliveryConfig) -> Arc<DeliveryConfiguration> {
    config
        .validate()
        .unwrap_or_else(|err| panic!("invalid test configuration: {err}"))
}

pub fn delivrer(
    config: &Arc<DeliveryConfiguration>,
    dns: Mx,
    hosts: Arc<dyn HostDelivery>,
    bouncer: Arc<dyn Bouncer>,
) -> MailDelivrer {
    MailDelivrer::new(Arc::clone(config), Arc::new(TestDns(dns)), hosts, bouncer)
}
