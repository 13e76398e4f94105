//! Remote delivery of outbound mail
//!
//! This crate provides functionality to:
//! - Split incoming mail per destination domain and queue it
//! - Resolve MX hosts (or configured gateways) for a destination
//! - Attempt SMTP delivery host by host, classifying every failure
//! - Retry temporary failures on a configurable schedule
//! - Bounce permanent failures back to the sender as RFC 3464 reports

mod bounce;
mod classify;
mod composer;
mod config;
mod delay;
mod delays;
mod deliverer;
mod dns;
mod dns_helper;
mod metrics;
mod pool;
pub mod queue;
mod result;
pub mod retries;
mod runnable;
mod service;
mod smtp_transaction;

#[cfg(test)]
mod test_support;

// Re-export configuration types
pub use config::{
    ConfigError, DEFAULT_MAX_RETRIES, DeliveryConfiguration, DsnConfig, GatewayCredentials,
    RemoteDeliveryConfig, SmtpTimeouts,
};
pub use delay::{DEFAULT_DELAY_TIME, Delay, DelayError, MAX_SCHEDULE_ATTEMPTS};
pub use delays::DelaysAndMaxRetry;
// Re-export DNS types
pub use dns::{DnsConfig, DnsError, DnsService, HickoryDnsService, MxHost};
pub use dns_helper::{DnsHelper, Gateway, HostAddress, HostAddressIterator};
// Re-export failure classification
pub use classify::{AddressAction, ProtocolError, SendFailure, SmtpCommand};
pub use result::{DeliveryFailure, ExecutionResult, ExecutionState};
// Re-export core types
pub use bounce::{BounceError, Bouncer, DsnBouncer};
pub use composer::MessageComposer;
pub use deliverer::{DeliveryOutcome, MailDelivrer};
pub use metrics::DeliveryMetrics;
pub use pool::DeliveryPool;
pub use queue::{MailQueue, MailQueueItem, MemoryMailQueue, QueueError};
pub use runnable::{DeliveryRunnable, RunnableError};
pub use service::RemoteDelivery;
pub use smtp_transaction::{HostDelivery, SmtpHostDelivery};
