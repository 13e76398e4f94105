//! Remote delivery settings.
//!
//! [`RemoteDeliveryConfig`] is what operators write (RON in the host MTA's
//! bootstrap file). [`RemoteDeliveryConfig::validate`] turns it into the
//! immutable [`DeliveryConfiguration`] every component shares.

use std::{fmt, sync::Arc, time::Duration};

use courier_common::{MailAddress, internal};
use serde::Deserialize;
use thiserror::Error;

use crate::{
    delay::DelayError,
    delays::DelaysAndMaxRetry,
    dns::DnsConfig,
    dns_helper::Gateway,
};

pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid delay schedule: {0}")]
    DelaySchedule(#[from] DelayError),

    #[error("Invalid gateway '{0}', expected host[:port]")]
    Gateway(String),

    #[error("Invalid postmaster address '{0}'")]
    Postmaster(String),

    #[error("At least one delivery worker is required")]
    NoWorkers,

    #[error("gateway_username and gateway_password must be set together")]
    GatewayCredentials,
}

/// Per-command timeouts for the outbound SMTP session.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SmtpTimeouts {
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub ehlo_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub starttls_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub auth_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub mail_from_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub rcpt_to_secs: u64,

    /// Covers both the DATA command and the transfer of the content.
    #[serde(default = "default_data_timeout")]
    pub data_secs: u64,

    #[serde(default = "default_quit_timeout")]
    pub quit_secs: u64,
}

const fn default_connect_timeout() -> u64 {
    30
}

const fn default_command_timeout() -> u64 {
    30
}

const fn default_data_timeout() -> u64 {
    120
}

const fn default_quit_timeout() -> u64 {
    10
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout(),
            ehlo_secs: default_command_timeout(),
            starttls_secs: default_command_timeout(),
            auth_secs: default_command_timeout(),
            mail_from_secs: default_command_timeout(),
            rcpt_to_secs: default_command_timeout(),
            data_secs: default_data_timeout(),
            quit_secs: default_quit_timeout(),
        }
    }
}

impl SmtpTimeouts {
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }
}

/// Login used with `AUTH PLAIN` against the configured gateways.
#[derive(Clone, PartialEq, Eq)]
pub struct GatewayCredentials {
    username: String,
    password: String,
}

impl GatewayCredentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for GatewayCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Delivery status notification settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DsnConfig {
    /// Name of this MTA in the `Reporting-MTA` field.
    #[serde(default = "default_reporting_mta")]
    pub reporting_mta: String,

    /// `From:` of every bounce.
    #[serde(default = "default_postmaster")]
    pub postmaster: String,
}

fn default_reporting_mta() -> String {
    "localhost".to_string()
}

fn default_postmaster() -> String {
    "postmaster@localhost".to_string()
}

impl Default for DsnConfig {
    fn default() -> Self {
        Self {
            reporting_mta: default_reporting_mta(),
            postmaster: default_postmaster(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteDeliveryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Retry schedule, e.g. `"4*15 minutes, 3*1 hour"`.
    #[serde(default)]
    pub delay_time: Option<String>,

    /// How many retries a domain without mail servers is given before the
    /// failure is considered permanent.
    #[serde(default)]
    pub max_dns_problem_retries: u32,

    #[serde(default)]
    pub debug: bool,

    /// Relays to send everything through instead of the MX hosts.
    #[serde(default)]
    pub gateway: Vec<String>,

    /// Port for gateway entries without one.
    #[serde(default)]
    pub gateway_port: Option<u16>,

    /// Authenticate to the gateways with this login. Ignored without a
    /// gateway.
    #[serde(default)]
    pub gateway_username: Option<String>,

    #[serde(default)]
    pub gateway_password: Option<String>,

    /// Deliver new mail at high priority and retries at low priority.
    #[serde(default)]
    pub use_priority: bool,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_helo_name")]
    pub helo_name: String,

    /// Upgrade with STARTTLS whenever the server offers it.
    #[serde(default)]
    pub start_tls: bool,

    /// Refuse to send over an unencrypted session.
    #[serde(default)]
    pub require_tls: bool,

    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    #[serde(default)]
    pub smtp_timeouts: SmtpTimeouts,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub dsn: DsnConfig,
}

const fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

const fn default_workers() -> usize {
    1
}

fn default_helo_name() -> String {
    "localhost".to_string()
}

const fn default_smtp_port() -> u16 {
    25
}

impl Default for RemoteDeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_time: None,
            max_dns_problem_retries: 0,
            debug: false,
            gateway: Vec::new(),
            gateway_port: None,
            gateway_username: None,
            gateway_password: None,
            use_priority: false,
            workers: default_workers(),
            helo_name: default_helo_name(),
            start_tls: false,
            require_tls: false,
            accept_invalid_certs: false,
            smtp_port: default_smtp_port(),
            smtp_timeouts: SmtpTimeouts::default(),
            dns: DnsConfig::default(),
            dsn: DsnConfig::default(),
        }
    }
}

impl RemoteDeliveryConfig {
    /// Parses the delay schedule and gateway list.
    ///
    /// # Errors
    ///
    /// Any malformed entry is reported; nothing falls back silently.
    pub fn validate(self) -> Result<Arc<DeliveryConfiguration>, ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }

        let delays = DelaysAndMaxRetry::from(self.max_retries, self.delay_time.as_deref())?;

        let gateways = self
            .gateway
            .iter()
            .flat_map(|entry| entry.split(','))
            .filter(|entry| !entry.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Gateway>, _>>()?;

        let gateway_credentials = match (self.gateway_username, self.gateway_password) {
            (Some(username), Some(password)) if !gateways.is_empty() => {
                Some(GatewayCredentials::new(username, password))
            }
            (Some(_), Some(_)) => {
                internal!(
                    level = WARN,
                    "Gateway credentials are configured without a gateway, ignoring them"
                );
                None
            }
            (None, None) => None,
            _ => return Err(ConfigError::GatewayCredentials),
        };

        let postmaster = self
            .dsn
            .postmaster
            .parse::<MailAddress>()
            .map_err(|_| ConfigError::Postmaster(self.dsn.postmaster.clone()))?;

        internal!(
            level = INFO,
            max_retries = delays.max_retries(),
            delays = ?delays.delays().iter().map(ToString::to_string).collect::<Vec<_>>(),
            gateways = gateways.len(),
            workers = self.workers,
            "Remote delivery configured"
        );

        Ok(Arc::new(DeliveryConfiguration {
            delays,
            dns_problem_retry: self.max_dns_problem_retries,
            debug: self.debug,
            gateway_port: self.gateway_port.unwrap_or(self.smtp_port),
            gateways: gateways.into(),
            gateway_credentials,
            use_priority: self.use_priority,
            workers: self.workers,
            helo_name: self.helo_name,
            start_tls: self.start_tls,
            require_tls: self.require_tls,
            accept_invalid_certs: self.accept_invalid_certs,
            smtp_port: self.smtp_port,
            smtp_timeouts: self.smtp_timeouts,
            dns: self.dns,
            reporting_mta: self.dsn.reporting_mta,
            postmaster,
        }))
    }
}

/// Validated, read-only delivery settings.
#[derive(Debug, Clone)]
pub struct DeliveryConfiguration {
    pub delays: DelaysAndMaxRetry,
    pub dns_problem_retry: u32,
    pub debug: bool,
    pub gateways: Arc<[Gateway]>,
    pub gateway_port: u16,
    pub gateway_credentials: Option<GatewayCredentials>,
    pub use_priority: bool,
    pub workers: usize,
    pub helo_name: String,
    pub start_tls: bool,
    pub require_tls: bool,
    pub accept_invalid_certs: bool,
    pub smtp_port: u16,
    pub smtp_timeouts: SmtpTimeouts,
    pub dns: DnsConfig,
    pub reporting_mta: String,
    pub postmaster: MailAddress,
}

impl DeliveryConfiguration {
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.delays.max_retries()
    }

    #[must_use]
    pub fn has_gateway(&self) -> bool {
        !self.gateways.is_empty()
    }
}
