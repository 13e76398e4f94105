//! What went wrong while talking to a remote host.
//!
//! The per-host sender reports every failure as a [`SendFailure`]. The
//! permanent-versus-temporary decision is made here and nowhere else: a reply
//! code in the 5xx range anywhere in the error chain makes it permanent.

use std::fmt::{self, Display};

use courier_common::MailAddress;
use thiserror::Error;

/// The SMTP step a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmtpCommand {
    Connect,
    Ehlo,
    Helo,
    StartTls,
    Auth,
    MailFrom,
    RcptTo,
    Data,
    Quit,
}

impl Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "CONNECT",
            Self::Ehlo => "EHLO",
            Self::Helo => "HELO",
            Self::StartTls => "STARTTLS",
            Self::Auth => "AUTH",
            Self::MailFrom => "MAIL FROM",
            Self::RcptTo => "RCPT TO",
            Self::Data => "DATA",
            Self::Quit => "QUIT",
        })
    }
}

/// Outcome reported for one address in a per-address chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressAction {
    Succeeded,
    Failed,
}

impl Display for AddressAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        })
    }
}

/// A protocol level error, optionally chained to further errors.
///
/// Partial failures chain one entry per recipient behind a summary entry,
/// so the interesting reply code may sit several levels deep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: Option<u16>,
    pub command: Option<SmtpCommand>,
    pub address: Option<MailAddress>,
    pub message: String,
    pub next: Option<Box<ProtocolError>>,
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{code} {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ProtocolError {}

const fn is_5xx(code: u16) -> bool {
    code >= 500 && code <= 599
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            command: None,
            address: None,
            message: message.into(),
            next: None,
        }
    }

    pub fn reply(command: SmtpCommand, code: u16, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            command: Some(command),
            ..Self::new(message)
        }
    }

    #[must_use]
    pub fn with_address(mut self, address: MailAddress) -> Self {
        self.address = Some(address);
        self
    }

    /// Chains `errors` behind this one, preserving their order.
    #[must_use]
    pub fn with_chain(mut self, errors: impl IntoIterator<Item = Self>) -> Self {
        let mut errors: Vec<Self> = errors.into_iter().collect();
        let mut next = self.next.take();
        while let Some(mut error) = errors.pop() {
            error.next = next;
            next = Some(Box::new(error));
        }
        self.next = next;
        self
    }

    /// This error followed by every chained error.
    pub fn chain(&self) -> impl Iterator<Item = &Self> {
        std::iter::successors(Some(self), |error| error.next.as_deref())
    }

    /// The chained errors, without this one.
    pub fn nested(&self) -> impl Iterator<Item = &Self> {
        self.chain().skip(1)
    }

    #[must_use]
    pub const fn has_return_code(&self) -> bool {
        self.code.is_some()
    }

    #[must_use]
    pub fn has_nested_return_code(&self) -> bool {
        self.nested().any(Self::has_return_code)
    }

    /// The first reply code found below this error.
    #[must_use]
    pub fn nested_return_code(&self) -> Option<u16> {
        self.nested().find_map(|error| error.code)
    }

    /// Whether the remote server reported a permanent failure.
    ///
    /// True when this error or any chained one carries a 5xx code. Transports
    /// that only pass text along are covered by looking at this error's own
    /// message when it carries no code: a leading `5` is taken as 5xx.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        let own = match self.code {
            Some(code) => is_5xx(code),
            None => self.message.trim_start().starts_with('5'),
        };

        own || self.nested().filter_map(|error| error.code).any(is_5xx)
    }

    /// The command that failed, searching the chain.
    #[must_use]
    pub fn compute_command(&self) -> Option<SmtpCommand> {
        self.chain().find_map(|error| error.command)
    }

    /// The address the failure was about, searching the chain.
    #[must_use]
    pub fn compute_address(&self) -> Option<&MailAddress> {
        self.chain().find_map(|error| error.address.as_ref())
    }

    /// For per-address entries, whether the server accepted the address.
    #[must_use]
    pub fn compute_action(&self) -> Option<AddressAction> {
        self.address.as_ref()?;
        match self.code {
            Some(code) if (200..400).contains(&code) => Some(AddressAction::Succeeded),
            _ => Some(AddressAction::Failed),
        }
    }
}

/// Every way a single attempt against a single host can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendFailure {
    /// Some recipients were refused or left unsent.
    ///
    /// `valid_sent` were accepted by the server, `valid_unsent` were
    /// refused temporarily (or never tried) and `invalid` were refused
    /// permanently.
    #[error("{error}")]
    Partial {
        valid_sent: Vec<MailAddress>,
        valid_unsent: Vec<MailAddress>,
        invalid: Vec<MailAddress>,
        error: ProtocolError,
    },

    /// The server rejected the transaction as a whole (MAIL FROM, DATA, ...).
    /// Another host of the same domain would most likely do the same.
    #[error("{0}")]
    Protocol(ProtocolError),

    /// The host could not be reached or dropped the session. Worth trying
    /// the next host.
    #[error("{0}")]
    Connection(ProtocolError),

    #[error("{0}")]
    Unknown(String),
}

impl SendFailure {
    /// The protocol error behind this failure, if there is one.
    #[must_use]
    pub const fn protocol_error(&self) -> Option<&ProtocolError> {
        match self {
            Self::Partial { error, .. } | Self::Protocol(error) | Self::Connection(error) => {
                Some(error)
            }
            Self::Unknown(_) => None,
        }
    }

    #[must_use]
    pub fn is_server_error(&self) -> bool {
        match self {
            Self::Unknown(message) => message.trim_start().starts_with('5'),
            _ => self.protocol_error().is_some_and(ProtocolError::is_server_error),
        }
    }

    #[must_use]
    pub fn has_return_code(&self) -> bool {
        self.protocol_error()
            .is_some_and(ProtocolError::has_return_code)
    }

    #[must_use]
    pub fn has_nested_return_code(&self) -> bool {
        self.protocol_error()
            .is_some_and(ProtocolError::has_nested_return_code)
    }

    #[must_use]
    pub fn valid_sent(&self) -> &[MailAddress] {
        match self {
            Self::Partial { valid_sent, .. } => valid_sent,
            _ => &[],
        }
    }

    #[must_use]
    pub fn valid_unsent(&self) -> &[MailAddress] {
        match self {
            Self::Partial { valid_unsent, .. } => valid_unsent,
            _ => &[],
        }
    }

    #[must_use]
    pub fn invalid(&self) -> &[MailAddress] {
        match self {
            Self::Partial { invalid, .. } => invalid,
            _ => &[],
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn address(value: &str) -> MailAddress {
        value.parse().unwrap()
    }

    #[test]
    fn permanent_code_is_server_error() {
        assert!(ProtocolError::reply(SmtpCommand::RcptTo, 550, "no such user").is_server_error());
        assert!(ProtocolError::reply(SmtpCommand::MailFrom, 505, "bad sender").is_server_error());
    }

    #[test]
    fn transient_code_is_not_server_error() {
        let error = ProtocolError::reply(SmtpCommand::RcptTo, 450, "mailbox busy");
        assert!(!error.is_server_error());
        assert!(error.has_return_code());
    }

    #[test]
    fn code_takes_precedence_over_message_text() {
        assert!(!ProtocolError::reply(SmtpCommand::Data, 451, "5 minutes until retry").is_server_error());
    }

    #[test]
    fn leading_five_in_text_without_code_is_server_error() {
        let error = ProtocolError::new("500 : Horrible way to manage Server Return code");
        assert!(!error.has_return_code());
        assert!(error.is_server_error());

        assert!(!ProtocolError::new("400 : try again").is_server_error());
        assert!(SendFailure::Unknown("554 rejected".to_string()).is_server_error());
    }

    #[test]
    fn finds_code_nested_two_levels_deep() {
        let error = ProtocolError::new("Invalid Addresses").with_chain([
            ProtocolError::new("wrapped transport failure"),
            ProtocolError::reply(SmtpCommand::RcptTo, 550, "unknown user"),
        ]);

        assert!(!error.has_return_code());
        assert!(error.has_nested_return_code());
        assert_eq!(error.nested_return_code(), Some(550));
        assert_eq!(error.chain().count(), 3);
        assert!(error.is_server_error());
    }

    #[test]
    fn nested_transient_codes_are_not_server_errors() {
        let error = ProtocolError::new("Invalid Addresses").with_chain([
            ProtocolError::reply(SmtpCommand::RcptTo, 451, "later"),
            ProtocolError::reply(SmtpCommand::RcptTo, 452, "full"),
        ]);

        assert!(!error.is_server_error());
    }

    #[test]
    fn with_chain_appends_in_order() {
        let error = ProtocolError::new("top")
            .with_chain([ProtocolError::new("a")])
            .with_chain([ProtocolError::new("b"), ProtocolError::new("c")]);

        let messages: Vec<_> = error.chain().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["top", "b", "c", "a"]);
    }

    #[test]
    fn computes_command_address_and_action() {
        let rejected = address("nobody@example.com");
        let error = ProtocolError::new("Invalid Addresses").with_chain([
            ProtocolError::reply(SmtpCommand::RcptTo, 550, "unknown").with_address(rejected.clone()),
            ProtocolError::reply(SmtpCommand::RcptTo, 250, "ok").with_address(address("a@example.com")),
        ]);

        assert_eq!(error.compute_command(), Some(SmtpCommand::RcptTo));
        assert_eq!(error.compute_address(), Some(&rejected));
        assert_eq!(error.compute_action(), None);

        let actions: Vec<_> = error.nested().filter_map(ProtocolError::compute_action).collect();
        assert_eq!(actions, vec![AddressAction::Failed, AddressAction::Succeeded]);
    }

    #[test]
    fn partial_failure_exposes_address_sets() {
        let failure = SendFailure::Partial {
            valid_sent: vec![address("a@example.com")],
            valid_unsent: vec![address("b@example.com")],
            invalid: vec![address("c@example.com")],
            error: ProtocolError::new("Invalid Addresses"),
        };

        assert_eq!(failure.valid_sent().len(), 1);
        assert_eq!(failure.valid_unsent()[0].to_string(), "b@example.com");
        assert_eq!(failure.invalid()[0].to_string(), "c@example.com");
        assert!(!failure.has_return_code());

        let connection = SendFailure::Connection(ProtocolError::new("refused"));
        assert!(connection.valid_unsent().is_empty());
        assert_eq!(connection.to_string(), "refused");
    }
}
