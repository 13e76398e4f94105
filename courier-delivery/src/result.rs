use std::{
    fmt::{self, Display},
    sync::Arc,
};

use thiserror::Error;

use crate::classify::SendFailure;

/// Why a delivery attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    #[error(
        "Temporary problem looking up mail server for host: {domain}.  I cannot determine where to send this message."
    )]
    ResolutionFailure { domain: String, reason: String },

    #[error(
        "There are no DNS entries for the hostname {domain}.  I cannot determine where to send this message."
    )]
    NoRouteFound { domain: String },

    #[error("No recipients specified for {mail} sent by {sender}")]
    NoRecipients { mail: String, sender: String },

    #[error(transparent)]
    Send(#[from] SendFailure),

    /// Every candidate host was tried without any of them reporting an error.
    #[error("No mail server for {domain} accepted a connection")]
    NoServerAvailable { domain: String },

    #[error("Too many retries failure. Bouncing after {retries} retries.")]
    TooManyRetries {
        retries: u32,
        last: Option<Arc<DeliveryFailure>>,
    },

    #[error("{0}")]
    Generic(String),
}

impl DeliveryFailure {
    /// The failure this one wraps, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&Self> {
        match self {
            Self::TooManyRetries { last, .. } => last.as_deref(),
            _ => None,
        }
    }

    /// The innermost send failure, looking through retry exhaustion.
    #[must_use]
    pub fn send_failure(&self) -> Option<&SendFailure> {
        match self {
            Self::Send(failure) => Some(failure),
            _ => self.cause().and_then(Self::send_failure),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    Success,
    TemporaryFailure,
    PermanentFailure,
}

impl Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::TemporaryFailure => "temporary failure",
            Self::PermanentFailure => "permanent failure",
        })
    }
}

/// The outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    state: ExecutionState,
    cause: Option<Arc<DeliveryFailure>>,
}

impl ExecutionResult {
    #[must_use]
    pub const fn success() -> Self {
        Self {
            state: ExecutionState::Success,
            cause: None,
        }
    }

    #[must_use]
    pub fn temporary_failure(cause: impl Into<DeliveryFailure>) -> Self {
        Self {
            state: ExecutionState::TemporaryFailure,
            cause: Some(Arc::new(cause.into())),
        }
    }

    #[must_use]
    pub fn permanent_failure(cause: impl Into<DeliveryFailure>) -> Self {
        Self {
            state: ExecutionState::PermanentFailure,
            cause: Some(Arc::new(cause.into())),
        }
    }

    #[must_use]
    pub fn on_failure(permanent: bool, cause: impl Into<DeliveryFailure>) -> Self {
        if permanent {
            Self::permanent_failure(cause)
        } else {
            Self::temporary_failure(cause)
        }
    }

    #[must_use]
    pub const fn state(&self) -> ExecutionState {
        self.state
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self.state, ExecutionState::PermanentFailure)
    }

    #[must_use]
    pub fn cause(&self) -> Option<&DeliveryFailure> {
        self.cause.as_deref()
    }

    #[must_use]
    pub fn shared_cause(&self) -> Option<Arc<DeliveryFailure>> {
        self.cause.clone()
    }
}
