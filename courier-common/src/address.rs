use std::{
    fmt::{self, Display},
    str::FromStr,
};

use mailparse::MailAddr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Unable to parse address '{0}': {1}")]
    Parse(String, String),

    #[error("Expected a single mailbox, found a group in '{0}'")]
    Group(String),

    #[error("Expected exactly one mailbox in '{0}'")]
    Count(String),

    #[error("Address '{0}' has no domain part")]
    MissingDomain(String),
}

/// An RFC 5321 forward-path: `local-part@domain`.
///
/// The domain is stored lower-cased so that grouping recipients by
/// destination is a plain string comparison.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MailAddress {
    local_part: String,
    domain: String,
}

impl MailAddress {
    #[must_use]
    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl FromStr for MailAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = mailparse::addrparse(s.trim())
            .map_err(|e| AddressError::Parse(s.to_string(), e.to_string()))?;

        let [addr] = parsed.as_slice() else {
            return Err(AddressError::Count(s.to_string()));
        };

        let MailAddr::Single(info) = addr else {
            return Err(AddressError::Group(s.to_string()));
        };

        let Some((local_part, domain)) = info.addr.rsplit_once('@') else {
            return Err(AddressError::MissingDomain(s.to_string()));
        };

        if local_part.is_empty() || domain.is_empty() {
            return Err(AddressError::MissingDomain(s.to_string()));
        }

        Ok(Self {
            local_part: local_part.to_string(),
            domain: domain.to_ascii_lowercase(),
        })
    }
}

impl TryFrom<String> for MailAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MailAddress> for String {
    fn from(value: MailAddress) -> Self {
        value.to_string()
    }
}

impl Display for MailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}
