//! The queued unit of outbound work.

use std::{
    fmt::{self, Display},
    sync::Arc,
    time::SystemTime,
};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::address::MailAddress;

/// Priority values stored under [`priority::ATTRIBUTE`].
pub mod priority {
    pub const ATTRIBUTE: &str = "MAIL_PRIORITY";

    pub const LOW: i64 = 0;
    pub const NORMAL: i64 = 5;
    pub const HIGH: i64 = 9;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MailState {
    #[default]
    Normal,
    /// At least one delivery attempt failed temporarily.
    Error,
}

impl Display for MailState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::Error => f.write_str("error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeValue {
    Integer(i64),
    Text(String),
}

impl AttributeValue {
    /// Integer view of the value. Text that parses as an integer is accepted,
    /// anything else is `None`.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::Text(text) => text.trim().parse().ok(),
        }
    }
}

impl Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

/// A message waiting for remote delivery.
///
/// Cloning is cheap: the message content is shared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mail {
    name: String,
    sender: Option<MailAddress>,
    recipients: Vec<MailAddress>,
    state: MailState,
    last_updated: SystemTime,
    attributes: AHashMap<String, AttributeValue>,
    data: Arc<[u8]>,
}

impl Mail {
    /// Creates a new mail. A `sender` of `None` is the null reverse-path (`<>`).
    pub fn new(
        name: impl Into<String>,
        sender: Option<MailAddress>,
        recipients: Vec<MailAddress>,
        data: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            name: name.into(),
            sender,
            recipients,
            state: MailState::Normal,
            last_updated: SystemTime::now(),
            attributes: AHashMap::default(),
            data: data.into(),
        }
    }

    /// A fresh, sortable, unique mail name.
    #[must_use]
    pub fn generate_name() -> String {
        ulid::Ulid::new().to_string()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    #[must_use]
    pub const fn sender(&self) -> Option<&MailAddress> {
        self.sender.as_ref()
    }

    /// The reverse-path as it would appear in `MAIL FROM`, `<>` for the null sender.
    #[must_use]
    pub fn sender_or_null(&self) -> String {
        self.sender
            .as_ref()
            .map_or_else(|| "<>".to_string(), ToString::to_string)
    }

    #[must_use]
    pub fn recipients(&self) -> &[MailAddress] {
        &self.recipients
    }

    pub fn set_recipients(&mut self, recipients: Vec<MailAddress>) {
        self.recipients = recipients;
    }

    /// Copy of this mail addressed to `recipients` only.
    #[must_use]
    pub fn with_recipients(&self, recipients: Vec<MailAddress>) -> Self {
        Self {
            recipients,
            ..self.clone()
        }
    }

    #[must_use]
    pub const fn state(&self) -> MailState {
        self.state
    }

    pub const fn set_state(&mut self, state: MailState) {
        self.state = state;
    }

    #[must_use]
    pub const fn last_updated(&self) -> SystemTime {
        self.last_updated
    }

    pub fn touch(&mut self) {
        self.last_updated = SystemTime::now();
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: AttributeValue) {
        self.attributes.insert(name.into(), value);
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<AttributeValue> {
        self.attributes.remove(name)
    }

    #[must_use]
    pub fn priority(&self) -> i64 {
        self.attribute(priority::ATTRIBUTE)
            .and_then(AttributeValue::as_integer)
            .unwrap_or(priority::NORMAL)
    }

    pub fn set_priority(&mut self, value: i64) {
        self.set_attribute(priority::ATTRIBUTE, AttributeValue::Integer(value));
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The header block of the message: everything before the first empty line.
    #[must_use]
    pub fn headers(&self) -> String {
        let text = String::from_utf8_lossy(&self.data);
        let end = text
            .find("\r\n\r\n")
            .or_else(|| text.find("\n\n"))
            .unwrap_or(text.len());

        text[..end].to_string()
    }
}
