//! Retry bookkeeping stored on the mail itself, so it survives re-enqueueing.

use courier_common::{AttributeValue, Mail};

pub const RETRY_COUNT_ATTRIBUTE: &str = "delivery-retry-count";

/// Retries so far; 0 when the attribute is missing or not a number.
#[must_use]
pub fn retrieve(mail: &Mail) -> u32 {
    mail.attribute(RETRY_COUNT_ATTRIBUTE)
        .and_then(AttributeValue::as_integer)
        .and_then(|count| u32::try_from(count).ok())
        .unwrap_or(0)
}

pub fn initialize(mail: &mut Mail) {
    mail.set_attribute(RETRY_COUNT_ATTRIBUTE, AttributeValue::Integer(0));
}

/// Increments the retry count and returns the new value.
pub fn increment(mail: &mut Mail) -> u32 {
    let count = retrieve(mail).saturating_add(1);
    mail.set_attribute(RETRY_COUNT_ATTRIBUTE, AttributeValue::Integer(i64::from(count)));
    count
}
