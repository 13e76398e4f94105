//! Types shared by every courier crate: the queued [`Mail`], its
//! [`MailAddress`]es, the attribute store used for retry bookkeeping, and the
//! logging setup.

pub mod address;
pub mod logging;
pub mod mail;

pub use address::{AddressError, MailAddress};
pub use mail::{AttributeValue, Mail, MailState, priority};
pub use tracing;

/// Process-wide lifecycle signal broadcast to long running tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
