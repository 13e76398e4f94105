//! Client side of an SMTP session: plain TCP with an optional STARTTLS
//! upgrade. Timeouts are applied by the caller around each command.

mod error;
mod reply;
mod smtp_client;

pub use error::{ClientError, Result};
pub use reply::Reply;
pub use smtp_client::SmtpClient;
