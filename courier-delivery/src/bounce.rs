//! Non-delivery notifications (RFC 3464).
//!
//! ```text
//! multipart/report; report-type="delivery-status"
//! ├── text/plain               explanation for the sender
//! ├── message/delivery-status  one group per failed recipient
//! └── text/rfc822-headers      headers of the undelivered mail
//! ```

use std::{fmt::Write as _, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::{Mail, MailAddress, internal};
use thiserror::Error;

use crate::{
    composer::MessageComposer,
    config::DeliveryConfiguration,
    queue::{MailQueue, QueueError},
    result::DeliveryFailure,
};

#[derive(Debug, Error)]
pub enum BounceError {
    #[error("Unable to queue the notification for {mail}: {source}")]
    Queue {
        mail: String,
        #[source]
        source: QueueError,
    },
}

/// Tells the sender that their mail could not be delivered.
#[async_trait]
pub trait Bouncer: Send + Sync {
    /// # Errors
    ///
    /// When the notification cannot be handed on. Callers log and move on.
    async fn bounce(&self, mail: &Mail, cause: Option<&DeliveryFailure>) -> Result<(), BounceError>;
}

/// Sends an RFC 3464 report from the postmaster through the delivery queue.
pub struct DsnBouncer {
    config: Arc<DeliveryConfiguration>,
    composer: MessageComposer,
    queue: Arc<dyn MailQueue>,
}

impl DsnBouncer {
    pub fn new(config: Arc<DeliveryConfiguration>, queue: Arc<dyn MailQueue>) -> Self {
        Self {
            composer: MessageComposer::new(config.helo_name.clone()),
            config,
            queue,
        }
    }

    /// The complete notification for `mail`, addressed to `sender`.
    #[must_use]
    pub fn compose(
        &self,
        mail: &Mail,
        sender: &MailAddress,
        cause: Option<&DeliveryFailure>,
    ) -> String {
        let boundary = format!("----=_Part_{}", ulid::Ulid::new());
        let explanation = self.composer.explanation_text(mail, cause);
        let status = self.delivery_status(mail, cause);
        let headers = mail.headers();

        format!(
            "Date: {date}\r\n\
             From: Mail Delivery System <{postmaster}>\r\n\
             To: {sender}\r\n\
             Subject: Delivery Status Notification (Failure)\r\n\
             Auto-Submitted: auto-replied\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: multipart/report; report-type=\"delivery-status\"; boundary=\"{boundary}\"\r\n\
             \r\n\
             This is a multi-part message in MIME format.\r\n\
             \r\n\
             --{boundary}\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             Content-Transfer-Encoding: 7bit\r\n\
             \r\n\
             {explanation}\r\n\
             --{boundary}\r\n\
             Content-Type: message/delivery-status\r\n\
             \r\n\
             {status}\r\n\
             --{boundary}\r\n\
             Content-Type: text/rfc822-headers\r\n\
             \r\n\
             {headers}\r\n\
             --{boundary}--\r\n",
            date = Utc::now().to_rfc2822(),
            postmaster = self.config.postmaster,
            explanation = explanation.replace('\n', "\r\n"),
        )
    }

    fn delivery_status(&self, mail: &Mail, cause: Option<&DeliveryFailure>) -> String {
        let arrival: DateTime<Utc> = mail.last_updated().into();

        let mut status = format!(
            "Reporting-MTA: dns; {}\r\nArrival-Date: {}\r\n",
            self.config.reporting_mta,
            arrival.to_rfc2822()
        );

        for recipient in mail.recipients() {
            let _ = write!(
                status,
                "\r\nFinal-Recipient: rfc822; {recipient}\r\n\
                 Action: failed\r\n\
                 Status: 5.0.0\r\n"
            );

            if let Some(diagnostic) = diagnostic_for(recipient, cause) {
                let _ = write!(status, "Diagnostic-Code: smtp; {diagnostic}\r\n");
            }
        }

        status
    }
}

/// The failure reported for `recipient` itself, or the overall cause.
fn diagnostic_for(recipient: &MailAddress, cause: Option<&DeliveryFailure>) -> Option<String> {
    let cause = cause?;

    let per_address = cause
        .send_failure()
        .and_then(|failure| failure.protocol_error())
        .and_then(|error| {
            error
                .chain()
                .find(|entry| entry.address.as_ref() == Some(recipient))
        });

    let text = per_address.map_or_else(|| cause.to_string(), ToString::to_string);
    Some(text.replace(['\r', '\n'], " "))
}

#[async_trait]
impl Bouncer for DsnBouncer {
    async fn bounce(&self, mail: &Mail, cause: Option<&DeliveryFailure>) -> Result<(), BounceError> {
        let Some(sender) = mail.sender() else {
            internal!(
                level = DEBUG,
                mail = %mail.name(),
                "Null sender, no bounce will be generated"
            );
            return Ok(());
        };

        let body = self.compose(mail, sender, cause);
        let notification = Mail::new(
            format!("{}-bounce", mail.name()),
            None,
            vec![sender.clone()],
            body.into_bytes(),
        );

        internal!(
            level = INFO,
            mail = %mail.name(),
            notification = %notification.name(),
            to = %sender,
            "Bouncing undeliverable mail"
        );

        self.queue
            .enqueue(notification, Duration::ZERO)
            .await
            .map_err(|source| BounceError::Queue {
                mail: mail.name().to_string(),
                source,
            })
    }
}
