//! Human readable renderings of delivery failures, for the log and for
//! bounce messages.

use std::fmt::Write as _;

use courier_common::{Mail, MailAddress};

use crate::{
    classify::{AddressAction, SendFailure},
    result::{DeliveryFailure, ExecutionResult},
};

#[derive(Debug, Clone)]
pub struct MessageComposer {
    helo_name: String,
}

impl MessageComposer {
    pub fn new(helo_name: impl Into<String>) -> Self {
        Self {
            helo_name: helo_name.into(),
        }
    }

    /// One line summary of a failed attempt, e.g.
    /// `Temporary exception delivering mail (abc). RemoteHost said: 452 full: 452 full`.
    #[must_use]
    pub fn compose_fail_log_message(&self, mail: &Mail, result: &ExecutionResult) -> String {
        let kind = if result.is_permanent() {
            "Permanent"
        } else {
            "Temporary"
        };

        let mut message = format!("{kind} exception delivering mail ({})", mail.name());

        if let Some(detail) = result
            .cause()
            .and_then(DeliveryFailure::send_failure)
            .and_then(remote_host_said)
        {
            let _ = write!(message, ". {detail}");
        }

        message.push_str(": ");
        if let Some(cause) = result.cause() {
            message.push_str(&cause.to_string());
        }

        message
    }

    /// Body of the notification sent back to the sender of `mail`.
    #[must_use]
    pub fn explanation_text(&self, mail: &Mail, cause: Option<&DeliveryFailure>) -> String {
        let mut text = format!(
            "Hi. This is the courier mail server at {}.\n\
             I'm afraid I wasn't able to deliver your message to the following addresses.\n\
             This is a permanent error; I've given up. Sorry it didn't work out. Below\n\
             I include the list of recipients and the reason why I was unable to deliver\n\
             your message.\n\n",
            self.helo_name
        );

        for recipient in mail.recipients() {
            let _ = writeln!(text, "{recipient}");
        }
        text.push('\n');

        if let Some(cause) = cause {
            text.push_str(&describe(cause));
            text.push('\n');
        }
        text.push('\n');

        text
    }
}

/// What the remote side reported, when it reported anything useful.
fn remote_host_said(failure: &SendFailure) -> Option<String> {
    match failure {
        SendFailure::Protocol(error) if error.has_return_code() => {
            Some(format!("RemoteHost said: {error}"))
        }
        SendFailure::Partial {
            valid_unsent,
            invalid,
            error,
            ..
        } => {
            if invalid.is_empty() && valid_unsent.is_empty() {
                return None;
            }

            let mut said = String::from("RemoteHost said:");
            let mut per_address = false;

            for nested in error.nested() {
                if let (Some(address), Some(AddressAction::Failed)) =
                    (&nested.address, nested.compute_action())
                {
                    let _ = write!(said, " ( {address} - [{}] )", single_line(&nested.to_string()));
                    per_address = true;
                }
            }

            if !per_address {
                said.push_str(" ( ");
                if !invalid.is_empty() {
                    said.push_str(&list(invalid));
                }
                if !valid_unsent.is_empty() {
                    if !invalid.is_empty() {
                        said.push(' ');
                    }
                    said.push_str(&list(valid_unsent));
                }
                let _ = write!(said, " - [{}] )", single_line(&error.message));
            }

            Some(said)
        }
        _ => None,
    }
}

fn describe(cause: &DeliveryFailure) -> String {
    match cause {
        DeliveryFailure::ResolutionFailure { domain, .. } | DeliveryFailure::NoRouteFound { domain } => {
            format!(
                "Unknown host: {domain}\n\
                 This could be a DNS server error, a typo, or a problem with the recipient's mail server."
            )
        }
        DeliveryFailure::Send(SendFailure::Protocol(error) | SendFailure::Partial { error, .. }) => {
            let reported = error
                .nested()
                .find(|nested| nested.has_return_code())
                .unwrap_or(error);
            format!("Remote mail server told me: {}", reported.to_string().trim())
        }
        DeliveryFailure::TooManyRetries {
            last: Some(last), ..
        } => format!("{cause}\n{}", describe(last)),
        other => other.to_string().trim().to_string(),
    }
}

fn list(addresses: &[MailAddress]) -> String {
    let joined = addresses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{joined}]")
}

fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], "")
}
