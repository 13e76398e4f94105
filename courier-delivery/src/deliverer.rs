//! One delivery attempt for one mail.
//!
//! The destination domain is taken from the first recipient; callers group
//! recipients by domain before queueing. Candidate hosts are tried one at a
//! time until one accepts the mail or a failure shows that trying further
//! hosts is pointless.

use std::{sync::Arc, time::Duration};

use courier_common::{Mail, MailAddress, internal};

use crate::{
    bounce::Bouncer,
    classify::{ProtocolError, SendFailure},
    composer::MessageComposer,
    config::DeliveryConfiguration,
    dns::DnsService,
    dns_helper::{DnsHelper, HostAddressIterator},
    queue::MailQueue,
    result::{DeliveryFailure, ExecutionResult},
    retries,
    smtp_transaction::HostDelivery,
};

/// The result of [`MailDelivrer::deliver`] together with the recipients the
/// mail should keep for whatever happens next (retry or bounce).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    result: ExecutionResult,
    recipients: Option<Vec<MailAddress>>,
}

impl DeliveryOutcome {
    const fn unchanged(result: ExecutionResult) -> Self {
        Self {
            result,
            recipients: None,
        }
    }

    const fn narrowed(result: ExecutionResult, recipients: Vec<MailAddress>) -> Self {
        Self {
            result,
            recipients: Some(recipients),
        }
    }

    #[must_use]
    pub const fn result(&self) -> &ExecutionResult {
        &self.result
    }

    /// `None` when the recipients of the mail are still accurate.
    #[must_use]
    pub fn remaining_recipients(&self) -> Option<&[MailAddress]> {
        self.recipients.as_deref()
    }

    #[must_use]
    pub fn into_parts(self) -> (ExecutionResult, Option<Vec<MailAddress>>) {
        (self.result, self.recipients)
    }
}

/// A failure that ended the host loop and still has to be classified.
struct Escalation {
    failure: SendFailure,
    /// Recipients no host has accepted yet.
    remaining: Vec<MailAddress>,
}

pub struct MailDelivrer {
    config: Arc<DeliveryConfiguration>,
    dns_helper: DnsHelper,
    host_delivery: Arc<dyn HostDelivery>,
    bouncer: Arc<dyn Bouncer>,
    composer: MessageComposer,
    on_success: Option<Arc<dyn MailQueue>>,
}

impl MailDelivrer {
    pub fn new(
        config: Arc<DeliveryConfiguration>,
        dns: Arc<dyn DnsService>,
        host_delivery: Arc<dyn HostDelivery>,
        bouncer: Arc<dyn Bouncer>,
    ) -> Self {
        let dns_helper = DnsHelper::new(
            dns,
            Arc::clone(&config.gateways),
            config.gateway_port,
            config.smtp_port,
        );

        Self::with_dns_helper(config, dns_helper, host_delivery, bouncer)
    }

    pub fn with_dns_helper(
        config: Arc<DeliveryConfiguration>,
        dns_helper: DnsHelper,
        host_delivery: Arc<dyn HostDelivery>,
        bouncer: Arc<dyn Bouncer>,
    ) -> Self {
        Self {
            composer: MessageComposer::new(config.helo_name.clone()),
            config,
            dns_helper,
            host_delivery,
            bouncer,
            on_success: None,
        }
    }

    /// When a host accepts only some recipients, a copy of the mail
    /// addressed to just those recipients is queued on `queue`.
    #[must_use]
    pub fn with_on_success(mut self, queue: Arc<dyn MailQueue>) -> Self {
        self.on_success = Some(queue);
        self
    }

    /// Attempts delivery of `mail` to every one of its recipients.
    ///
    /// Never fails: every problem is folded into the returned outcome.
    pub async fn deliver(&self, mail: &Mail) -> DeliveryOutcome {
        let Escalation { failure, remaining } = match self.try_deliver(mail).await {
            Ok(outcome) => return outcome,
            Err(escalation) => escalation,
        };

        let narrowed = |result| {
            if remaining.as_slice() == mail.recipients() {
                DeliveryOutcome::unchanged(result)
            } else {
                DeliveryOutcome::narrowed(result, remaining.clone())
            }
        };

        match failure {
            SendFailure::Partial { .. } => {
                self.handle_sender_failed(mail, failure, narrowed).await
            }
            SendFailure::Protocol(_) | SendFailure::Connection(_) => {
                let permanent = failure.is_server_error();
                self.log_and_return(mail, narrowed(ExecutionResult::on_failure(permanent, failure)))
            }
            SendFailure::Unknown(ref message) => {
                internal!(
                    level = ERROR,
                    mail = %mail.name(),
                    error = %message,
                    "Generic exception = permanent failure"
                );
                self.log_and_return(mail, narrowed(ExecutionResult::permanent_failure(failure)))
            }
        }
    }

    async fn try_deliver(&self, mail: &Mail) -> Result<DeliveryOutcome, Escalation> {
        let Some(first) = mail.recipients().first() else {
            internal!(
                level = INFO,
                mail = %mail.name(),
                "No recipients specified... not sure how this could have happened"
            );
            return Ok(DeliveryOutcome::unchanged(ExecutionResult::permanent_failure(
                DeliveryFailure::NoRecipients {
                    mail: mail.name().to_string(),
                    sender: mail.sender_or_null(),
                },
            )));
        };

        if self.config.debug {
            internal!(level = DEBUG, mail = %mail.name(), "Attempting to deliver");
        }

        let domain = first.domain();
        let mut targets = match self.dns_helper.retrieve_host_address_iterator(domain).await {
            Ok(targets) => targets,
            Err(err) => {
                return Ok(self.log_and_return(
                    mail,
                    DeliveryOutcome::unchanged(ExecutionResult::temporary_failure(
                        DeliveryFailure::ResolutionFailure {
                            domain: domain.to_string(),
                            reason: err.to_string(),
                        },
                    )),
                ));
            }
        };

        if !targets.has_next().await {
            return Ok(self.handle_no_target_server(mail, domain));
        }

        self.do_deliver(mail, domain, &mut targets).await
    }

    async fn do_deliver(
        &self,
        mail: &Mail,
        domain: &str,
        targets: &mut HostAddressIterator,
    ) -> Result<DeliveryOutcome, Escalation> {
        let mut remaining = mail.recipients().to_vec();
        let mut last_error = None;

        while let Some(host) = targets.next().await {
            let failure = match self
                .host_delivery
                .try_delivery_to_host(mail, &remaining, &host)
                .await
            {
                Ok(()) => return Ok(DeliveryOutcome::unchanged(ExecutionResult::success())),
                Err(failure) => failure,
            };

            match failure {
                SendFailure::Partial { .. } => {
                    self.log_send_failed(&failure);

                    if !failure.valid_sent().is_empty() {
                        internal!(
                            level = DEBUG,
                            mail = %mail.name(),
                            host = %host,
                            sent = ?failure.valid_sent(),
                            "Mail sent successfully for some recipients"
                        );
                        self.notify_delivered(mail, failure.valid_sent()).await;
                        remaining.retain(|address| !failure.valid_sent().contains(address));
                    }

                    if failure.is_server_error() || failure.valid_unsent().is_empty() {
                        return Err(Escalation { failure, remaining });
                    }

                    if self.config.debug {
                        internal!(
                            level = DEBUG,
                            mail = %mail.name(),
                            unsent = ?failure.valid_unsent(),
                            "Send failed, valid addresses remain, continuing with any other servers"
                        );
                    }
                    last_error = Some(failure);
                }
                SendFailure::Connection(ref error) => {
                    if self.config.debug {
                        internal!(
                            level = DEBUG,
                            mail = %mail.name(),
                            host = %host,
                            error = %error,
                            "Exception delivering message"
                        );
                    } else {
                        internal!(level = INFO, host = %host, error = %error, "Host unavailable");
                    }
                    last_error = Some(failure);
                }
                SendFailure::Protocol(_) | SendFailure::Unknown(_) => {
                    internal!(
                        level = DEBUG,
                        mail = %mail.name(),
                        host = %host,
                        error = %failure,
                        "Exception delivering message"
                    );
                    return Err(Escalation { failure, remaining });
                }
            }
        }

        match last_error {
            Some(failure) => Err(Escalation { failure, remaining }),
            None => Ok(DeliveryOutcome::unchanged(ExecutionResult::temporary_failure(
                DeliveryFailure::NoServerAvailable {
                    domain: domain.to_string(),
                },
            ))),
        }
    }

    /// Splits a partial failure: permanently refused addresses are bounced
    /// right away, the rest stays for a later attempt.
    async fn handle_sender_failed(
        &self,
        mail: &Mail,
        failure: SendFailure,
        narrowed: impl Fn(ExecutionResult) -> DeliveryOutcome,
    ) -> DeliveryOutcome {
        self.log_send_failed(&failure);

        let invalid = failure.invalid().to_vec();
        let valid_unsent = failure.valid_unsent().to_vec();

        if self.config.debug {
            internal!(
                level = DEBUG,
                mail = %mail.name(),
                recipients = ?mail.recipients(),
                invalid = ?invalid,
                unsent = ?valid_unsent,
                "Recipients before narrowing"
            );
        }

        if !valid_unsent.is_empty() {
            if !invalid.is_empty() {
                let rejected = mail.with_recipients(invalid);
                let cause = DeliveryFailure::Send(failure.clone());

                if let Err(err) = self.bouncer.bounce(&rejected, Some(&cause)).await {
                    internal!(
                        level = WARN,
                        mail = %mail.name(),
                        error = %err,
                        "Failed bouncing permanently failed recipients, returning full temporary failure instead"
                    );
                    return self.log_and_return(mail, narrowed(ExecutionResult::temporary_failure(failure)));
                }
            }

            let result = if failure.has_return_code() {
                let permanent = failure.is_server_error();
                ExecutionResult::on_failure(permanent, failure)
            } else {
                ExecutionResult::temporary_failure(failure)
            };

            return self.log_and_return(mail, DeliveryOutcome::narrowed(result, valid_unsent));
        }

        if !invalid.is_empty() {
            return self.log_and_return(
                mail,
                DeliveryOutcome::narrowed(ExecutionResult::permanent_failure(failure), invalid),
            );
        }

        if (failure.has_return_code() || failure.has_nested_return_code()) && failure.is_server_error() {
            return narrowed(ExecutionResult::permanent_failure(failure));
        }

        narrowed(ExecutionResult::temporary_failure(failure))
    }

    fn handle_no_target_server(&self, mail: &Mail, domain: &str) -> DeliveryOutcome {
        internal!(level = INFO, domain, "No mail server found");

        let failure = DeliveryFailure::NoRouteFound {
            domain: domain.to_string(),
        };
        let permanent = retries::retrieve(mail) >= self.config.dns_problem_retry;

        self.log_and_return(
            mail,
            DeliveryOutcome::unchanged(ExecutionResult::on_failure(permanent, failure)),
        )
    }

    fn log_and_return(&self, mail: &Mail, outcome: DeliveryOutcome) -> DeliveryOutcome {
        internal!(
            level = DEBUG,
            "{}",
            self.composer.compose_fail_log_message(mail, outcome.result())
        );
        outcome
    }

    fn log_send_failed(&self, failure: &SendFailure) {
        if !self.config.debug {
            return;
        }

        let Some(error) = failure.protocol_error() else {
            internal!(level = INFO, error = %failure, "Send failed");
            return;
        };

        if let Some(code) = error.code {
            internal!(
                level = INFO,
                command = ?error.compute_command(),
                code,
                response = %error.message,
                "SMTP SEND FAILED"
            );
        } else {
            internal!(level = INFO, error = %error, "Send failed");
        }

        for nested in error.nested().filter(|nested| nested.address.is_some()) {
            log_address_failure(nested);
        }
    }

    async fn notify_delivered(&self, mail: &Mail, delivered: &[MailAddress]) {
        let Some(queue) = &self.on_success else {
            return;
        };

        let copy = mail.with_recipients(delivered.to_vec());
        if let Err(err) = queue.enqueue(copy, Duration::ZERO).await {
            internal!(
                level = WARN,
                mail = %mail.name(),
                error = %err,
                "Unable to hand delivered recipients to the success queue"
            );
        }
    }
}

fn log_address_failure(error: &ProtocolError) {
    internal!(
        level = DEBUG,
        action = ?error.compute_action(),
        address = ?error.compute_address().map(ToString::to_string),
        command = ?error.compute_command(),
        code = ?error.code,
        response = %error.message,
        "ADDRESS"
    );
}
