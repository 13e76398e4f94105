//! The delivery worker: dequeue, deliver, then retry or bounce.

use std::{panic::AssertUnwindSafe, sync::Arc};

use courier_common::{Mail, MailState, Signal, internal, priority};
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::{
    bounce::Bouncer,
    config::DeliveryConfiguration,
    deliverer::MailDelivrer,
    metrics::DeliveryMetrics,
    queue::{MailQueue, MailQueueItem, QueueError},
    result::{DeliveryFailure, ExecutionResult, ExecutionState},
    retries,
};

#[derive(Debug, Error)]
pub enum RunnableError {
    #[error("Unable to re-queue mail for a later attempt: {0}")]
    Requeue(#[from] QueueError),
}

pub struct DeliveryRunnable {
    config: Arc<DeliveryConfiguration>,
    queue: Arc<dyn MailQueue>,
    delivrer: Arc<MailDelivrer>,
    bouncer: Arc<dyn Bouncer>,
    metrics: Arc<DeliveryMetrics>,
}

impl DeliveryRunnable {
    pub fn new(
        config: Arc<DeliveryConfiguration>,
        queue: Arc<dyn MailQueue>,
        delivrer: Arc<MailDelivrer>,
        bouncer: Arc<dyn Bouncer>,
    ) -> Self {
        Self {
            config,
            queue,
            delivrer,
            bouncer,
            metrics: Arc::new(DeliveryMetrics::new()),
        }
    }

    /// Records outcomes on `metrics` instead of a private set of counters.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<DeliveryMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &DeliveryMetrics {
        &self.metrics
    }

    /// Processes mail until `shutdown` fires or the queue closes.
    ///
    /// A signal only stops the worker between mails; a delivery that has
    /// already been dequeued always runs to completion.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<Signal>) {
        internal!("Delivery worker starting");

        loop {
            tokio::select! {
                biased;

                signal = shutdown.recv() => {
                    match signal {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!(level = DEBUG, "Delivery worker received shutdown signal");
                        }
                        Err(err) => {
                            internal!(level = ERROR, error = %err, "Delivery worker shutdown channel error");
                        }
                    }
                    break;
                }

                item = self.queue.dequeue() => {
                    match item {
                        Ok(item) => self.run_step(item).await,
                        Err(QueueError::Closed) => {
                            internal!(level = DEBUG, "Mail queue closed");
                            break;
                        }
                        Err(err) => {
                            internal!(level = ERROR, error = %err, "Unable to dequeue mail");
                        }
                    }
                }
            }
        }

        internal!("Delivery worker stopped");
    }

    /// Handles one leased mail and closes the lease exactly once.
    ///
    /// Errors and panics during the attempt hand the mail back to the queue.
    pub async fn run_step(&self, item: Box<dyn MailQueueItem>) {
        let mail = item.mail().clone();
        let name = mail.name().to_string();

        let success = match AssertUnwindSafe(self.attempt_delivery(mail))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                internal!(
                    level = ERROR,
                    mail = %name,
                    error = %err,
                    "An error occurred while processing mail"
                );
                false
            }
            Err(_) => {
                internal!(
                    level = ERROR,
                    mail = %name,
                    "Delivery attempt panicked"
                );
                false
            }
        };

        if let Err(err) = item.done(success).await {
            internal!(
                level = ERROR,
                mail = %name,
                error = %err,
                "Unable to acknowledge mail"
            );
        }
    }

    async fn attempt_delivery(&self, mut mail: Mail) -> Result<(), RunnableError> {
        let (result, recipients) = self.delivrer.deliver(&mail).await.into_parts();
        if let Some(recipients) = recipients {
            mail.set_recipients(recipients);
        }

        match result.state() {
            ExecutionState::Success => {
                internal!(
                    level = INFO,
                    mail = %mail.name(),
                    recipients = mail.recipients().len(),
                    "Mail successfully delivered"
                );
                self.metrics.record_delivered();
                Ok(())
            }
            ExecutionState::PermanentFailure => {
                self.metrics.record_failed("permanent");
                self.bounce(&mail, result.cause()).await;
                Ok(())
            }
            ExecutionState::TemporaryFailure => self.handle_temporary_failure(mail, &result).await,
        }
    }

    async fn handle_temporary_failure(
        &self,
        mut mail: Mail,
        result: &ExecutionResult,
    ) -> Result<(), RunnableError> {
        if mail.state() != MailState::Error {
            mail.set_state(MailState::Error);
            retries::initialize(&mut mail);
            mail.touch();
        }

        let retries = retries::increment(&mut mail);
        if retries >= self.config.max_retries() {
            internal!(
                level = INFO,
                mail = %mail.name(),
                retries,
                "Too many retries, bouncing"
            );

            let exhausted = DeliveryFailure::TooManyRetries {
                retries,
                last: result.shared_cause(),
            };
            self.metrics.record_failed("too_many_retries");
            self.bounce(&mail, Some(&exhausted)).await;
            return Ok(());
        }

        let delay = self.config.delays.next_delay(retries);
        if self.config.use_priority {
            mail.set_priority(priority::LOW);
        }

        internal!(
            level = DEBUG,
            mail = %mail.name(),
            retries,
            delay = ?delay,
            "Storing mail for a later attempt"
        );

        self.queue.enqueue(mail, delay).await?;
        self.metrics.record_retry(retries);
        Ok(())
    }

    async fn bounce(&self, mail: &Mail, cause: Option<&DeliveryFailure>) {
        match self.bouncer.bounce(mail, cause).await {
            Ok(()) => self.metrics.record_bounced(),
            Err(err) => {
                internal!(
                    level = WARN,
                    mail = %mail.name(),
                    error = %err,
                    "Unable to bounce mail"
                );
            }
        }
    }
}
