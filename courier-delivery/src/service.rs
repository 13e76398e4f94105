//! Entry point of the remote delivery engine.
//!
//! [`RemoteDelivery`] accepts mail bound for remote recipients, splits it per
//! destination domain and stores it on the outgoing queue. [`RemoteDelivery::start`]
//! wires the production DNS resolver, SMTP sender and bouncer into a
//! [`DeliveryPool`] draining that queue.

use std::{sync::Arc, time::Duration};

use courier_common::{Mail, MailAddress, internal, priority};

use crate::{
    bounce::{Bouncer, DsnBouncer},
    config::DeliveryConfiguration,
    deliverer::MailDelivrer,
    dns::{DnsError, HickoryDnsService},
    pool::DeliveryPool,
    queue::MailQueue,
    smtp_transaction::SmtpHostDelivery,
};

pub struct RemoteDelivery {
    config: Arc<DeliveryConfiguration>,
    queue: Arc<dyn MailQueue>,
    on_success: Option<Arc<dyn MailQueue>>,
}

impl RemoteDelivery {
    pub fn new(config: Arc<DeliveryConfiguration>, queue: Arc<dyn MailQueue>) -> Self {
        Self {
            config,
            queue,
            on_success: None,
        }
    }

    /// Queue receiving copies of partially delivered mail, see
    /// [`MailDelivrer::with_on_success`].
    #[must_use]
    pub fn with_on_success(mut self, queue: Arc<dyn MailQueue>) -> Self {
        self.on_success = Some(queue);
        self
    }

    /// Starts the delivery workers against the system resolver.
    ///
    /// # Errors
    ///
    /// When the DNS resolver cannot be built.
    pub fn start(&self) -> Result<DeliveryPool, DnsError> {
        let dns = Arc::new(HickoryDnsService::new(self.config.dns.clone())?);
        let bouncer: Arc<dyn Bouncer> = Arc::new(DsnBouncer::new(
            Arc::clone(&self.config),
            Arc::clone(&self.queue),
        ));
        let mut delivrer = MailDelivrer::new(
            Arc::clone(&self.config),
            dns,
            Arc::new(SmtpHostDelivery::new(Arc::clone(&self.config))),
            Arc::clone(&bouncer),
        );
        if let Some(queue) = &self.on_success {
            delivrer = delivrer.with_on_success(Arc::clone(queue));
        }
        let delivrer = Arc::new(delivrer);

        Ok(DeliveryPool::start(
            &self.config,
            &self.queue,
            &delivrer,
            &bouncer,
        ))
    }

    /// Queues `mail` for remote delivery.
    ///
    /// Without a gateway every destination domain gets its own copy, named
    /// `{name}-to-{domain}`, so that each domain is retried independently.
    pub async fn service(&self, mut mail: Mail) {
        if self.config.use_priority {
            mail.set_priority(priority::HIGH);
        }

        if mail.recipients().is_empty() {
            internal!(
                level = DEBUG,
                mail = %mail.name(),
                "No recipients, nothing to deliver"
            );
            return;
        }

        if self.config.has_gateway() {
            self.enqueue(mail).await;
            return;
        }

        for (domain, recipients) in group_by_domain(mail.recipients()) {
            let mut split = mail.with_recipients(recipients);
            split.set_name(format!("{}-to-{domain}", mail.name()));
            self.enqueue(split).await;
        }
    }

    async fn enqueue(&self, mail: Mail) {
        let name = mail.name().to_string();
        let recipients = mail.recipients().len();

        match self.queue.enqueue(mail, Duration::ZERO).await {
            Ok(()) => internal!(
                level = DEBUG,
                mail = %name,
                recipients,
                "Mail queued for remote delivery"
            ),
            Err(err) => internal!(
                level = ERROR,
                mail = %name,
                error = %err,
                "Unable to queue mail for remote delivery"
            ),
        }
    }
}

/// Recipients grouped by domain, in order of first appearance.
fn group_by_domain(recipients: &[MailAddress]) -> Vec<(String, Vec<MailAddress>)> {
    let mut groups: Vec<(String, Vec<MailAddress>)> = Vec::new();

    for recipient in recipients {
        let domain = recipient.domain();
        match groups.iter_mut().find(|(existing, _)| *existing == domain) {
            Some((_, members)) => members.push(recipient.clone()),
            None => groups.push((domain.to_string(), vec![recipient.clone()])),
        }
    }

    groups
}
