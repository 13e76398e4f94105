//! Delivery outcome counters
//!
//! Each outcome is recorded on an OpenTelemetry counter under the
//! `courier.delivery` meter, and mirrored in a local count so a running pool
//! can be inspected without an exporter installed.

use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Meter},
};

#[derive(Debug)]
pub struct DeliveryMetrics {
    /// Mails delivered to every remaining recipient
    messages_delivered: Counter<u64>,

    /// Mails that failed permanently
    messages_failed: Counter<u64>,

    /// Mails re-queued after a temporary failure
    messages_retrying: Counter<u64>,

    /// Delivery status notifications handed to the bouncer
    messages_bounced: Counter<u64>,

    delivered: AtomicU64,
    failed: AtomicU64,
    retrying: AtomicU64,
    bounced: AtomicU64,
}

impl DeliveryMetrics {
    #[must_use]
    pub fn new() -> Self {
        let meter = meter();

        let messages_delivered = meter
            .u64_counter("courier.delivery.messages.delivered.total")
            .with_description("Total number of messages delivered successfully")
            .build();

        let messages_failed = meter
            .u64_counter("courier.delivery.messages.failed.total")
            .with_description("Total number of messages permanently failed")
            .build();

        let messages_retrying = meter
            .u64_counter("courier.delivery.messages.retrying.total")
            .with_description("Total number of messages re-queued for a retry")
            .build();

        let messages_bounced = meter
            .u64_counter("courier.delivery.messages.bounced.total")
            .with_description("Total number of messages bounced to their sender")
            .build();

        Self {
            messages_delivered,
            messages_failed,
            messages_retrying,
            messages_bounced,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retrying: AtomicU64::new(0),
            bounced: AtomicU64::new(0),
        }
    }

    pub fn record_delivered(&self) {
        self.messages_delivered.add(1, &[]);
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// `reason` is either `permanent` or `too_many_retries`.
    pub fn record_failed(&self, reason: &'static str) {
        self.messages_failed.add(1, &[KeyValue::new("reason", reason)]);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self, retry: u32) {
        self.messages_retrying.add(1, &[KeyValue::new("retry", i64::from(retry))]);
        self.retrying.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bounced(&self) {
        self.messages_bounced.add(1, &[]);
        self.bounced.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn retrying(&self) -> u64 {
        self.retrying.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bounced(&self) -> u64 {
        self.bounced.load(Ordering::Relaxed)
    }
}

impl Default for DeliveryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn meter() -> Meter {
    opentelemetry::global::meter("courier.delivery")
}
