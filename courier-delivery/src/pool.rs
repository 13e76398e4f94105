use std::sync::Arc;

use courier_common::{Signal, internal};
use tokio::{sync::broadcast, task::JoinSet};

use crate::{
    bounce::Bouncer, config::DeliveryConfiguration, deliverer::MailDelivrer,
    metrics::DeliveryMetrics, queue::MailQueue, runnable::DeliveryRunnable,
};

/// A fixed set of [`DeliveryRunnable`]s sharing one queue.
pub struct DeliveryPool {
    workers: JoinSet<()>,
    shutdown: broadcast::Sender<Signal>,
    metrics: Arc<DeliveryMetrics>,
}

impl DeliveryPool {
    /// Spawns `config.workers` workers on the current runtime.
    pub fn start(
        config: &Arc<DeliveryConfiguration>,
        queue: &Arc<dyn MailQueue>,
        delivrer: &Arc<MailDelivrer>,
        bouncer: &Arc<dyn Bouncer>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(16);
        let mut workers = JoinSet::new();
        let metrics = Arc::new(DeliveryMetrics::new());

        for worker in 0..config.workers {
            let runnable = DeliveryRunnable::new(
                Arc::clone(config),
                Arc::clone(queue),
                Arc::clone(delivrer),
                Arc::clone(bouncer),
            )
            .with_metrics(Arc::clone(&metrics));
            let receiver = shutdown.subscribe();

            workers.spawn(async move {
                internal!(level = DEBUG, worker, "Spawned delivery worker");
                runnable.run(receiver).await;
            });
        }

        internal!(level = INFO, workers = config.workers, "Remote delivery started");

        Self {
            workers,
            shutdown,
            metrics,
        }
    }

    /// Counters shared by every worker of this pool.
    pub fn metrics(&self) -> Arc<DeliveryMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Signals every worker and waits for in-flight deliveries to finish.
    pub async fn shutdown(self) {
        if self.shutdown.send(Signal::Shutdown).is_err() {
            internal!(level = DEBUG, "All delivery workers already stopped");
        }

        self.join().await;
    }

    /// Waits for the workers without signalling them, e.g. after the queue
    /// has been closed.
    pub async fn join(mut self) {
        while let Some(joined) = self.workers.join_next().await {
            if let Err(err) = joined {
                internal!(level = ERROR, error = %err, "Delivery worker failed");
            }
        }

        internal!(level = INFO, "Remote delivery stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::RemoteDeliveryConfig,
        queue::MemoryMailQueue,
        test_support::{Mx, RecordingBouncer, ScriptedHosts, config, delivrer, mail},
    };

    fn pool(
        workers: usize,
        hosts: Arc<ScriptedHosts>,
    ) -> (DeliveryPool, MemoryMailQueue, Arc<RecordingBouncer>) {
        let config = config(RemoteDeliveryConfig {
            workers,
            ..RemoteDeliveryConfig::default()
        });
        let queue = MemoryMailQueue::new();
        let bouncer = Arc::new(RecordingBouncer::default());
        let bouncer_dyn: Arc<dyn Bouncer> = Arc::clone(&bouncer) as Arc<dyn Bouncer>;
        let delivrer = Arc::new(delivrer(&config, Mx::Hosts(1), hosts, Arc::clone(&bouncer_dyn)));
        let queue_dyn: Arc<dyn MailQueue> = Arc::new(queue.clone());

        (
            DeliveryPool::start(&config, &queue_dyn, &delivrer, &bouncer_dyn),
            queue,
            bouncer,
        )
    }

    #[tokio::test]
    async fn spawns_the_configured_number_of_workers() {
        let (pool, _queue, _bouncer) = pool(3, ScriptedHosts::new([]));
        assert_eq!(pool.len(), 3);

        tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn workers_drain_the_queue_until_it_closes() {
        let hosts = ScriptedHosts::new([]);
        let (pool, queue, bouncer) = pool(2, Arc::clone(&hosts));

        for n in 0..4 {
            let mut mail = mail(&["rcpt@example.com"]);
            mail.set_name(format!("mail-{n}"));
            queue.enqueue(mail, Duration::ZERO).await.unwrap();
        }

        while !queue.is_empty() || queue.leased() > 0 {
            tokio::task::yield_now().await;
        }
        queue.close();

        let metrics = pool.metrics();
        tokio::time::timeout(Duration::from_secs(5), pool.join())
            .await
            .unwrap();

        assert_eq!(hosts.attempts(), 4);
        assert_eq!(bouncer.calls(), 0);
        assert_eq!(metrics.delivered(), 4);
    }
}
