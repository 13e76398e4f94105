//! The queue the delivery workers pull from.
//!
//! Workers only rely on the [`MailQueue`] contract: `dequeue` waits until a
//! mail is due and hands out an exclusive lease, the lease is closed with
//! [`MailQueueItem::done`], and `enqueue` with a delay keeps a mail invisible
//! until the delay has passed.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    sync::Arc,
    time::Duration,
};

use ahash::AHashMap;
use async_trait::async_trait;
use courier_common::Mail;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{sync::Notify, time::Instant};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Mail queue is closed")]
    Closed,

    #[error("Lease for mail {0} was already released")]
    LeaseReleased(String),
}

#[async_trait]
pub trait MailQueueItem: Send {
    fn mail(&self) -> &Mail;

    /// Closes the lease. `false` hands the mail back to the queue for another
    /// attempt.
    async fn done(self: Box<Self>, success: bool) -> Result<(), QueueError>;
}

#[async_trait]
pub trait MailQueue: Send + Sync {
    /// Waits for the next due mail.
    ///
    /// # Errors
    ///
    /// [`QueueError::Closed`] once the queue is shut.
    async fn dequeue(&self) -> Result<Box<dyn MailQueueItem>, QueueError>;

    /// Makes `mail` available after `delay`.
    ///
    /// # Errors
    ///
    /// [`QueueError::Closed`] once the queue is shut.
    async fn enqueue(&self, mail: Mail, delay: Duration) -> Result<(), QueueError>;
}

struct Delayed {
    due: Instant,
    seq: u64,
    mail: Mail,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// Due mail, highest priority first and then in arrival order.
struct Ready {
    priority: i64,
    seq: u64,
    mail: Mail,
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, Reverse(self.seq)).cmp(&(other.priority, Reverse(other.seq)))
    }
}

#[derive(Default)]
struct State {
    delayed: BinaryHeap<Reverse<Delayed>>,
    ready: BinaryHeap<Ready>,
    leased: AHashMap<u64, String>,
    seq: u64,
    closed: bool,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn promote_due(&mut self, now: Instant) {
        while self
            .delayed
            .peek()
            .is_some_and(|Reverse(delayed)| delayed.due <= now)
        {
            if let Some(Reverse(delayed)) = self.delayed.pop() {
                self.ready.push(Ready {
                    priority: delayed.mail.priority(),
                    seq: delayed.seq,
                    mail: delayed.mail,
                });
            }
        }
    }
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn schedule(&self, mail: Mail, delay: Duration) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }

            let seq = state.next_seq();
            state.delayed.push(Reverse(Delayed {
                due: Instant::now() + delay,
                seq,
                mail,
            }));
        }

        self.notify.notify_waiters();
        Ok(())
    }
}

/// In-process queue with delayed visibility and priorities.
///
/// Cloning shares the same queue.
#[derive(Clone)]
pub struct MemoryMailQueue {
    shared: Arc<Shared>,
}

impl Default for MemoryMailQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMailQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Mails waiting in the queue, due or not. Leased mails are not counted.
    #[must_use]
    pub fn len(&self) -> usize {
        let state = self.shared.state.lock();
        state.delayed.len() + state.ready.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mails currently held by a worker.
    #[must_use]
    pub fn leased(&self) -> usize {
        self.shared.state.lock().leased.len()
    }

    /// Rejects further enqueues and wakes every waiting worker with
    /// [`QueueError::Closed`].
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_waiters();
    }
}

struct MemoryQueueItem {
    shared: Arc<Shared>,
    lease: u64,
    mail: Mail,
}

#[async_trait]
impl MailQueueItem for MemoryQueueItem {
    fn mail(&self) -> &Mail {
        &self.mail
    }

    async fn done(self: Box<Self>, success: bool) -> Result<(), QueueError> {
        let Self {
            shared,
            lease,
            mail,
        } = *self;

        if shared.state.lock().leased.remove(&lease).is_none() {
            return Err(QueueError::LeaseReleased(mail.name().to_string()));
        }

        if success {
            return Ok(());
        }

        shared.schedule(mail, Duration::ZERO)
    }
}

#[async_trait]
impl MailQueue for MemoryMailQueue {
    async fn dequeue(&self) -> Result<Box<dyn MailQueueItem>, QueueError> {
        loop {
            let notified = self.shared.notify.notified();

            let wake_at = {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }

                state.promote_due(Instant::now());

                if let Some(ready) = state.ready.pop() {
                    let lease = state.next_seq();
                    state.leased.insert(lease, ready.mail.name().to_string());

                    return Ok(Box::new(MemoryQueueItem {
                        shared: Arc::clone(&self.shared),
                        lease,
                        mail: ready.mail,
                    }));
                }

                state.delayed.peek().map(|Reverse(delayed)| delayed.due)
            };

            match wake_at {
                Some(due) => {
                    tokio::select! {
                        () = notified => {}
                        () = tokio::time::sleep_until(due) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn enqueue(&self, mail: Mail, delay: Duration) -> Result<(), QueueError> {
        self.shared.schedule(mail, delay)
    }
}
