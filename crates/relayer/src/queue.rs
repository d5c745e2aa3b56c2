//! Single-consumer work queue shared by the proof and delivery stages.
//!
//! Items are appended at the tail by any number of producers. At most one
//! consumer task drains a queue at a time; it is spawned on demand by
//! `submit` and exits once the queue is empty. Transient failures put the
//! unchanged item back at the head, parked until its backoff elapses, so
//! later items may overtake it.

use async_trait::async_trait;
use rand::Rng;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Notify},
    time::Instant,
};
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::types::{Disposition, RelayerError};

/// Producer side of a stage.
pub trait RelaySink<T>: Send + Sync {
    fn submit(&self, item: T);
}

impl<T: Send> RelaySink<T> for mpsc::UnboundedSender<T> {
    fn submit(&self, item: T) {
        if self.send(item).is_err() {
            warn!("Downstream receiver dropped, discarding item");
        }
    }
}

/// Per-item work done by a stage.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    type Item: Send + Sync + 'static;

    /// Stage name used in logs.
    const NAME: &'static str;

    /// Span carrying the item's correlation fields.
    fn span(&self, item: &Self::Item) -> Span;

    async fn process(&self, item: &Self::Item) -> Result<(), RelayerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Unlimited when `None`.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Requeue without delay and never give up.
    pub const IMMEDIATE: Self = Self {
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        max_attempts: None,
    };

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    /// Exponential delay for the given failed attempt (1-based), capped and
    /// jittered over its upper half.
    pub fn backoff(&self, attempts: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempts.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay.max(self.base_delay));
        let half = delay / 2;
        half + rand::thread_rng().gen_range(Duration::ZERO..=half)
    }
}

struct Pending<T> {
    item: T,
    attempts: u32,
    ready_at: Option<Instant>,
}

enum Next<T> {
    Ready(Pending<T>),
    Wait(Instant),
    Empty,
}

pub struct WorkQueue<P: Processor> {
    processor: P,
    policy: RetryPolicy,
    items: Mutex<VecDeque<Pending<P::Item>>>,
    draining: AtomicBool,
    wake: Notify,
    idle: Notify,
}

impl<P: Processor> WorkQueue<P> {
    pub fn new(processor: P, policy: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            processor,
            policy,
            items: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            wake: Notify::new(),
            idle: Notify::new(),
        })
    }

    /// Append at the tail and make sure a consumer is running.
    pub fn submit(self: &Arc<Self>, item: P::Item) {
        self.items().push_back(Pending {
            item,
            attempts: 0,
            ready_at: None,
        });
        self.wake.notify_one();
        self.ensure_consumer();
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Resolves once nothing is queued and no consumer is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so an exit in between is not missed.
            notified.as_mut().enable();
            if !self.is_draining() && self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<Pending<P::Item>>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_claim(&self) -> bool {
        self.draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn ensure_consumer(self: &Arc<Self>) {
        if self.try_claim() {
            let queue = Arc::clone(self);
            tokio::spawn(async move { queue.drain().await });
        }
    }

    async fn drain(self: Arc<Self>) {
        debug!(stage = P::NAME, "Consumer started");
        loop {
            match self.next_ready(Instant::now()) {
                Next::Ready(pending) => {
                    self.handle(pending).await;
                    tokio::task::yield_now().await;
                }
                Next::Wait(until) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(until) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                Next::Empty => {
                    self.draining.store(false, Ordering::Release);
                    // A submit may have landed between the empty check and the release.
                    if self.is_empty() || !self.try_claim() {
                        break;
                    }
                }
            }
        }
        debug!(stage = P::NAME, "Consumer idle");
        self.idle.notify_waiters();
    }

    fn next_ready(&self, now: Instant) -> Next<P::Item> {
        let mut items = self.items();
        match items
            .iter()
            .position(|p| p.ready_at.map_or(true, |at| at <= now))
        {
            Some(index) => items.remove(index).map_or(Next::Empty, Next::Ready),
            None => items
                .iter()
                .filter_map(|p| p.ready_at)
                .min()
                .map_or(Next::Empty, Next::Wait),
        }
    }

    async fn handle(&self, pending: Pending<P::Item>) {
        let span = self.processor.span(&pending.item);
        let result = self
            .processor
            .process(&pending.item)
            .instrument(span.clone())
            .await;
        if let Err(err) = result {
            span.in_scope(|| self.settle(pending, err));
        }
    }

    fn settle(&self, mut pending: Pending<P::Item>, err: RelayerError) {
        if err.disposition() == Disposition::Drop {
            log_drop(P::NAME, &err);
            return;
        }

        pending.attempts += 1;
        if self.policy.exhausted(pending.attempts) {
            error!(
                stage = P::NAME,
                attempts = pending.attempts,
                error = %err,
                "Retry limit reached, abandoning item"
            );
            return;
        }

        let delay = self.policy.backoff(pending.attempts);
        warn!(
            stage = P::NAME,
            attempts = pending.attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient failure, requeueing at head"
        );
        pending.ready_at = (!delay.is_zero()).then(|| Instant::now() + delay);
        self.items().push_front(pending);
    }
}

fn log_drop(stage: &'static str, err: &RelayerError) {
    match err {
        RelayerError::AlreadyKnown(_) => {
            info!(stage, error = %err, "Action already applied elsewhere, dropping")
        }
        RelayerError::Malformed(_) => {
            error!(stage, error = %err, "🚨 MALFORMED PAYLOAD, dropping without retry")
        }
        _ => error!(stage, error = %err, "Terminal failure, dropping"),
    }
}
