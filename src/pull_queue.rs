// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pull-Consumer Queue
//!
//! Unbounded FIFO hand-off between the delivery stream and application takers.
//!
//! Every queued item pairs a [`ConsumedMessage`] with the promise of its
//! [`AckOutcome`]. An item leaves the queue exactly once, through one of three
//! mutually exclusive paths serialized by the queue's list mutex:
//!
//! * a taker pops it and the application settles the outcome,
//! * the message's own cancellation fires first and the outcome becomes `Cancelled`,
//! * the queue is disposed and the outcome becomes `Disposed`.
//!
//! Enqueueing needs no runtime and spawns nothing. A cancelled item is unlinked
//! by whoever notices first: a [`QueuedOutcome::wait`] on it, a taker reaching
//! it, or [`PullConsumerQueue::len`].

use crate::{
    errors::LinkError,
    message::{AckOutcome, ConsumedMessage, PulledMessage},
    promise::Promise,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, Weak},
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct QueueItem {
    message: ConsumedMessage,
    outcome: Promise<AckOutcome>,
}

/// Outcome of a message handed to [`PullConsumerQueue::put`].
pub struct QueuedOutcome {
    outcome: Promise<AckOutcome>,
    entry: Option<QueueEntry>,
}

/// Where a queued message lives, to unlink it once its cancellation fires.
struct QueueEntry {
    queue: Weak<QueueInner>,
    seq: u64,
    cancellation: CancellationToken,
}

impl QueuedOutcome {
    fn resolved(outcome: AckOutcome) -> Self {
        QueuedOutcome {
            outcome: Promise::resolved(outcome),
            entry: None,
        }
    }

    /// Returns the outcome if already known.
    pub fn peek(&self) -> Option<AckOutcome> {
        self.outcome.peek()
    }

    /// Waits for the outcome.
    ///
    /// Resolves with `Cancelled` as soon as the message's cancellation fires
    /// while it is still queued.
    pub async fn wait(&self) -> AckOutcome {
        if let Some(entry) = &self.entry {
            tokio::select! {
                biased;
                outcome = self.outcome.wait() => return outcome,
                _ = entry.cancellation.cancelled() => {
                    if let Some(queue) = entry.queue.upgrade() {
                        queue.cancel_item(entry.seq);
                    }
                }
            }
        }

        // taken before the cancellation fired: the application settles it
        self.outcome.wait().await
    }
}

#[derive(Default)]
struct Items {
    next_seq: u64,
    list: BTreeMap<u64, QueueItem>,
}

struct QueueInner {
    items: Mutex<Items>,
    /// One permit per successful enqueue; may run ahead of the list after cancellations
    available: Semaphore,
    disposed: CancellationToken,
    sync: Mutex<()>,
}

/// Handle of a pull-consumer queue. Clones share the same queue.
#[derive(Clone)]
pub struct PullConsumerQueue {
    inner: Arc<QueueInner>,
}

impl Default for PullConsumerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PullConsumerQueue {
    pub fn new() -> Self {
        PullConsumerQueue {
            inner: Arc::new(QueueInner {
                items: Mutex::new(Items::default()),
                available: Semaphore::new(0),
                disposed: CancellationToken::new(),
                sync: Mutex::new(()),
            }),
        }
    }

    /// Enqueues a delivered message and returns its pending outcome.
    ///
    /// The outcome is already resolved with `Cancelled` when the message's
    /// cancellation fired, and with `Disposed` when the queue is disposed.
    pub fn put(&self, message: ConsumedMessage) -> QueuedOutcome {
        if message.cancellation.is_cancelled() {
            return QueuedOutcome::resolved(Err(LinkError::Cancelled));
        }

        let outcome = Promise::new();

        let seq = {
            let mut items = self.inner.lock_items();
            if self.inner.disposed.is_cancelled() {
                return QueuedOutcome::resolved(Err(LinkError::Disposed));
            }

            let seq = items.next_seq;
            items.next_seq += 1;
            items.list.insert(
                seq,
                QueueItem {
                    message: message.clone(),
                    outcome: outcome.clone(),
                },
            );
            seq
        };

        self.inner.available.add_permits(1);

        QueuedOutcome {
            outcome,
            entry: Some(QueueEntry {
                queue: Arc::downgrade(&self.inner),
                seq,
                cancellation: message.cancellation,
            }),
        }
    }

    /// Takes the oldest message still queued, waiting for one if needed.
    ///
    /// Fails with `Cancelled` when `cancellation` fires first and with
    /// `Disposed` when the queue is (or gets) disposed.
    pub async fn take(&self, cancellation: &CancellationToken) -> Result<PulledMessage, LinkError> {
        loop {
            if cancellation.is_cancelled() {
                return Err(LinkError::Cancelled);
            }
            if self.inner.disposed.is_cancelled() {
                return Err(LinkError::Disposed);
            }

            let permit = tokio::select! {
                biased;
                _ = self.inner.disposed.cancelled() => return Err(LinkError::Disposed),
                _ = cancellation.cancelled() => return Err(LinkError::Cancelled),
                permit = self.inner.available.acquire() => permit,
            };

            match permit {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(LinkError::Disposed),
            }

            let Some((_, item)) = self.inner.lock_items().list.pop_first() else {
                // the item behind this permit was cancelled
                continue;
            };

            if item.message.cancellation.is_cancelled() {
                item.outcome.resolve(Err(LinkError::Cancelled));
                continue;
            }

            return Ok(PulledMessage::new(item.message, item.outcome));
        }
    }

    /// Number of messages waiting to be taken. Cancelled ones are unlinked first.
    pub fn len(&self) -> usize {
        let mut items = self.inner.lock_items();
        items.list.retain(|_, item| {
            if item.message.cancellation.is_cancelled() {
                item.outcome.resolve(Err(LinkError::Cancelled));
                return false;
            }
            true
        });
        items.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.is_cancelled()
    }

    /// Resolves every queued message as `Disposed` and fails current and future takers.
    /// Idempotent.
    pub fn dispose(&self) {
        let _guard = self
            .inner
            .sync
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if self.inner.disposed.is_cancelled() {
            return;
        }
        self.inner.disposed.cancel();

        let drained = std::mem::take(&mut self.inner.lock_items().list);
        debug!(items = drained.len(), "disposing pull queue");

        for item in drained.into_values() {
            item.outcome.resolve(Err(LinkError::Disposed));
        }

        self.inner.available.close();
    }
}

impl QueueInner {
    fn lock_items(&self) -> MutexGuard<'_, Items> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cancel_item(&self, seq: u64) {
        let removed = self.lock_items().list.remove(&seq);
        if let Some(item) = removed {
            item.outcome.resolve(Err(LinkError::Cancelled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AckStrategy, ReceiveProperties};
    use lapin::BasicProperties;
    use std::time::Duration;

    fn message(body: &str) -> ConsumedMessage {
        ConsumedMessage::new(
            body.as_bytes().to_vec(),
            BasicProperties::default(),
            ReceiveProperties::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn should_skip_cancelled_items_and_keep_order() {
        let queue = PullConsumerQueue::new();
        let token = CancellationToken::new();

        let a = message("a");
        let b = message("b");
        let c = message("c");
        let cancel_b = b.cancellation.clone();

        queue.put(a);
        let b_outcome = queue.put(b);
        queue.put(c);

        cancel_b.cancel();

        let first = queue.take(&token).await.unwrap();
        let second = queue.take(&token).await.unwrap();
        assert_eq!(first.body, b"a".to_vec());
        assert_eq!(second.body, b"c".to_vec());
        first.ack();
        second.ack();

        let third = tokio::time::timeout(Duration::from_millis(50), queue.take(&token)).await;
        assert!(third.is_err());
        assert_eq!(b_outcome.wait().await, Err(LinkError::Cancelled));
    }

    #[tokio::test]
    async fn should_not_return_cancelled_item_to_blocked_taker() {
        let queue = PullConsumerQueue::new();
        let token = CancellationToken::new();

        let a = message("a");
        let b = message("b");
        let cancel_b = b.cancellation.clone();
        queue.put(a);
        queue.put(b);
        cancel_b.cancel();

        let first = queue.take(&token).await.unwrap();
        assert_eq!(first.body, b"a".to_vec());
        first.ack();

        let taker = {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.take(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!taker.is_finished());

        queue.put(message("d"));
        let next = taker.await.unwrap().unwrap();
        assert_eq!(next.body, b"d".to_vec());
        next.ack();
    }

    #[tokio::test]
    async fn should_deliver_settlement_to_putter() {
        let queue = PullConsumerQueue::new();
        let outcome = queue.put(message("a"));

        let msg = queue.take(&CancellationToken::new()).await.unwrap();
        msg.nack();

        assert_eq!(outcome.wait().await, Ok(AckStrategy::Nack));
    }

    #[tokio::test]
    async fn should_resolve_already_cancelled_message_immediately() {
        let queue = PullConsumerQueue::new();
        let msg = message("a");
        msg.cancellation.cancel();

        let outcome = queue.put(msg);

        assert_eq!(outcome.peek(), Some(Err(LinkError::Cancelled)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn should_ignore_cancellation_after_take() {
        let queue = PullConsumerQueue::new();
        let msg = message("a");
        let cancel = msg.cancellation.clone();
        let outcome = queue.put(msg);

        let taken = queue.take(&CancellationToken::new()).await.unwrap();
        cancel.cancel();
        tokio::task::yield_now().await;

        assert!(taken.ack());
        assert_eq!(outcome.wait().await, Ok(AckStrategy::Ack));
    }

    #[tokio::test]
    async fn should_fail_take_on_caller_cancellation() {
        let queue = PullConsumerQueue::new();
        let token = CancellationToken::new();

        let taker = {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.take(&token).await })
        };
        tokio::task::yield_now().await;
        token.cancel();

        assert_eq!(taker.await.unwrap().unwrap_err(), LinkError::Cancelled);

        // the queue itself is unaffected
        queue.put(message("a"));
        let msg = queue.take(&CancellationToken::new()).await.unwrap();
        msg.ack();
    }

    #[tokio::test]
    async fn should_drain_on_dispose() {
        let queue = PullConsumerQueue::new();
        let a = queue.put(message("a"));
        let b = queue.put(message("b"));

        queue.dispose();
        queue.dispose();

        assert_eq!(a.wait().await, Err(LinkError::Disposed));
        assert_eq!(b.wait().await, Err(LinkError::Disposed));
        assert!(queue.is_empty());

        assert_eq!(
            queue.put(message("c")).peek(),
            Some(Err(LinkError::Disposed))
        );
        assert_eq!(
            queue.take(&CancellationToken::new()).await.unwrap_err(),
            LinkError::Disposed
        );
        assert!(queue.is_disposed());
    }

    #[tokio::test]
    async fn should_wake_blocked_taker_on_dispose() {
        let queue = PullConsumerQueue::new();

        let taker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take(&CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;
        queue.dispose();

        assert_eq!(taker.await.unwrap().unwrap_err(), LinkError::Disposed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn should_remove_each_item_exactly_once_under_races() {
        const ITEMS: usize = 200;

        let queue = PullConsumerQueue::new();
        let mut cancels = Vec::with_capacity(ITEMS);
        let mut outcomes = Vec::with_capacity(ITEMS);

        for i in 0..ITEMS {
            let msg = message(&i.to_string());
            cancels.push(msg.cancellation.clone());
            outcomes.push(queue.put(msg));
        }

        let canceller = tokio::spawn(async move {
            for (i, cancel) in cancels.into_iter().enumerate() {
                if i % 2 == 0 {
                    cancel.cancel();
                }
                tokio::task::yield_now().await;
            }
        });

        let taker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let token = CancellationToken::new();
                let mut taken = 0;
                while let Ok(Ok(msg)) =
                    tokio::time::timeout(Duration::from_millis(100), queue.take(&token)).await
                {
                    assert!(msg.ack(), "taken message was already settled");
                    taken += 1;
                }
                taken
            })
        };

        canceller.await.unwrap();
        let taken = taker.await.unwrap();

        let mut acked = 0;
        let mut cancelled = 0;
        for outcome in outcomes {
            match outcome.wait().await {
                Ok(AckStrategy::Ack) => acked += 1,
                Err(LinkError::Cancelled) => cancelled += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        assert_eq!(acked, taken);
        assert_eq!(acked + cancelled, ITEMS);
        assert!(queue.is_empty());
    }

    #[test]
    fn should_enqueue_and_cancel_without_runtime() {
        let queue = PullConsumerQueue::new();
        let a = queue.put(message("a"));
        let b_msg = message("b");
        let cancel_b = b_msg.cancellation.clone();
        let b = queue.put(b_msg);

        cancel_b.cancel();

        assert_eq!(queue.len(), 1);
        assert_eq!(b.peek(), Some(Err(LinkError::Cancelled)));
        assert_eq!(a.peek(), None);

        queue.dispose();
        assert_eq!(a.peek(), Some(Err(LinkError::Disposed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn should_settle_each_item_once_when_disposed_amid_takes_and_cancellations() {
        const ROUNDS: usize = 20;
        const ITEMS: usize = 150;

        for _ in 0..ROUNDS {
            let queue = PullConsumerQueue::new();
            let mut cancels = Vec::with_capacity(ITEMS);
            let mut waiters = Vec::with_capacity(ITEMS);

            for i in 0..ITEMS {
                let msg = message(&i.to_string());
                cancels.push(msg.cancellation.clone());
                let outcome = queue.put(msg);
                waiters.push(tokio::spawn(async move { outcome.wait().await }));
            }

            let takers: Vec<_> = (0..2)
                .map(|_| {
                    let queue = queue.clone();
                    tokio::spawn(async move {
                        let token = CancellationToken::new();
                        let mut taken = 0;
                        while let Ok(msg) = queue.take(&token).await {
                            assert!(msg.ack(), "taken message was already settled");
                            taken += 1;
                            tokio::task::yield_now().await;
                        }
                        taken
                    })
                })
                .collect();

            let canceller = tokio::spawn(async move {
                for (i, cancel) in cancels.into_iter().enumerate() {
                    if i % 3 == 0 {
                        cancel.cancel();
                    }
                    tokio::task::yield_now().await;
                }
            });

            let disposer = {
                let queue = queue.clone();
                tokio::spawn(async move {
                    for _ in 0..ITEMS / 2 {
                        tokio::task::yield_now().await;
                    }
                    queue.dispose();
                })
            };

            disposer.await.unwrap();
            canceller.await.unwrap();
            let mut taken = 0;
            for taker in takers {
                taken += taker.await.unwrap();
            }

            let (mut acked, mut cancelled, mut disposed) = (0, 0, 0);
            for waiter in waiters {
                match waiter.await.unwrap() {
                    Ok(AckStrategy::Ack) => acked += 1,
                    Err(LinkError::Cancelled) => cancelled += 1,
                    Err(LinkError::Disposed) => disposed += 1,
                    other => panic!("unexpected outcome {other:?}"),
                }
            }

            assert_eq!(acked, taken);
            assert_eq!(acked + cancelled + disposed, ITEMS);
            assert!(queue.is_empty());
        }
    }
}
