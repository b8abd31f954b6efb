// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Single-resolution cell shared between concurrent writers and readers, and
//! the resettable readiness signal built on it.

use crate::errors::LinkError;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Write-once, read-many completion cell.
///
/// The first [`resolve`](Promise::resolve) wins; later calls are no-ops that
/// return `false`. Clones share the same cell.
#[derive(Debug)]
pub struct Promise<T> {
    slot: Arc<watch::Sender<Option<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Clone + Send + Sync> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync> Promise<T> {
    /// Creates an unresolved promise.
    pub fn new() -> Self {
        Promise {
            slot: Arc::new(watch::Sender::new(None)),
        }
    }

    /// Creates an already resolved promise.
    pub fn resolved(value: T) -> Self {
        Promise {
            slot: Arc::new(watch::Sender::new(Some(value))),
        }
    }

    /// Stores `value` if nothing was stored yet.
    pub fn resolve(&self, value: T) -> bool {
        let mut value = Some(value);
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = value.take();
            true
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Returns the stored value without waiting.
    pub fn peek(&self) -> Option<T> {
        self.slot.borrow().clone()
    }

    /// Waits until the promise is resolved and returns the stored value.
    pub async fn wait(&self) -> T {
        let mut rx = self.slot.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // the sender lives as long as `self`, so this never errors
            let _ = rx.changed().await;
        }
    }
}

struct ReadinessSlot {
    current: Promise<Result<(), LinkError>>,
    closed: bool,
}

/// Resettable "resource is ready" signal.
///
/// Waiters block until [`set_ready`](Readiness::set_ready); after a
/// [`reset`](Readiness::reset) new waiters block again until the next one.
/// [`close`](Readiness::close) fails current and future waiters for good.
pub(crate) struct Readiness {
    slot: Mutex<ReadinessSlot>,
}

impl Readiness {
    pub(crate) fn new() -> Self {
        Readiness {
            slot: Mutex::new(ReadinessSlot {
                current: Promise::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReadinessSlot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_ready(&self) {
        self.lock().current.resolve(Ok(()));
    }

    /// Replaces a resolved signal with a fresh one. No-op once closed.
    pub(crate) fn reset(&self) {
        let mut slot = self.lock();
        if !slot.closed && slot.current.is_resolved() {
            slot.current = Promise::new();
        }
    }

    pub(crate) fn close(&self, err: LinkError) {
        let mut slot = self.lock();
        slot.closed = true;
        slot.current.resolve(Err(err));
    }

    /// Waits for readiness, failing with `Cancelled` when `cancellation` fires first.
    pub(crate) async fn wait(&self, cancellation: Option<&CancellationToken>) -> Result<(), LinkError> {
        let current = self.lock().current.clone();

        match cancellation {
            None => current.wait().await,
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(LinkError::Cancelled),
                res = current.wait() => res,
            },
        }
    }
}
