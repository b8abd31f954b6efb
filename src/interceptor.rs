// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Interceptor Pipelines
//!
//! Ordered chains of transform steps wrapped around the terminal action of the
//! delivery path (hand the message to the application) and of the publish path
//! (send it to the broker).
//!
//! Each step receives the message, the caller's cancellation and `next`, the
//! rest of the chain. `next` is a `FnOnce`: a step forwards at most once, or
//! short-circuits by producing its own result without calling it.

use crate::{
    errors::LinkError,
    message::{AckStrategy, ConsumedMessage, PublishMessage},
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, FutureExt};
use std::{future::Future, sync::Arc};
use tokio_util::sync::CancellationToken;

/// Remainder of a pipeline as seen by a step.
pub type Next<'a, M, R> =
    Box<dyn FnOnce(M, CancellationToken) -> BoxFuture<'a, Result<R, LinkError>> + Send + 'a>;

/// One step of a pipeline carrying messages of type `M` and producing `R`.
#[async_trait]
pub trait Interceptor<M, R>: Send + Sync
where
    M: Send + 'static,
    R: Send + 'static,
{
    async fn intercept(
        &self,
        message: M,
        cancellation: CancellationToken,
        next: Next<'_, M, R>,
    ) -> Result<R, LinkError>;
}

/// Step of the delivery path, producing the application's ack decision.
pub type DeliveryInterceptor = dyn Interceptor<ConsumedMessage, AckStrategy>;

/// Step of the publish path.
pub type PublishInterceptor = dyn Interceptor<PublishMessage, ()>;

/// Immutable chain of interceptors. Clones share the same chain.
pub struct Pipeline<M, R>
where
    M: Send + 'static,
    R: Send + 'static,
{
    interceptors: Arc<Vec<Arc<dyn Interceptor<M, R>>>>,
}

pub type DeliveryPipeline = Pipeline<ConsumedMessage, AckStrategy>;
pub type PublishPipeline = Pipeline<PublishMessage, ()>;

impl<M, R> Clone for Pipeline<M, R>
where
    M: Send + 'static,
    R: Send + 'static,
{
    fn clone(&self) -> Self {
        Pipeline {
            interceptors: self.interceptors.clone(),
        }
    }
}

impl<M, R> Default for Pipeline<M, R>
where
    M: Send + 'static,
    R: Send + 'static,
{
    fn default() -> Self {
        Pipeline::new(vec![])
    }
}

impl<M, R> Pipeline<M, R>
where
    M: Send + 'static,
    R: Send + 'static,
{
    /// Interceptors run in the given order, the first one sees the message first.
    pub fn new(interceptors: Vec<Arc<dyn Interceptor<M, R>>>) -> Self {
        Pipeline {
            interceptors: Arc::new(interceptors),
        }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Runs `message` through every interceptor, then through `terminal`.
    pub async fn dispatch<'a, F, Fut>(
        &'a self,
        message: M,
        cancellation: CancellationToken,
        terminal: F,
    ) -> Result<R, LinkError>
    where
        F: FnOnce(M, CancellationToken) -> Fut + Send + 'a,
        Fut: Future<Output = Result<R, LinkError>> + Send + 'a,
    {
        let terminal: Next<'a, M, R> = Box::new(move |msg, token| terminal(msg, token).boxed());
        chain(&self.interceptors, message, cancellation, terminal).await
    }
}

fn chain<'a, M, R>(
    interceptors: &'a [Arc<dyn Interceptor<M, R>>],
    message: M,
    cancellation: CancellationToken,
    terminal: Next<'a, M, R>,
) -> BoxFuture<'a, Result<R, LinkError>>
where
    M: Send + 'static,
    R: Send + 'static,
{
    match interceptors.split_first() {
        None => terminal(message, cancellation),
        Some((head, rest)) => {
            let next: Next<'a, M, R> =
                Box::new(move |msg, token| chain(rest, msg, token, terminal));
            head.intercept(message, cancellation, next)
        }
    }
}
