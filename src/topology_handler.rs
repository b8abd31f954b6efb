// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Handlers
//!
//! A [`TopologyHandler`] carries the user's topology routines: the configuration
//! routine itself, an error routine invoked when a configuration attempt fails
//! and a ready routine invoked once the topology is in place.
//!
//! The type parameter is what the configuration routine produces: `()` for a
//! standalone topology, a [`Queue`](crate::queue::Queue) for consumers and an
//! [`Exchange`](crate::exchange::Exchange) for producers.

use crate::{errors::LinkError, topology_config::TopologyConfig};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, FutureExt};
use std::{any::Any, future::Future, panic::AssertUnwindSafe};
use tracing::warn;

/// User routines driving a topology.
#[async_trait]
pub trait TopologyHandler<T = ()>: Send + Sync
where
    T: Send + 'static,
{
    /// Declares the topology through the configuration context.
    async fn configure(&self, config: TopologyConfig) -> Result<T, LinkError>;

    /// Called after a failed configuration attempt, before the recovery delay.
    async fn configuration_error(&self, err: &LinkError) -> Result<(), LinkError> {
        warn!(error = err.to_string(), "topology configuration failed");
        Ok(())
    }

    /// Called once the configuration routine succeeded.
    async fn ready(&self) -> Result<(), LinkError> {
        Ok(())
    }
}

type ConfigureFn<T> =
    Box<dyn Fn(TopologyConfig) -> BoxFuture<'static, Result<T, LinkError>> + Send + Sync>;
type ErrorFn = Box<dyn Fn(LinkError) -> BoxFuture<'static, Result<(), LinkError>> + Send + Sync>;
type ReadyFn = Box<dyn Fn() -> BoxFuture<'static, Result<(), LinkError>> + Send + Sync>;

/// [`TopologyHandler`] assembled from closures.
///
/// ```ignore
/// let handler = FnTopologyHandler::new(|cfg: TopologyConfig| async move {
///     let exchange = cfg.exchange_declare(&ExchangeDefinition::new("events").topic()).await?;
///     let queue = cfg.queue_declare(&QueueDefinition::new("audit")).await?;
///     cfg.bind_queue(&queue, &exchange, "#", None).await
/// })
/// .on_error(|err| async move {
///     eprintln!("topology failed: {err}");
///     Ok(())
/// });
/// ```
pub struct FnTopologyHandler<T> {
    configure: ConfigureFn<T>,
    error: Option<ErrorFn>,
    ready: Option<ReadyFn>,
}

impl<T: Send + 'static> FnTopologyHandler<T> {
    pub fn new<F, Fut>(configure: F) -> Self
    where
        F: Fn(TopologyConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, LinkError>> + Send + 'static,
    {
        FnTopologyHandler {
            configure: Box::new(move |cfg| configure(cfg).boxed()),
            error: None,
            ready: None,
        }
    }

    /// Sets the routine invoked after each failed configuration attempt.
    pub fn on_error<F, Fut>(mut self, error: F) -> Self
    where
        F: Fn(LinkError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), LinkError>> + Send + 'static,
    {
        self.error = Some(Box::new(move |err| error(err).boxed()));
        self
    }

    /// Sets the routine invoked once the topology is configured.
    pub fn on_ready<F, Fut>(mut self, ready: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), LinkError>> + Send + 'static,
    {
        self.ready = Some(Box::new(move || ready().boxed()));
        self
    }
}

#[async_trait]
impl<T: Send + 'static> TopologyHandler<T> for FnTopologyHandler<T> {
    async fn configure(&self, config: TopologyConfig) -> Result<T, LinkError> {
        (self.configure)(config).await
    }

    async fn configuration_error(&self, err: &LinkError) -> Result<(), LinkError> {
        match &self.error {
            Some(error) => error(err.clone()).await,
            None => {
                warn!(error = err.to_string(), "topology configuration failed");
                Ok(())
            }
        }
    }

    async fn ready(&self) -> Result<(), LinkError> {
        match &self.ready {
            Some(ready) => ready().await,
            None => Ok(()),
        }
    }
}

/// Runs a user supplied future, turning a panic into [`LinkError::HandlerPanicked`].
pub(crate) async fn guarded<T, F>(fut: F) -> Result<T, LinkError>
where
    F: Future<Output = Result<T, LinkError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(res) => res,
        Err(panic) => Err(LinkError::HandlerPanicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}
