// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Runner
//!
//! Executes a [`TopologyHandler`]'s configuration routine against a live
//! [`AmqpModel`] and drives one configuration attempt of the shared
//! configure/retry cycle used by topologies, consumers and producers.

use crate::{
    errors::LinkError,
    model::AmqpModel,
    topology_config::TopologyConfig,
    topology_handler::{guarded, TopologyHandler},
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub struct TopologyRunner<T> {
    handler: Arc<dyn TopologyHandler<T>>,
}

impl<T: Send + 'static> TopologyRunner<T> {
    pub fn new(handler: Arc<dyn TopologyHandler<T>>) -> Self {
        TopologyRunner { handler }
    }

    /// Runs the configuration routine once.
    ///
    /// Fails with the first error raised by the protocol layer or the routine,
    /// or with `Cancelled` when `cancellation` fires first. Declarations that
    /// already reached the broker are not rolled back.
    pub async fn run(
        &self,
        model: Arc<dyn AmqpModel>,
        cancellation: &CancellationToken,
    ) -> Result<T, LinkError> {
        if cancellation.is_cancelled() {
            return Err(LinkError::Cancelled);
        }

        let config = TopologyConfig::new(model, cancellation.clone());

        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(LinkError::Cancelled),
            res = guarded(self.handler.configure(config)) => res,
        }
    }

    /// One configuration attempt of the configure/retry cycle.
    ///
    /// When `retry` is set, waits `recovery_interval` first; the wait is abandoned
    /// when `cancellation` fires. A failed run invokes the handler's error routine,
    /// a successful one its ready routine. Failures of either routine are logged
    /// and never propagated.
    ///
    /// # Returns
    /// `Some` with the routine's output once configured, `None` when the attempt
    /// must be retried.
    pub(crate) async fn attempt(
        &self,
        model: Arc<dyn AmqpModel>,
        retry: bool,
        recovery_interval: Duration,
        cancellation: &CancellationToken,
    ) -> Option<T> {
        if retry {
            debug!("retrying in {:.3}s", recovery_interval.as_secs_f64());

            tokio::select! {
                _ = cancellation.cancelled() => return None,
                _ = tokio::time::sleep(recovery_interval) => {}
            }
        }

        debug!("configuring topology");

        match self.run(model, cancellation).await {
            Err(_) if cancellation.is_cancelled() => {
                debug!("topology configuration interrupted by deactivation");
                None
            }
            Err(err) => {
                warn!(error = err.to_string(), "exception on configuration");

                if let Err(handler_err) = guarded(self.handler.configuration_error(&err)).await {
                    error!(error = handler_err.to_string(), "error in error handler");
                }

                None
            }
            Ok(value) => {
                if let Err(handler_err) = guarded(self.handler.ready()).await {
                    error!(error = handler_err.to_string(), "error in ready handler");
                }

                debug!("topology configured");
                Some(value)
            }
        }
    }
}
