// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology State Machine
//!
//! A [`LinkTopology`] keeps a user declared topology (exchanges, queues,
//! bindings) configured on the broker across channel failures. It is driven by
//! its channel's activations and cycles through
//! `Init -> Configuring -> Ready -> Stopping -> (Init | Reconfiguring)`,
//! with an unconditional path to the terminal `Disposed` state.
//!
//! A configuration routine that keeps failing is retried forever at the
//! configured recovery interval: the topology favours availability over
//! failing fast, every failed attempt is logged and reported to the handler's
//! error routine.

use crate::{
    channel::{activation_scope, on_channel_disposed, ChannelHandler, LinkChannel},
    errors::LinkError,
    model::AmqpModel,
    promise::Readiness,
    state::{LoggingStateHook, StateHandler, StateMachine, TopologyState},
    topology_handler::TopologyHandler,
    topology_runner::TopologyRunner,
};
use async_trait::async_trait;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Immutable settings of a [`LinkTopology`].
pub struct TopologyConfiguration {
    handler: Arc<dyn TopologyHandler>,
    recovery_interval: Duration,
    on_state_change: Option<StateHandler<TopologyState>>,
}

impl TopologyConfiguration {
    /// # Parameters
    /// * `handler` - The user's configuration, error and ready routines
    /// * `recovery_interval` - Delay between a failed attempt and the next one, must not be zero
    pub fn new(
        handler: Arc<dyn TopologyHandler>,
        recovery_interval: Duration,
    ) -> Result<TopologyConfiguration, LinkError> {
        if recovery_interval.is_zero() {
            return Err(LinkError::InvalidConfiguration(
                "recovery interval must be greater than zero".to_owned(),
            ));
        }

        Ok(TopologyConfiguration {
            handler,
            recovery_interval,
            on_state_change: None,
        })
    }

    /// Sets an observer called after every state transition.
    pub fn on_state_change(mut self, handler: StateHandler<TopologyState>) -> Self {
        self.on_state_change = Some(handler);
        self
    }
}

struct TopologyCore {
    id: Uuid,
    channel: Arc<dyn LinkChannel>,
    recovery_interval: Duration,
    runner: TopologyRunner<()>,
    state: StateMachine<TopologyState>,
    readiness: Readiness,
    sync: Mutex<()>,
    detach: CancellationToken,
    disposed: CancellationToken,
}

/// Handle of a topology kept configured on the broker. Clones share the same topology.
#[derive(Clone)]
pub struct LinkTopology {
    core: Arc<TopologyCore>,
}

impl LinkTopology {
    /// Creates the topology and attaches it to `channel`.
    ///
    /// Must be called from within a tokio runtime: the topology watches the
    /// channel's disposal signal on a background task.
    pub fn new(channel: Arc<dyn LinkChannel>, configuration: TopologyConfiguration) -> LinkTopology {
        let id = Uuid::new_v4();

        let core = Arc::new(TopologyCore {
            id,
            channel: channel.clone(),
            recovery_interval: configuration.recovery_interval,
            runner: TopologyRunner::new(configuration.handler),
            state: StateMachine::with_hook(
                TopologyState::Init,
                LoggingStateHook::new("topology", id, configuration.on_state_change),
            ),
            readiness: Readiness::new(),
            sync: Mutex::new(()),
            detach: CancellationToken::new(),
            disposed: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&core);
        on_channel_disposed(channel.as_ref(), core.detach.clone(), move || {
            if let Some(core) = weak.upgrade() {
                core.dispose(true);
            }
        });

        debug!(
            topology_id = id.to_string(),
            channel_id = channel.id().to_string(),
            "created"
        );

        channel.initialize(core.clone());

        LinkTopology { core }
    }

    pub fn id(&self) -> Uuid {
        self.core.id
    }

    pub fn state(&self) -> TopologyState {
        self.core.state.state()
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<TopologyState> {
        self.core.state.subscribe()
    }

    /// Waits until the topology is configured.
    ///
    /// Resolves immediately while `Ready`. Fails with `Disposed` when the topology
    /// is torn down first and with `Cancelled` when `cancellation` fires first.
    pub async fn wait_ready(&self, cancellation: Option<&CancellationToken>) -> Result<(), LinkError> {
        self.core.readiness.wait(cancellation).await
    }

    /// Fires once the topology is disposed.
    pub fn disposed(&self) -> CancellationToken {
        self.core.disposed.clone()
    }

    /// Tears the topology and its channel down. Idempotent and thread-safe.
    pub fn dispose(&self) {
        self.core.dispose(false);
    }
}

impl TopologyCore {
    fn dispose(&self, by_channel: bool) {
        if self.state.state() == TopologyState::Disposed {
            return;
        }

        let _guard = self
            .sync
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.state.state() == TopologyState::Disposed {
            return;
        }

        debug!(
            topology_id = self.id.to_string(),
            "disposing (by channel: {})", by_channel
        );

        self.detach.cancel();
        if !by_channel {
            self.channel.dispose();
        }

        self.state.change_state(TopologyState::Disposed);
        self.readiness.close(LinkError::Disposed);
        self.disposed.cancel();

        debug!(topology_id = self.id.to_string(), "disposed");
    }
}

#[async_trait]
impl ChannelHandler for TopologyCore {
    async fn on_active(&self, model: Arc<dyn AmqpModel>, cancellation: CancellationToken) {
        let (cancellation, _scope) = activation_scope(&cancellation, &self.disposed);
        let mut next = self.state.state();

        loop {
            if self.state.state() == TopologyState::Disposed {
                return;
            }

            if cancellation.is_cancelled() {
                next = TopologyState::Stopping;
            }

            self.state.change_state(next);

            match self.state.state() {
                TopologyState::Init => next = TopologyState::Configuring,
                state @ (TopologyState::Configuring | TopologyState::Reconfiguring) => {
                    let retry = state == TopologyState::Reconfiguring;
                    next = match self
                        .runner
                        .attempt(model.clone(), retry, self.recovery_interval, &cancellation)
                        .await
                    {
                        Some(()) => TopologyState::Ready,
                        None => TopologyState::Reconfiguring,
                    };
                }
                TopologyState::Ready => {
                    self.readiness.set_ready();

                    tokio::select! {
                        _ = cancellation.cancelled() => {}
                        _ = self.disposed.cancelled() => {}
                    }

                    self.readiness.reset();
                    next = TopologyState::Stopping;
                }
                TopologyState::Stopping => {
                    if cancellation.is_cancelled() {
                        self.state.change_state(TopologyState::Init);
                        return;
                    }
                    next = TopologyState::Reconfiguring;
                }
                TopologyState::Disposed => return,
            }
        }
    }
}
