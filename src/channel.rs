// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Recovering AMQP Channel
//!
//! This module provides the seam between resources (topology, consumer, producer)
//! and the transport. A [`LinkChannel`] drives one [`ChannelHandler`]: every time
//! a live protocol handle becomes available it calls
//! [`ChannelHandler::on_active`] with the handle and a cancellation token that
//! fires on deactivation, and waits for the handler to return before reopening.
//!
//! [`AmqpChannel`] is the lapin backed implementation. It opens its protocol
//! handle through a [`ChannelConnector`]; [`LapinConnector`] shares one AMQP
//! connection between every channel created from it and reconnects once that
//! connection drops.

use crate::{
    configs::LinkConfigs,
    errors::LinkError,
    model::AmqpModel,
    state::{ChannelState, LoggingStateHook, StateHandler, StateMachine},
    topology_handler::guarded,
};
use async_trait::async_trait;
use lapin::{types::LongString, Connection, ConnectionProperties};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Resource driven by a [`LinkChannel`].
///
/// Publisher confirms and returns are surfaced per publish by
/// [`AmqpModel::basic_publish`], so handlers get no channel-wide callbacks for them.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// Invoked once per channel activation. Expected to run until `cancellation`
    /// fires, then return.
    async fn on_active(&self, model: Arc<dyn AmqpModel>, cancellation: CancellationToken);

    /// Informational hook invoked before each (re)connection attempt.
    async fn on_connecting(&self, _cancellation: CancellationToken) {}
}

/// A channel whose protocol handle can be invalidated by the broker at any time.
pub trait LinkChannel: Send + Sync {
    fn id(&self) -> Uuid;

    fn state(&self) -> ChannelState;

    /// Attaches the handler and starts the activation loop. Only the first call has an effect.
    fn initialize(&self, handler: Arc<dyn ChannelHandler>);

    /// Fires once the channel is permanently gone.
    fn disposed(&self) -> CancellationToken;

    /// Tears the channel down. Idempotent.
    fn dispose(&self);
}

/// Runs `on_disposed` once `channel` is disposed, unless `detach` fires first.
pub(crate) fn on_channel_disposed<F>(channel: &dyn LinkChannel, detach: CancellationToken, on_disposed: F)
where
    F: FnOnce() + Send + 'static,
{
    let disposed = channel.disposed();
    tokio::spawn(async move {
        tokio::select! {
            _ = disposed.cancelled() => on_disposed(),
            _ = detach.cancelled() => {}
        }
    });
}

/// Token firing when either `activation` or `disposed` fires.
///
/// The returned guard cancels the token when dropped, releasing the watcher
/// once the activation handler returns.
pub(crate) fn activation_scope(
    activation: &CancellationToken,
    disposed: &CancellationToken,
) -> (CancellationToken, DropGuard) {
    let scope = activation.child_token();

    let watched = scope.clone();
    let disposed = disposed.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = disposed.cancelled() => watched.cancel(),
            _ = watched.cancelled() => {}
        }
    });

    (scope.clone(), scope.drop_guard())
}

/// Protocol handle opened by a [`ChannelConnector`].
pub struct ActiveModel {
    pub model: Arc<dyn AmqpModel>,
    /// Fires when the transport invalidates `model`.
    pub closed: CancellationToken,
}

/// Opens protocol handles for an [`AmqpChannel`].
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn open(&self) -> Result<ActiveModel, LinkError>;
}

struct SharedConnection {
    connection: Arc<Connection>,
    closed: CancellationToken,
}

/// [`ChannelConnector`] opening lapin channels on a shared, lazily (re)established connection.
pub struct LapinConnector {
    uri: String,
    name: String,
    connection: AsyncMutex<Option<SharedConnection>>,
}

impl LapinConnector {
    pub fn new(cfg: &LinkConfigs) -> Arc<LapinConnector> {
        Arc::new(LapinConnector {
            uri: cfg.amqp_uri(),
            name: cfg.app_name.clone(),
            connection: AsyncMutex::new(None),
        })
    }

    async fn connect(&self) -> Result<SharedConnection, LinkError> {
        debug!("creating amqp connection...");
        let options =
            ConnectionProperties::default().with_connection_name(LongString::from(self.name.clone()));

        let connection = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(LinkError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let closed = CancellationToken::new();
        let on_error = closed.clone();
        connection.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection lost");
            on_error.cancel();
        });

        Ok(SharedConnection {
            connection: Arc::new(connection),
            closed,
        })
    }
}

#[async_trait]
impl ChannelConnector for LapinConnector {
    async fn open(&self) -> Result<ActiveModel, LinkError> {
        let (connection, connection_closed) = {
            let mut guard = self.connection.lock().await;

            let reusable = guard.as_ref().is_some_and(|shared| {
                !shared.closed.is_cancelled() && shared.connection.status().connected()
            });

            if !reusable {
                *guard = Some(self.connect().await?);
            }

            match guard.as_ref() {
                Some(shared) => (shared.connection.clone(), shared.closed.clone()),
                None => return Err(LinkError::ConnectionError("not connected".to_owned())),
            }
        };

        debug!("creating amqp channel...");
        let channel = match connection.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                connection_closed.cancel();
                Err(LinkError::ChannelError(err.to_string()))
            }
        }?;
        debug!("channel created");

        let closed = connection_closed.child_token();
        let on_error = closed.clone();
        channel.on_error(move |err| {
            warn!(error = err.to_string(), "amqp channel lost");
            on_error.cancel();
        });

        Ok(ActiveModel {
            model: Arc::new(channel),
            closed,
        })
    }
}

struct ChannelInner {
    id: Uuid,
    connector: Arc<dyn ChannelConnector>,
    recovery_interval: Duration,
    state: StateMachine<ChannelState>,
    disposed: CancellationToken,
    handler: Mutex<Option<Arc<dyn ChannelHandler>>>,
    sync: Mutex<()>,
}

/// Recovering channel driving a single [`ChannelHandler`].
#[derive(Clone)]
pub struct AmqpChannel {
    inner: Arc<ChannelInner>,
}

impl AmqpChannel {
    /// Creates a channel. Nothing is opened until [`LinkChannel::initialize`] is called.
    ///
    /// # Parameters
    /// * `connector` - Source of protocol handles
    /// * `recovery_interval` - Delay between a deactivation or failed open and the next attempt
    /// * `on_state_change` - Optional application observer of channel state changes
    pub fn new(
        connector: Arc<dyn ChannelConnector>,
        recovery_interval: Duration,
        on_state_change: Option<StateHandler<ChannelState>>,
    ) -> Result<AmqpChannel, LinkError> {
        if recovery_interval.is_zero() {
            return Err(LinkError::InvalidConfiguration(
                "recovery interval must be greater than zero".to_owned(),
            ));
        }

        let id = Uuid::new_v4();
        debug!(channel_id = id.to_string(), "created");

        Ok(AmqpChannel {
            inner: Arc::new(ChannelInner {
                id,
                connector,
                recovery_interval,
                state: StateMachine::with_hook(
                    ChannelState::Init,
                    LoggingStateHook::new("channel", id, on_state_change),
                ),
                disposed: CancellationToken::new(),
                handler: Mutex::new(None),
                sync: Mutex::new(()),
            }),
        })
    }

    /// Subscribes to channel state changes.
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }
}

impl LinkChannel for AmqpChannel {
    fn id(&self) -> Uuid {
        self.inner.id
    }

    fn state(&self) -> ChannelState {
        self.inner.state.state()
    }

    fn initialize(&self, handler: Arc<dyn ChannelHandler>) {
        {
            let mut slot = self
                .inner
                .handler
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            if slot.is_some() || self.inner.disposed.is_cancelled() {
                warn!(channel_id = self.inner.id.to_string(), "already initialized");
                return;
            }
            *slot = Some(handler.clone());
        }

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run(handler).await });
    }

    fn disposed(&self) -> CancellationToken {
        self.inner.disposed.clone()
    }

    fn dispose(&self) {
        let _guard = self
            .inner
            .sync
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if self.inner.disposed.is_cancelled() {
            return;
        }

        debug!(channel_id = self.inner.id.to_string(), "disposing");
        self.inner.state.change_state(ChannelState::Disposed);
        self.inner
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.inner.disposed.cancel();
        debug!(channel_id = self.inner.id.to_string(), "disposed");
    }
}

impl ChannelInner {
    async fn run(&self, handler: Arc<dyn ChannelHandler>) {
        while !self.disposed.is_cancelled() {
            self.state.change_state(ChannelState::Connecting);
            handler.on_connecting(self.disposed.child_token()).await;

            let opened = tokio::select! {
                _ = self.disposed.cancelled() => break,
                res = self.connector.open() => res,
            };

            match opened {
                Err(err) => {
                    warn!(
                        channel_id = self.id.to_string(),
                        error = err.to_string(),
                        "cannot open channel"
                    );
                }
                Ok(active) => self.activate(&handler, active).await,
            }

            if self.disposed.is_cancelled() {
                break;
            }

            self.state.change_state(ChannelState::Reopening);
            tokio::select! {
                _ = self.disposed.cancelled() => break,
                _ = tokio::time::sleep(self.recovery_interval) => {}
            }
        }

        debug!(channel_id = self.id.to_string(), "activation loop stopped");
    }

    async fn activate(&self, handler: &Arc<dyn ChannelHandler>, active: ActiveModel) {
        self.state.change_state(ChannelState::Active);

        let activation = self.disposed.child_token();
        let running = guarded(async {
            handler
                .on_active(active.model.clone(), activation.clone())
                .await;
            Ok(())
        });
        tokio::pin!(running);

        let finished = tokio::select! {
            res = &mut running => Some(res),
            _ = active.closed.cancelled() => None,
            _ = activation.cancelled() => None,
        };

        activation.cancel();
        self.state.change_state(ChannelState::Stopping);

        let res = match finished {
            Some(res) => res,
            None => running.await,
        };
        if let Err(err) = res {
            error!(
                channel_id = self.id.to_string(),
                error = err.to_string(),
                "channel handler failed"
            );
        }

        if !active.closed.is_cancelled() {
            if let Err(err) = active.model.close().await {
                debug!(error = err.to_string(), "error to close the channel");
            }
        }
    }
}
