// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Producer
//!
//! A [`Producer`] publishes to one exchange, declared by its topology routine on
//! every channel activation. Publishing waits for the producer to be active,
//! runs the publish interceptor pipeline and, in confirm mode, waits for the
//! broker's confirmation.
//!
//! A publish interrupted by a channel failure is republished on the next
//! activation, the caller only sees it fail through its own cancellation, the
//! publish timeout or disposal.

use crate::{
    channel::{activation_scope, on_channel_disposed, ChannelHandler, LinkChannel},
    configs::{LinkConfigs, ProducerConfigs},
    errors::LinkError,
    exchange::Exchange,
    interceptor::{PublishInterceptor, PublishPipeline},
    message::PublishMessage,
    model::AmqpModel,
    promise::Readiness,
    state::{LoggingStateHook, ProducerState, StateHandler, StateMachine},
    topology_handler::TopologyHandler,
    topology_runner::TopologyRunner,
};
use async_trait::async_trait;
use lapin::types::ShortString;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct ProducerBuilder {
    channel: Arc<dyn LinkChannel>,
    topology: Arc<dyn TopologyHandler<Exchange>>,
    configs: ProducerConfigs,
    app_id: String,
    user_id: String,
    recovery_interval: Duration,
    interceptors: Vec<Arc<PublishInterceptor>>,
    on_state_change: Option<StateHandler<ProducerState>>,
}

impl ProducerBuilder {
    /// Adds a publish interceptor. Interceptors run in insertion order.
    pub fn interceptor(mut self, interceptor: Arc<PublishInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn on_state_change(mut self, handler: StateHandler<ProducerState>) -> Self {
        self.on_state_change = Some(handler);
        self
    }

    /// Creates the producer and attaches it to its channel.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Producer, LinkError> {
        if self.recovery_interval.is_zero() {
            return Err(LinkError::InvalidConfiguration(
                "recovery interval must be greater than zero".to_owned(),
            ));
        }

        let id = Uuid::new_v4();
        let core = Arc::new(ProducerCore {
            id,
            channel: self.channel.clone(),
            app_id: self.app_id,
            user_id: self.user_id,
            configs: self.configs,
            recovery_interval: self.recovery_interval,
            runner: TopologyRunner::new(self.topology),
            pipeline: PublishPipeline::new(self.interceptors),
            state: StateMachine::with_hook(
                ProducerState::Init,
                LoggingStateHook::new("producer", id, self.on_state_change),
            ),
            active: watch::Sender::new(None),
            readiness: Readiness::new(),
            sync: Mutex::new(()),
            detach: CancellationToken::new(),
            disposed: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&core);
        on_channel_disposed(self.channel.as_ref(), core.detach.clone(), move || {
            if let Some(core) = weak.upgrade() {
                core.dispose(true);
            }
        });

        debug!(
            producer_id = id.to_string(),
            channel_id = self.channel.id().to_string(),
            "created"
        );

        self.channel.initialize(core.clone());

        Ok(Producer { core })
    }
}

/// Everything a publish needs from the current activation.
#[derive(Clone)]
struct Activation {
    model: Arc<dyn AmqpModel>,
    exchange: Exchange,
    cancellation: CancellationToken,
}

struct ProducerCore {
    id: Uuid,
    channel: Arc<dyn LinkChannel>,
    app_id: String,
    user_id: String,
    configs: ProducerConfigs,
    recovery_interval: Duration,
    runner: TopologyRunner<Exchange>,
    pipeline: PublishPipeline,
    state: StateMachine<ProducerState>,
    active: watch::Sender<Option<Activation>>,
    readiness: Readiness,
    sync: Mutex<()>,
    detach: CancellationToken,
    disposed: CancellationToken,
}

/// Handle of a producer. Clones share the same producer.
#[derive(Clone)]
pub struct Producer {
    core: Arc<ProducerCore>,
}

impl Producer {
    /// # Parameters
    /// * `channel` - Channel the producer lives on, owned by the producer from now on
    /// * `link` - Connection settings, source of the app id, user id and default recovery interval
    /// * `configs` - Producer settings
    /// * `topology` - Routine declaring the target exchange
    pub fn builder(
        channel: Arc<dyn LinkChannel>,
        link: &LinkConfigs,
        configs: ProducerConfigs,
        topology: Arc<dyn TopologyHandler<Exchange>>,
    ) -> ProducerBuilder {
        ProducerBuilder {
            channel,
            topology,
            recovery_interval: configs.recovery_interval(link),
            configs,
            app_id: link.app_name.clone(),
            user_id: link.user.clone(),
            interceptors: vec![],
            on_state_change: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.core.id
    }

    pub fn state(&self) -> ProducerState {
        self.core.state.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProducerState> {
        self.core.state.subscribe()
    }

    /// Waits until the producer's exchange is declared and publishing is possible.
    pub async fn wait_ready(&self, cancellation: Option<&CancellationToken>) -> Result<(), LinkError> {
        self.core.readiness.wait(cancellation).await
    }

    /// Publishes `message` to the producer's exchange.
    ///
    /// Waits for the producer to become active and, in confirm mode, for the
    /// broker's confirmation. Fails with `Timeout` once the configured publish
    /// timeout elapses, `Cancelled` when `cancellation` fires and `Disposed`
    /// when the producer is disposed first.
    pub async fn publish(
        &self,
        message: PublishMessage,
        cancellation: Option<&CancellationToken>,
    ) -> Result<(), LinkError> {
        let cancellation = cancellation.cloned().unwrap_or_default();
        let message = self.core.stamp(message);

        match self.core.configs.publish_timeout() {
            None => self.core.publish(message, &cancellation).await,
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.core.publish(message, &cancellation)).await
                {
                    Ok(res) => res,
                    Err(_) => Err(LinkError::Timeout),
                }
            }
        }
    }

    /// Fires once the producer is disposed.
    pub fn disposed(&self) -> CancellationToken {
        self.core.disposed.clone()
    }

    /// Tears the producer and its channel down. Pending publishes fail with `Disposed`. Idempotent.
    pub fn dispose(&self) {
        self.core.dispose(false);
    }
}

impl ProducerCore {
    /// Fills in message id, app id and, when configured, user id.
    fn stamp(&self, message: PublishMessage) -> PublishMessage {
        let mut properties = message.properties;

        if properties.message_id().is_none() {
            properties = properties.with_message_id(ShortString::from(Uuid::new_v4().to_string()));
        }

        if properties.app_id().is_none() {
            properties = properties.with_app_id(ShortString::from(self.app_id.clone()));
        }

        if self.configs.set_user_id {
            properties = properties.with_user_id(ShortString::from(self.user_id.clone()));
        }

        PublishMessage {
            properties,
            ..message
        }
    }

    async fn wait_active(&self, cancellation: &CancellationToken) -> Result<Activation, LinkError> {
        let mut active = self.active.subscribe();

        loop {
            if cancellation.is_cancelled() {
                return Err(LinkError::Cancelled);
            }
            if self.disposed.is_cancelled() {
                return Err(LinkError::Disposed);
            }

            let current = active.borrow_and_update().clone();
            if let Some(activation) = current {
                if !activation.cancellation.is_cancelled() {
                    return Ok(activation);
                }
            }

            tokio::select! {
                biased;
                _ = self.disposed.cancelled() => return Err(LinkError::Disposed),
                _ = cancellation.cancelled() => return Err(LinkError::Cancelled),
                changed = active.changed() => {
                    if changed.is_err() {
                        return Err(LinkError::Disposed);
                    }
                }
            }
        }
    }

    async fn publish(
        &self,
        message: PublishMessage,
        cancellation: &CancellationToken,
    ) -> Result<(), LinkError> {
        loop {
            let activation = self.wait_active(cancellation).await?;
            let interrupted = activation.cancellation.clone();

            let res = self
                .pipeline
                .dispatch(message.clone(), cancellation.clone(), move |msg, _| async move {
                    tokio::select! {
                        _ = activation.cancellation.cancelled() => Err(LinkError::ChannelError(
                            "channel deactivated while publishing".to_owned(),
                        )),
                        res = activation.model.basic_publish(
                            activation.exchange.name(),
                            &msg.publish.routing_key,
                            msg.publish.mandatory,
                            &msg.body,
                            msg.properties,
                        ) => res,
                    }
                })
                .await;

            match res {
                Err(err) if interrupted.is_cancelled() && !self.disposed.is_cancelled() => {
                    debug!(
                        producer_id = self.id.to_string(),
                        error = err.to_string(),
                        "publish interrupted by channel deactivation, republishing"
                    );
                }
                Err(_) if self.disposed.is_cancelled() => return Err(LinkError::Disposed),
                res => return res,
            }
        }
    }

    fn dispose(&self, by_channel: bool) {
        if self.state.state() == ProducerState::Disposed {
            return;
        }

        let _guard = self
            .sync
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.state.state() == ProducerState::Disposed {
            return;
        }

        debug!(
            producer_id = self.id.to_string(),
            "disposing (by channel: {})", by_channel
        );

        self.detach.cancel();
        if !by_channel {
            self.channel.dispose();
        }

        self.state.change_state(ProducerState::Disposed);
        self.readiness.close(LinkError::Disposed);
        self.active.send_replace(None);
        self.disposed.cancel();

        debug!(producer_id = self.id.to_string(), "disposed");
    }

    /// Prepares the channel for publishing once the exchange is declared.
    async fn activate(
        &self,
        model: &Arc<dyn AmqpModel>,
        exchange: Exchange,
        cancellation: &CancellationToken,
    ) -> Result<(), LinkError> {
        if self.configs.confirm_mode {
            model.confirm_select().await?;
        }

        self.active.send_replace(Some(Activation {
            model: model.clone(),
            exchange,
            cancellation: cancellation.clone(),
        }));
        self.readiness.set_ready();

        Ok(())
    }
}

#[async_trait]
impl ChannelHandler for ProducerCore {
    async fn on_active(&self, model: Arc<dyn AmqpModel>, cancellation: CancellationToken) {
        let (cancellation, _scope) = activation_scope(&cancellation, &self.disposed);
        let mut next = self.state.state();

        loop {
            if self.state.state() == ProducerState::Disposed {
                return;
            }

            if cancellation.is_cancelled() {
                next = ProducerState::Stopping;
            }

            self.state.change_state(next);

            match self.state.state() {
                ProducerState::Init => next = ProducerState::Configuring,
                state @ (ProducerState::Configuring | ProducerState::Reconfiguring) => {
                    let retry = state == ProducerState::Reconfiguring;
                    let exchange = self
                        .runner
                        .attempt(model.clone(), retry, self.recovery_interval, &cancellation)
                        .await;

                    next = match exchange {
                        None => ProducerState::Reconfiguring,
                        Some(exchange) => match self.activate(&model, exchange, &cancellation).await {
                            Ok(()) => ProducerState::Active,
                            Err(err) => {
                                warn!(
                                    producer_id = self.id.to_string(),
                                    error = err.to_string(),
                                    "failure to enable publisher confirms"
                                );
                                ProducerState::Reconfiguring
                            }
                        },
                    };
                }
                ProducerState::Active => {
                    tokio::select! {
                        _ = cancellation.cancelled() => {}
                        _ = self.disposed.cancelled() => {}
                    }

                    self.active.send_replace(None);
                    self.readiness.reset();
                    next = ProducerState::Stopping;
                }
                ProducerState::Stopping => {
                    if cancellation.is_cancelled() {
                        self.state.change_state(ProducerState::Init);
                        return;
                    }
                    next = ProducerState::Reconfiguring;
                }
                ProducerState::Disposed => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        exchange::ExchangeDefinition,
        gzip::GzipInterceptor,
        mocks::MockAmqpModelImpl,
        topology::tests::FakeChannel,
        topology_config::TopologyConfig,
        topology_handler::FnTopologyHandler,
    };
    use lapin::BasicProperties;
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc;

    fn events_topology() -> Arc<dyn TopologyHandler<Exchange>> {
        Arc::new(FnTopologyHandler::new(|cfg: TopologyConfig| async move {
            cfg.exchange_declare(&ExchangeDefinition::new("events").topic())
                .await
        }))
    }

    type Published = (String, String, Vec<u8>, BasicProperties);

    fn publishing_model(published: mpsc::UnboundedSender<Published>) -> MockAmqpModelImpl {
        let mut model = MockAmqpModelImpl::new();
        model
            .expect_exchange_declare()
            .returning(|_, _, _, _| Ok(()));
        model.expect_confirm_select().times(1).returning(|| Ok(()));
        model
            .expect_basic_publish()
            .returning(move |exchange, key, _, body, props| {
                published
                    .send((exchange.to_owned(), key.to_owned(), body.to_vec(), props))
                    .unwrap();
                Ok(())
            });
        model
    }

    fn link() -> LinkConfigs {
        LinkConfigs {
            app_name: "billing".to_owned(),
            user: "svc-billing".to_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn should_publish_to_declared_exchange_with_stamped_properties() {
        let channel = Arc::new(FakeChannel::default());
        let producer = Producer::builder(
            channel.clone(),
            &link(),
            ProducerConfigs {
                set_user_id: true,
                ..Default::default()
            },
            events_topology(),
        )
        .build()
        .unwrap();

        let (tx, mut published) = mpsc::unbounded_channel();
        let _activation =
            channel.activate_with(Arc::new(publishing_model(tx)), CancellationToken::new());

        producer
            .publish(PublishMessage::new("paid").routing_key("invoice.paid"), None)
            .await
            .unwrap();

        let (exchange, key, body, props) = published.recv().await.unwrap();
        assert_eq!(exchange, "events");
        assert_eq!(key, "invoice.paid");
        assert_eq!(body, b"paid".to_vec());
        assert_eq!(props.app_id().as_ref().map(|v| v.as_str()), Some("billing"));
        assert_eq!(
            props.user_id().as_ref().map(|v| v.as_str()),
            Some("svc-billing")
        );
        assert!(props.message_id().is_some());
        assert_eq!(producer.state(), ProducerState::Active);

        producer.dispose();
    }

    #[tokio::test]
    async fn should_run_publish_interceptors() {
        let channel = Arc::new(FakeChannel::default());
        let producer = Producer::builder(
            channel.clone(),
            &link(),
            ProducerConfigs::default(),
            events_topology(),
        )
        .interceptor(Arc::new(GzipInterceptor::default()))
        .build()
        .unwrap();

        let (tx, mut published) = mpsc::unbounded_channel();
        let _activation =
            channel.activate_with(Arc::new(publishing_model(tx)), CancellationToken::new());

        producer
            .publish(PublishMessage::new("paid"), None)
            .await
            .unwrap();

        let (_, _, _, props) = published.recv().await.unwrap();
        assert_eq!(
            props.content_encoding().as_ref().map(|v| v.as_str()),
            Some("gzip")
        );
        producer.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn should_time_out_while_inactive() {
        let channel = Arc::new(FakeChannel::default());
        let producer = Producer::builder(
            channel.clone(),
            &link(),
            ProducerConfigs {
                publish_timeout_ms: 1_000,
                ..Default::default()
            },
            events_topology(),
        )
        .build()
        .unwrap();

        let res = producer.publish(PublishMessage::new("late"), None).await;

        assert_eq!(res, Err(LinkError::Timeout));
        producer.dispose();
    }

    #[tokio::test]
    async fn should_fail_pending_publish_on_dispose_and_cancellation() {
        let channel = Arc::new(FakeChannel::default());
        let producer = Producer::builder(
            channel.clone(),
            &link(),
            ProducerConfigs::default(),
            events_topology(),
        )
        .build()
        .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(
            producer
                .publish(PublishMessage::new("x"), Some(&token))
                .await,
            Err(LinkError::Cancelled)
        );

        let pending = {
            let producer = producer.clone();
            tokio::spawn(async move { producer.publish(PublishMessage::new("x"), None).await })
        };
        tokio::task::yield_now().await;

        producer.dispose();

        assert_eq!(pending.await.unwrap(), Err(LinkError::Disposed));
        assert_eq!(producer.wait_ready(None).await, Err(LinkError::Disposed));
        assert_eq!(channel.dispose_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_wait_for_recovery_before_publishing() {
        let channel = Arc::new(FakeChannel::default());
        let producer = Producer::builder(
            channel.clone(),
            &link(),
            ProducerConfigs::default(),
            events_topology(),
        )
        .build()
        .unwrap();

        // no publish expectation: publishing on the first activation panics
        let mut first_model = MockAmqpModelImpl::new();
        first_model
            .expect_exchange_declare()
            .returning(|_, _, _, _| Ok(()));
        first_model.expect_confirm_select().returning(|| Ok(()));

        let first = CancellationToken::new();
        let running = channel.activate_with(Arc::new(first_model), first.clone());
        producer.wait_ready(None).await.unwrap();
        first.cancel();
        running.await.unwrap();
        assert_eq!(producer.state(), ProducerState::Init);

        let pending = {
            let producer = producer.clone();
            tokio::spawn(async move { producer.publish(PublishMessage::new("x"), None).await })
        };

        let (tx, mut published) = mpsc::unbounded_channel();
        let _second =
            channel.activate_with(Arc::new(publishing_model(tx)), CancellationToken::new());

        assert_eq!(pending.await.unwrap(), Ok(()));
        assert_eq!(published.recv().await.unwrap().2, b"x".to_vec());
        producer.dispose();
    }
}
