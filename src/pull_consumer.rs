// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pull Consumer
//!
//! A [`PullConsumer`] keeps a broker consumer alive on its channel and exposes
//! deliveries through a "take next message" interface.
//!
//! On every channel activation the consumer configures its queue through the
//! topology runner (retrying forever at the recovery interval), applies QoS and
//! starts consuming. Each delivery runs through the delivery interceptor
//! pipeline, whose terminal action enqueues it in a [`PullConsumerQueue`] and
//! waits for the application's decision; that decision is then turned into
//! `basic.ack` / `basic.nack` on the channel the message came from.
//!
//! Deliveries are bound to the activation that produced them: once the channel
//! goes inactive, messages not taken yet are dropped from the queue (the broker
//! redelivers them) and late decisions on taken ones are ignored.

use crate::{
    channel::{activation_scope, on_channel_disposed, ChannelHandler, LinkChannel},
    configs::{ConsumerConfigs, LinkConfigs},
    errors::LinkError,
    interceptor::{DeliveryInterceptor, DeliveryPipeline},
    message::{AckOutcome, AckStrategy, ConsumedMessage, PulledMessage},
    model::{AmqpModel, ConsumeOptions, RawDelivery},
    promise::Readiness,
    pull_queue::PullConsumerQueue,
    queue::Queue,
    state::{ConsumerState, LoggingStateHook, StateHandler, StateMachine},
    topology_handler::TopologyHandler,
    topology_runner::TopologyRunner,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const AMQP_ARGS_PRIORITY: &str = "x-priority";
pub const AMQP_ARGS_CANCEL_ON_HA_FAILOVER: &str = "x-cancel-on-ha-failover";

pub struct PullConsumerBuilder {
    channel: Arc<dyn LinkChannel>,
    topology: Arc<dyn TopologyHandler<Queue>>,
    configs: ConsumerConfigs,
    app_id: String,
    recovery_interval: Duration,
    interceptors: Vec<Arc<DeliveryInterceptor>>,
    on_state_change: Option<StateHandler<ConsumerState>>,
}

impl PullConsumerBuilder {
    /// Adds a delivery interceptor. Interceptors run in insertion order.
    pub fn interceptor(mut self, interceptor: Arc<DeliveryInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn on_state_change(mut self, handler: StateHandler<ConsumerState>) -> Self {
        self.on_state_change = Some(handler);
        self
    }

    /// Creates the consumer and attaches it to its channel.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<PullConsumer, LinkError> {
        if self.recovery_interval.is_zero() {
            return Err(LinkError::InvalidConfiguration(
                "recovery interval must be greater than zero".to_owned(),
            ));
        }

        let id = Uuid::new_v4();
        let core = Arc::new(ConsumerCore {
            id,
            consumer_tag: format!("{}-{}", self.app_id, id),
            channel: self.channel.clone(),
            app_id: self.app_id,
            configs: self.configs,
            recovery_interval: self.recovery_interval,
            runner: TopologyRunner::new(self.topology),
            pipeline: DeliveryPipeline::new(self.interceptors),
            queue: PullConsumerQueue::new(),
            state: StateMachine::with_hook(
                ConsumerState::Init,
                LoggingStateHook::new("consumer", id, self.on_state_change),
            ),
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
            consumer_id = id.to_string(),
            channel_id = self.channel.id().to_string(),
            "created"
        );

        self.channel.initialize(core.clone());

        Ok(PullConsumer { core })
    }
}

struct ConsumerCore {
    id: Uuid,
    consumer_tag: String,
    channel: Arc<dyn LinkChannel>,
    app_id: String,
    configs: ConsumerConfigs,
    recovery_interval: Duration,
    runner: TopologyRunner<Queue>,
    pipeline: DeliveryPipeline,
    queue: PullConsumerQueue,
    state: StateMachine<ConsumerState>,
    readiness: Readiness,
    sync: Mutex<()>,
    detach: CancellationToken,
    disposed: CancellationToken,
}

/// Handle of a pull consumer. Clones share the same consumer.
#[derive(Clone)]
pub struct PullConsumer {
    core: Arc<ConsumerCore>,
}

impl PullConsumer {
    /// # Parameters
    /// * `channel` - Channel the consumer lives on, owned by the consumer from now on
    /// * `link` - Connection settings, source of the app id and default recovery interval
    /// * `configs` - Consumer settings
    /// * `topology` - Routine declaring the consumed queue
    pub fn builder(
        channel: Arc<dyn LinkChannel>,
        link: &LinkConfigs,
        configs: ConsumerConfigs,
        topology: Arc<dyn TopologyHandler<Queue>>,
    ) -> PullConsumerBuilder {
        PullConsumerBuilder {
            channel,
            topology,
            recovery_interval: configs.recovery_interval(link),
            configs,
            app_id: link.app_name.clone(),
            interceptors: vec![],
            on_state_change: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.core.id
    }

    pub fn state(&self) -> ConsumerState {
        self.core.state.state()
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<ConsumerState> {
        self.core.state.subscribe()
    }

    /// Waits until the consumer is consuming.
    pub async fn wait_ready(&self, cancellation: Option<&CancellationToken>) -> Result<(), LinkError> {
        self.core.readiness.wait(cancellation).await
    }

    /// Takes the next message, waiting at most the configured timeout.
    ///
    /// Fails with `Timeout` when the timeout elapses and with `Disposed` once
    /// the consumer is disposed.
    pub async fn get_message(&self) -> Result<PulledMessage, LinkError> {
        let cancellation = CancellationToken::new();

        match self.core.configs.get_message_timeout() {
            None => self.get_message_with(&cancellation).await,
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.get_message_with(&cancellation)).await {
                    Ok(res) => res,
                    Err(_) => Err(LinkError::Timeout),
                }
            }
        }
    }

    /// Takes the next message, waiting until one arrives or `cancellation` fires.
    pub async fn get_message_with(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<PulledMessage, LinkError> {
        self.core.queue.take(cancellation).await
    }

    /// Fires once the consumer is disposed.
    pub fn disposed(&self) -> CancellationToken {
        self.core.disposed.clone()
    }

    /// Stops consuming and tears the channel down. Pending `get_message` calls
    /// and queued messages fail with `Disposed`. Idempotent.
    pub fn dispose(&self) {
        self.core.dispose(false);
    }
}

impl ConsumerCore {
    fn dispose(&self, by_channel: bool) {
        if self.state.state() == ConsumerState::Disposed {
            return;
        }

        let _guard = self
            .sync
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.state.state() == ConsumerState::Disposed {
            return;
        }

        debug!(
            consumer_id = self.id.to_string(),
            "disposing (by channel: {})", by_channel
        );

        self.detach.cancel();
        if !by_channel {
            self.channel.dispose();
        }

        self.state.change_state(ConsumerState::Disposed);
        self.readiness.close(LinkError::Disposed);
        self.queue.dispose();
        self.disposed.cancel();

        debug!(consumer_id = self.id.to_string(), "disposed");
    }

    fn consume_options(&self) -> ConsumeOptions {
        let mut arguments = FieldTable::default();

        if self.configs.priority != 0 {
            arguments.insert(
                ShortString::from(AMQP_ARGS_PRIORITY),
                AMQPValue::LongInt(self.configs.priority),
            );
        }

        if self.configs.cancel_on_ha_failover {
            arguments.insert(
                ShortString::from(AMQP_ARGS_CANCEL_ON_HA_FAILOVER),
                AMQPValue::Boolean(true),
            );
        }

        ConsumeOptions {
            no_ack: self.configs.auto_ack,
            exclusive: self.configs.exclusive,
            arguments,
        }
    }

    /// Consumes until `cancellation` fires or the broker stops the consumer.
    async fn consume(
        &self,
        model: &Arc<dyn AmqpModel>,
        queue: &Queue,
        cancellation: &CancellationToken,
    ) -> Result<(), LinkError> {
        if self.configs.prefetch_count > 0 {
            model.basic_qos(self.configs.prefetch_count).await?;
        }

        let mut deliveries = model
            .basic_consume(queue.name(), &self.consumer_tag, self.consume_options())
            .await?;

        debug!(
            consumer_id = self.id.to_string(),
            queue = queue.name(),
            "consuming"
        );
        self.readiness.set_ready();

        loop {
            let delivery = tokio::select! {
                _ = cancellation.cancelled() => return Ok(()),
                _ = self.disposed.cancelled() => return Ok(()),
                delivery = deliveries.next() => delivery,
            };

            match delivery {
                Some(Ok(delivery)) => self.dispatch(model, queue, delivery, cancellation),
                Some(Err(err)) => return Err(err),
                None => {
                    return Err(LinkError::ConsumerError(
                        "consumer cancelled by the broker".to_owned(),
                    ))
                }
            }
        }
    }

    fn dispatch(
        &self,
        model: &Arc<dyn AmqpModel>,
        queue: &Queue,
        delivery: RawDelivery,
        cancellation: &CancellationToken,
    ) {
        let delivery_tag = delivery.delivery_tag;
        let message =
            ConsumedMessage::from_delivery(delivery, queue.name(), &self.app_id, cancellation.clone());

        let model = model.clone();
        let pipeline = self.pipeline.clone();
        let pull_queue = self.queue.clone();
        let token = cancellation.clone();
        let auto_ack = self.configs.auto_ack;
        let queued = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            let reached = queued.clone();
            let outcome = tokio::select! {
                _ = token.cancelled() => return,
                outcome = pipeline.dispatch(message, token.clone(), move |msg, _| async move {
                    reached.store(true, Ordering::SeqCst);
                    pull_queue.put(msg).wait().await
                }) => outcome,
            };

            if !auto_ack {
                settle(model.as_ref(), delivery_tag, outcome, queued.load(Ordering::SeqCst)).await;
            }
        });
    }
}

/// Applies the outcome of a delivery on the channel it came from.
///
/// `queued` tells whether the message reached the application. Failures before
/// that point come from the delivery pipeline itself (e.g. an undecodable body)
/// and would fail again on redelivery, so they are rejected without requeue.
async fn settle(model: &dyn AmqpModel, delivery_tag: u64, outcome: AckOutcome, queued: bool) {
    let res = match outcome {
        Ok(AckStrategy::Ack) => model.basic_ack(delivery_tag).await,
        Ok(AckStrategy::Nack) => model.basic_nack(delivery_tag, false).await,
        Ok(AckStrategy::Requeue) => model.basic_nack(delivery_tag, true).await,
        Err(LinkError::Cancelled | LinkError::Disposed) => return,
        Err(err) if queued => {
            warn!(
                error = err.to_string(),
                delivery_tag, "message handling failed, requeuing"
            );
            model.basic_nack(delivery_tag, true).await
        }
        Err(err) => {
            error!(
                error = err.to_string(),
                delivery_tag, "message rejected by the delivery pipeline"
            );
            model.basic_nack(delivery_tag, false).await
        }
    };

    if let Err(err) = res {
        error!(error = err.to_string(), delivery_tag, "failure to settle message");
    }
}

#[async_trait]
impl ChannelHandler for ConsumerCore {
    async fn on_active(&self, model: Arc<dyn AmqpModel>, cancellation: CancellationToken) {
        let (cancellation, _scope) = activation_scope(&cancellation, &self.disposed);
        let mut next = self.state.state();
        let mut queue: Option<Queue> = None;

        loop {
            if self.state.state() == ConsumerState::Disposed {
                return;
            }

            if cancellation.is_cancelled() {
                next = ConsumerState::Stopping;
            }

            self.state.change_state(next);

            match self.state.state() {
                ConsumerState::Init => next = ConsumerState::Configuring,
                state @ (ConsumerState::Configuring | ConsumerState::Reconfiguring) => {
                    let retry = state == ConsumerState::Reconfiguring;
                    queue = self
                        .runner
                        .attempt(model.clone(), retry, self.recovery_interval, &cancellation)
                        .await;

                    next = match queue {
                        Some(_) => ConsumerState::Active,
                        None => ConsumerState::Reconfiguring,
                    };
                }
                ConsumerState::Active => {
                    if let Some(queue) = queue.take() {
                        if let Err(err) = self.consume(&model, &queue, &cancellation).await {
                            warn!(
                                consumer_id = self.id.to_string(),
                                error = err.to_string(),
                                "consumer stopped"
                            );
                        }
                    }

                    self.readiness.reset();
                    next = ConsumerState::Stopping;
                }
                ConsumerState::Stopping => {
                    if cancellation.is_cancelled() {
                        self.state.change_state(ConsumerState::Init);
                        return;
                    }
                    next = ConsumerState::Reconfiguring;
                }
                ConsumerState::Disposed => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gzip::GzipInterceptor,
        mocks::MockAmqpModelImpl,
        model::DeliveryStream,
        queue::QueueDefinition,
        topology::tests::FakeChannel,
        topology_config::TopologyConfig,
        topology_handler::FnTopologyHandler,
    };
    use futures_util::stream;
    use lapin::BasicProperties;
    use tokio::sync::mpsc;

    fn orders_topology() -> Arc<dyn TopologyHandler<Queue>> {
        Arc::new(FnTopologyHandler::new(|cfg: TopologyConfig| async move {
            cfg.queue_declare(&QueueDefinition::new("orders")).await
        }))
    }

    fn delivery_stream(rx: mpsc::UnboundedReceiver<RawDelivery>) -> DeliveryStream {
        stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        })
        .boxed()
    }

    fn delivery(tag: u64, body: &str) -> RawDelivery {
        RawDelivery {
            delivery_tag: tag,
            exchange: "events".to_owned(),
            routing_key: "order.created".to_owned(),
            body: body.as_bytes().to_vec(),
            properties: BasicProperties::default(),
            ..Default::default()
        }
    }

    /// Model serving one queue and reporting acks/nacks as `(tag, Some(requeue))` / `(tag, None)`.
    fn consuming_model(
        deliveries: mpsc::UnboundedReceiver<RawDelivery>,
        settled: mpsc::UnboundedSender<(u64, Option<bool>)>,
    ) -> MockAmqpModelImpl {
        let mut model = MockAmqpModelImpl::new();
        model
            .expect_queue_declare()
            .returning(|name, _, _| Ok(name.to_owned()));
        model.expect_basic_qos().returning(|_| Ok(()));

        let stream = Mutex::new(Some(delivery_stream(deliveries)));
        model
            .expect_basic_consume()
            .times(1)
            .returning(move |_, _, _| Ok(stream.lock().unwrap().take().unwrap()));

        let acks = settled.clone();
        model.expect_basic_ack().returning(move |tag| {
            acks.send((tag, None)).unwrap();
            Ok(())
        });
        model.expect_basic_nack().returning(move |tag, requeue| {
            settled.send((tag, Some(requeue))).unwrap();
            Ok(())
        });
        model
    }

    fn consumer(channel: &Arc<FakeChannel>, configs: ConsumerConfigs) -> PullConsumer {
        PullConsumer::builder(
            channel.clone(),
            &LinkConfigs::default(),
            configs,
            orders_topology(),
        )
        .build()
        .unwrap()
    }

    #[tokio::test]
    async fn should_hand_deliveries_to_takers_and_ack_them() {
        let channel = Arc::new(FakeChannel::default());
        let consumer = consumer(&channel, ConsumerConfigs::default());

        let (tx, rx) = mpsc::unbounded_channel();
        let (settled_tx, mut settled) = mpsc::unbounded_channel();
        let _activation = channel.activate_with(
            Arc::new(consuming_model(rx, settled_tx)),
            CancellationToken::new(),
        );

        consumer.wait_ready(None).await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Active);

        tx.send(delivery(1, "first")).unwrap();
        tx.send(delivery(2, "second")).unwrap();

        let first = consumer.get_message().await.unwrap();
        let second = consumer.get_message().await.unwrap();
        assert_eq!(first.body, b"first".to_vec());
        assert_eq!(first.receive.queue, "orders");
        assert_eq!(second.body, b"second".to_vec());

        first.ack();
        assert_eq!(settled.recv().await, Some((1, None)));

        second.fail(LinkError::HandlerError("cannot handle".to_owned()));
        assert_eq!(settled.recv().await, Some((2, Some(true))));

        consumer.dispose();
    }

    #[tokio::test]
    async fn should_translate_nack_and_requeue() {
        let channel = Arc::new(FakeChannel::default());
        let consumer = consumer(&channel, ConsumerConfigs::default());

        let (tx, rx) = mpsc::unbounded_channel();
        let (settled_tx, mut settled) = mpsc::unbounded_channel();
        let _activation = channel.activate_with(
            Arc::new(consuming_model(rx, settled_tx)),
            CancellationToken::new(),
        );
        consumer.wait_ready(None).await.unwrap();

        tx.send(delivery(5, "a")).unwrap();
        consumer.get_message().await.unwrap().nack();
        assert_eq!(settled.recv().await, Some((5, Some(false))));

        tx.send(delivery(6, "b")).unwrap();
        consumer.get_message().await.unwrap().requeue();
        assert_eq!(settled.recv().await, Some((6, Some(true))));

        consumer.dispose();
    }

    #[tokio::test]
    async fn should_pass_consumer_settings_to_broker() {
        let channel = Arc::new(FakeChannel::default());
        let configs = ConsumerConfigs {
            prefetch_count: 25,
            priority: 10,
            cancel_on_ha_failover: true,
            auto_ack: true,
            ..Default::default()
        };
        let consumer = consumer(&channel, configs);

        let mut model = MockAmqpModelImpl::new();
        model
            .expect_queue_declare()
            .returning(|name, _, _| Ok(name.to_owned()));
        model
            .expect_basic_qos()
            .withf(|prefetch| *prefetch == 25)
            .times(1)
            .returning(|_| Ok(()));
        model
            .expect_basic_consume()
            .withf(|queue, _, options| {
                queue == "orders"
                    && options.no_ack
                    && options
                        .arguments
                        .inner()
                        .get(&ShortString::from(AMQP_ARGS_PRIORITY))
                        == Some(&AMQPValue::LongInt(10))
                    && options
                        .arguments
                        .inner()
                        .get(&ShortString::from(AMQP_ARGS_CANCEL_ON_HA_FAILOVER))
                        == Some(&AMQPValue::Boolean(true))
            })
            .times(1)
            .returning(|_, _, _| Ok(stream::pending().boxed()));

        let _activation = channel.activate_with(Arc::new(model), CancellationToken::new());

        consumer.wait_ready(None).await.unwrap();
        consumer.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn should_time_out_when_no_message_arrives() {
        let channel = Arc::new(FakeChannel::default());
        let consumer = consumer(
            &channel,
            ConsumerConfigs {
                get_message_timeout_ms: 500,
                ..Default::default()
            },
        );

        assert_eq!(consumer.get_message().await.unwrap_err(), LinkError::Timeout);
        consumer.dispose();
    }

    #[tokio::test]
    async fn should_drop_untaken_messages_when_channel_goes_inactive() {
        let channel = Arc::new(FakeChannel::default());
        let consumer = consumer(&channel, ConsumerConfigs::default());

        let (tx, rx) = mpsc::unbounded_channel();
        let (settled_tx, _settled) = mpsc::unbounded_channel();
        let activation = CancellationToken::new();
        let running = channel.activate_with(
            Arc::new(consuming_model(rx, settled_tx)),
            activation.clone(),
        );
        consumer.wait_ready(None).await.unwrap();

        tx.send(delivery(1, "lost")).unwrap();
        while consumer.core.queue.is_empty() {
            tokio::task::yield_now().await;
        }

        activation.cancel();
        running.await.unwrap();

        assert_eq!(consumer.state(), ConsumerState::Init);
        while !consumer.core.queue.is_empty() {
            tokio::task::yield_now().await;
        }

        let pending = tokio::time::timeout(
            Duration::from_millis(20),
            consumer.get_message_with(&CancellationToken::new()),
        )
        .await;
        assert!(pending.is_err());
        consumer.dispose();
    }

    #[tokio::test]
    async fn should_fail_waiters_and_dispose_channel_on_dispose() {
        let channel = Arc::new(FakeChannel::default());
        let consumer = consumer(&channel, ConsumerConfigs::default());

        let taker = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.get_message().await })
        };
        tokio::task::yield_now().await;

        consumer.dispose();
        consumer.dispose();

        assert_eq!(taker.await.unwrap().unwrap_err(), LinkError::Disposed);
        assert_eq!(consumer.wait_ready(None).await, Err(LinkError::Disposed));
        assert_eq!(consumer.state(), ConsumerState::Disposed);
        assert_eq!(
            channel
                .dispose_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn should_reject_without_requeue_when_pipeline_fails() {
        let channel = Arc::new(FakeChannel::default());
        let consumer = PullConsumer::builder(
            channel.clone(),
            &LinkConfigs::default(),
            ConsumerConfigs::default(),
            orders_topology(),
        )
        .interceptor(Arc::new(GzipInterceptor::default()))
        .build()
        .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let (settled_tx, mut settled) = mpsc::unbounded_channel();
        let _activation = channel.activate_with(
            Arc::new(consuming_model(rx, settled_tx)),
            CancellationToken::new(),
        );
        consumer.wait_ready(None).await.unwrap();

        tx.send(RawDelivery {
            properties: BasicProperties::default()
                .with_content_encoding(ShortString::from("gzip")),
            ..delivery(9, "not gzip at all")
        })
        .unwrap();

        assert_eq!(settled.recv().await, Some((9, Some(false))));
        assert!(consumer.core.queue.is_empty());
        consumer.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn should_stop_reconfiguring_when_disposed_during_recovery_wait() {
        let channel = Arc::new(FakeChannel::default());
        let declares = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = declares.clone();
        let mut model = MockAmqpModelImpl::new();
        model.expect_queue_declare().returning(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(LinkError::DeclareQueueError("access refused".to_owned()))
        });

        let consumer = consumer(&channel, ConsumerConfigs::default());
        let activation = channel.activate_with(Arc::new(model), CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(consumer.state(), ConsumerState::Reconfiguring);

        consumer.dispose();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(activation.is_finished());
        assert_eq!(declares.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.state(), ConsumerState::Disposed);
    }

    #[test]
    fn should_reject_zero_recovery_interval() {
        let channel: Arc<dyn LinkChannel> = Arc::new(FakeChannel::default());
        let configs = ConsumerConfigs {
            recovery_interval_ms: Some(0),
            ..Default::default()
        };

        let res = PullConsumer::builder(channel, &LinkConfigs::default(), configs, orders_topology())
            .build();

        assert!(matches!(res, Err(LinkError::InvalidConfiguration(_))));
    }
}
