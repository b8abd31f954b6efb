// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Configuration Context
//!
//! [`TopologyConfig`] is what user topology routines receive. It translates
//! declarative calls (declare an exchange, declare a queue, bind them) into
//! protocol operations on the live [`AmqpModel`], awaiting each operation before
//! returning so declarations reach the broker in the order they were written.
//!
//! Nothing is rolled back on failure: the broker may keep a partially applied
//! topology, and the next attempt simply re-runs the idempotent declarations.

use crate::{
    errors::LinkError,
    exchange::{Exchange, ExchangeDefinition, ExchangeKind},
    model::AmqpModel,
    queue::{
        Queue, QueueDefinition, AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
        AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, AMQP_HEADERS_MESSAGE_TTL,
    },
};
use lapin::{
    options::{ExchangeDeclareOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
};
use std::{collections::BTreeMap, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Configuration context bound to one channel activation.
#[derive(Clone)]
pub struct TopologyConfig {
    model: Arc<dyn AmqpModel>,
    cancellation: CancellationToken,
}

impl TopologyConfig {
    pub(crate) fn new(model: Arc<dyn AmqpModel>, cancellation: CancellationToken) -> Self {
        TopologyConfig {
            model,
            cancellation,
        }
    }

    /// Fires when the channel this context is bound to deactivates.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Declares an exchange.
    ///
    /// # Parameters
    /// * `def` - The exchange definition
    ///
    /// # Returns
    /// The declared exchange or `DeclareExchangeError`
    pub async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<Exchange, LinkError> {
        debug!("declaring exchange: {}", def.name);

        match self
            .model
            .exchange_declare(
                &def.name,
                def.kind,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(err)
            }
            _ => {
                debug!("exchange: {} was declared", def.name);
                Ok(Exchange::new(&def.name))
            }
        }
    }

    /// Checks that an exchange exists without creating it.
    pub async fn exchange_declare_passive(&self, name: &str) -> Result<Exchange, LinkError> {
        debug!("checking exchange: {}", name);

        self.model
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| Exchange::new(name))
            .inspect_err(|err| error!(error = err.to_string(), name, "exchange not found"))
    }

    /// The default exchange always exists, no protocol call is made.
    pub fn exchange_declare_default(&self) -> Exchange {
        Exchange::default_exchange()
    }

    pub async fn exchange_delete(
        &self,
        exchange: &Exchange,
        if_unused: bool,
    ) -> Result<(), LinkError> {
        debug!("deleting exchange: {}", exchange.name());

        self.model
            .exchange_delete(exchange.name(), if_unused)
            .await
            .inspect_err(|err| error!(error = err.to_string(), "error to delete the exchange"))
    }

    /// Declares a queue, declaring its retry queue and DLQ first when configured.
    ///
    /// # Parameters
    /// * `def` - The queue definition
    ///
    /// # Returns
    /// The declared queue or `DeclareQueueError`
    pub async fn queue_declare(&self, def: &QueueDefinition) -> Result<Queue, LinkError> {
        debug!("declaring queue: {}", def.name);

        let mut queue_args = def.arguments();

        if def.retry_name.is_some() {
            self.declare_retry(def, &mut queue_args).await?;
        }

        if def.dlq_name.is_some() {
            self.declare_dlq(def, &mut queue_args).await?;
        }

        match self
            .model
            .queue_declare(&def.name, Self::queue_options(def), FieldTable::from(queue_args))
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name.as_str(), "error to declare the queue");
                Err(err)
            }
            Ok(name) => {
                debug!("queue: {} was declared", name);
                Ok(Queue::new(&name))
            }
        }
    }

    /// Checks that a queue exists without creating it.
    pub async fn queue_declare_passive(&self, name: &str) -> Result<Queue, LinkError> {
        debug!("checking queue: {}", name);

        self.model
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|name| Queue::new(&name))
            .inspect_err(|err| error!(error = err.to_string(), name, "queue not found"))
    }

    /// Declares an exclusive, auto-deleted queue whose name is generated by the broker.
    pub async fn queue_declare_exclusive_by_server(&self) -> Result<Queue, LinkError> {
        let name = self
            .model
            .queue_declare(
                "",
                QueueDeclareOptions {
                    passive: false,
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .inspect_err(|err| error!(error = err.to_string(), "error to declare the queue"))?;

        debug!("server named queue: {} was declared", name);
        Ok(Queue::new(&name))
    }

    /// Deletes a queue and returns the number of messages it held.
    pub async fn queue_delete(
        &self,
        queue: &Queue,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, LinkError> {
        self.model
            .queue_delete(queue.name(), if_unused, if_empty)
            .await
            .inspect_err(|err| error!(error = err.to_string(), "error to delete the queue"))
    }

    /// Purges a queue and returns the number of messages removed.
    pub async fn queue_purge(&self, queue: &Queue) -> Result<u32, LinkError> {
        self.model
            .queue_purge(queue.name())
            .await
            .inspect_err(|err| error!(error = err.to_string(), "error to purge the queue"))
    }

    /// Binds a queue to an exchange.
    pub async fn bind_queue(
        &self,
        queue: &Queue,
        exchange: &Exchange,
        routing_key: &str,
        arguments: Option<FieldTable>,
    ) -> Result<(), LinkError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue.name(),
            exchange.name(),
            routing_key
        );

        self.model
            .queue_bind(
                queue.name(),
                exchange.name(),
                routing_key,
                arguments.unwrap_or_default(),
            )
            .await
            .inspect_err(|err| error!(error = err.to_string(), "error to bind queue to exchange"))
    }

    pub async fn unbind_queue(
        &self,
        queue: &Queue,
        exchange: &Exchange,
        routing_key: &str,
        arguments: Option<FieldTable>,
    ) -> Result<(), LinkError> {
        self.model
            .queue_unbind(
                queue.name(),
                exchange.name(),
                routing_key,
                arguments.unwrap_or_default(),
            )
            .await
            .inspect_err(|err| {
                error!(error = err.to_string(), "error to unbind queue from exchange")
            })
    }

    /// Binds `destination` to `source`, messages flow from source to destination.
    pub async fn bind_exchange(
        &self,
        destination: &Exchange,
        source: &Exchange,
        routing_key: &str,
        arguments: Option<FieldTable>,
    ) -> Result<(), LinkError> {
        debug!(
            "binding exchange: {} to the exchange: {} with the key: {}",
            destination.name(),
            source.name(),
            routing_key
        );

        self.model
            .exchange_bind(
                destination.name(),
                source.name(),
                routing_key,
                arguments.unwrap_or_default(),
            )
            .await
            .inspect_err(|err| error!(error = err.to_string(), "error to bind exchanges"))
    }

    pub async fn unbind_exchange(
        &self,
        destination: &Exchange,
        source: &Exchange,
        routing_key: &str,
        arguments: Option<FieldTable>,
    ) -> Result<(), LinkError> {
        self.model
            .exchange_unbind(
                destination.name(),
                source.name(),
                routing_key,
                arguments.unwrap_or_default(),
            )
            .await
            .inspect_err(|err| error!(error = err.to_string(), "error to unbind exchanges"))
    }

    fn queue_options(def: &QueueDefinition) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: false,
            durable: def.durable,
            exclusive: def.exclusive,
            auto_delete: def.delete,
            nowait: false,
        }
    }

    /// Declares the retry queue, which dead-letters back into the main queue once
    /// the retry TTL elapsed, and points the main queue at it.
    async fn declare_retry(
        &self,
        def: &QueueDefinition,
        queue_args: &mut BTreeMap<ShortString, AMQPValue>,
    ) -> Result<(), LinkError> {
        let Some(retry_name) = def.retry_name.as_deref() else {
            return Ok(());
        };

        let mut args = BTreeMap::new();
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from("")),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(def.name.as_str())),
        );
        if let Some(ttl) = def.retry_ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        match self
            .model
            .queue_declare(retry_name, Self::queue_options(def), FieldTable::from(args))
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to declare retry queue");
                Err(err)
            }
            _ => {
                queue_args.insert(
                    ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                    AMQPValue::LongString(LongString::from("")),
                );
                queue_args.insert(
                    ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                    AMQPValue::LongString(LongString::from(retry_name)),
                );
                Ok(())
            }
        }
    }

    /// Declares the DLQ. Without a retry queue, the main queue dead-letters straight into it.
    async fn declare_dlq(
        &self,
        def: &QueueDefinition,
        queue_args: &mut BTreeMap<ShortString, AMQPValue>,
    ) -> Result<(), LinkError> {
        let Some(dlq_name) = def.dlq_name.as_deref() else {
            return Ok(());
        };

        match self
            .model
            .queue_declare(dlq_name, Self::queue_options(def), FieldTable::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to declare dlq");
                Err(err)
            }
            _ => {
                if def.retry_name.is_none() {
                    queue_args.insert(
                        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                        AMQPValue::LongString(LongString::from("")),
                    );
                    queue_args.insert(
                        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                        AMQPValue::LongString(LongString::from(dlq_name)),
                    );
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockAmqpModelImpl;
    use mockall::Sequence;

    fn config(model: MockAmqpModelImpl) -> TopologyConfig {
        TopologyConfig::new(Arc::new(model), CancellationToken::new())
    }

    #[tokio::test]
    async fn should_declare_exchange_with_definition_flags() {
        let mut model = MockAmqpModelImpl::new();
        model
            .expect_exchange_declare()
            .withf(|name, kind, opts, _| {
                name == "events" && *kind == ExchangeKind::Fanout && opts.durable && !opts.passive
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let exchange = config(model)
            .exchange_declare(&ExchangeDefinition::new("events").fanout())
            .await
            .unwrap();

        assert_eq!(exchange.name(), "events");
    }

    #[tokio::test]
    async fn should_declare_retry_and_dlq_before_main_queue() {
        let mut model = MockAmqpModelImpl::new();
        let mut seq = Sequence::new();

        model
            .expect_queue_declare()
            .withf(|name, _, _| name == "orders-retry")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name, _, _| Ok(name.to_owned()));
        model
            .expect_queue_declare()
            .withf(|name, _, _| name == "orders-dlq")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name, _, _| Ok(name.to_owned()));
        model
            .expect_queue_declare()
            .withf(|name, _, args| {
                name == "orders"
                    && args.inner().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
                        == Some(&AMQPValue::LongString(LongString::from("orders-retry")))
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name, _, _| Ok(name.to_owned()));

        let def = QueueDefinition::new("orders").with_retry(1000, 3).with_dlq();
        let queue = config(model).queue_declare(&def).await.unwrap();

        assert_eq!(queue.name(), "orders");
    }

    #[tokio::test]
    async fn should_return_server_generated_queue_name() {
        let mut model = MockAmqpModelImpl::new();
        model
            .expect_queue_declare()
            .withf(|name, opts, _| name.is_empty() && opts.exclusive && opts.auto_delete)
            .returning(|_, _, _| Ok("amq.gen-123".to_owned()));

        let queue = config(model)
            .queue_declare_exclusive_by_server()
            .await
            .unwrap();

        assert_eq!(queue.name(), "amq.gen-123");
    }

    #[tokio::test]
    async fn should_propagate_binding_failure() {
        let mut model = MockAmqpModelImpl::new();
        model
            .expect_queue_bind()
            .returning(|_, _, _, _| Err(LinkError::BindingError("access refused".to_owned())));

        let res = config(model)
            .bind_queue(
                &Queue::new("orders"),
                &Exchange::new("events"),
                "order.created",
                None,
            )
            .await;

        assert_eq!(
            res,
            Err(LinkError::BindingError("access refused".to_owned()))
        );
    }

    #[tokio::test]
    async fn should_not_call_broker_for_default_exchange() {
        let model = MockAmqpModelImpl::new();
        assert_eq!(config(model).exchange_declare_default().name(), "");
    }
}
