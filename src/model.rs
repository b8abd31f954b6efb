// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Protocol Handle
//!
//! [`AmqpModel`] is the live protocol handle handed to resources while their
//! channel is active. It exposes the protocol operations the client needs and
//! nothing else, so the orchestration layer can be driven by a real
//! [`lapin::Channel`] in production and by mocks in tests.
//!
//! A model is owned for the duration of one channel activation: resources must
//! not retain it past the deactivation signal.

use crate::{errors::LinkError, exchange::ExchangeKind};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeBindOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, ExchangeUnbindOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions, QueuePurgeOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel,
};

/// Stream of deliveries produced by [`AmqpModel::basic_consume`].
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery, LinkError>>;

/// A delivery as received from the broker, before any interceptor ran.
#[derive(Debug, Clone, Default)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

impl From<Delivery> for RawDelivery {
    fn from(delivery: Delivery) -> Self {
        RawDelivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            body: delivery.data,
        }
    }
}

/// Options of a `basic.consume` call.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    pub no_ack: bool,
    pub exclusive: bool,
    pub arguments: FieldTable,
}

/// Protocol operations available on an active channel.
#[async_trait]
pub trait AmqpModel: Send + Sync {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), LinkError>;

    async fn exchange_delete(&self, name: &str, if_unused: bool) -> Result<(), LinkError>;

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), LinkError>;

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), LinkError>;

    /// Declares a queue and returns its name, which the broker generates when `name` is empty.
    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<String, LinkError>;

    /// Deletes a queue and returns the number of messages it held.
    async fn queue_delete(&self, name: &str, if_unused: bool, if_empty: bool)
        -> Result<u32, LinkError>;

    /// Purges a queue and returns the number of messages removed.
    async fn queue_purge(&self, name: &str) -> Result<u32, LinkError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), LinkError>;

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), LinkError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), LinkError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, LinkError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), LinkError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), LinkError>;

    /// Switches the channel into publisher confirm mode.
    async fn confirm_select(&self) -> Result<(), LinkError>;

    /// Publishes a message and, in confirm mode, waits for the broker to confirm it.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), LinkError>;

    async fn close(&self) -> Result<(), LinkError>;
}

#[async_trait]
impl AmqpModel for Channel {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), LinkError> {
        Channel::exchange_declare(self, name, kind.into(), options, arguments)
            .await
            .map_err(|err| LinkError::DeclareExchangeError(err.to_string()))
    }

    async fn exchange_delete(&self, name: &str, if_unused: bool) -> Result<(), LinkError> {
        Channel::exchange_delete(
            self,
            name,
            ExchangeDeleteOptions {
                if_unused,
                nowait: false,
            },
        )
        .await
        .map_err(|err| LinkError::DeleteExchangeError(err.to_string()))
    }

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), LinkError> {
        Channel::exchange_bind(
            self,
            destination,
            source,
            routing_key,
            ExchangeBindOptions { nowait: false },
            arguments,
        )
        .await
        .map_err(|err| LinkError::BindingError(err.to_string()))
    }

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), LinkError> {
        Channel::exchange_unbind(
            self,
            destination,
            source,
            routing_key,
            ExchangeUnbindOptions { nowait: false },
            arguments,
        )
        .await
        .map_err(|err| LinkError::BindingError(err.to_string()))
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<String, LinkError> {
        Channel::queue_declare(self, name, options, arguments)
            .await
            .map(|queue| queue.name().to_string())
            .map_err(|err| LinkError::DeclareQueueError(err.to_string()))
    }

    async fn queue_delete(
        &self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, LinkError> {
        Channel::queue_delete(
            self,
            name,
            QueueDeleteOptions {
                if_unused,
                if_empty,
                nowait: false,
            },
        )
        .await
        .map_err(|err| LinkError::DeleteQueueError(err.to_string()))
    }

    async fn queue_purge(&self, name: &str) -> Result<u32, LinkError> {
        Channel::queue_purge(self, name, QueuePurgeOptions { nowait: false })
            .await
            .map_err(|err| LinkError::PurgeQueueError(err.to_string()))
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), LinkError> {
        Channel::queue_bind(
            self,
            queue,
            exchange,
            routing_key,
            QueueBindOptions { nowait: false },
            arguments,
        )
        .await
        .map_err(|err| LinkError::BindingError(err.to_string()))
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), LinkError> {
        Channel::queue_unbind(self, queue, exchange, routing_key, arguments)
            .await
            .map_err(|err| LinkError::BindingError(err.to_string()))
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), LinkError> {
        Channel::basic_qos(self, prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| LinkError::ChannelError(err.to_string()))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, LinkError> {
        let consumer = Channel::basic_consume(
            self,
            queue,
            consumer_tag,
            BasicConsumeOptions {
                no_local: false,
                no_ack: options.no_ack,
                exclusive: options.exclusive,
                nowait: false,
            },
            options.arguments,
        )
        .await
        .map_err(|err| LinkError::ConsumerError(err.to_string()))?;

        Ok(consumer
            .map(|result| {
                result
                    .map(RawDelivery::from)
                    .map_err(|err| LinkError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), LinkError> {
        Channel::basic_ack(self, delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|_| LinkError::AckMessageError)
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), LinkError> {
        Channel::basic_nack(
            self,
            delivery_tag,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map_err(|_| LinkError::NackMessageError)
    }

    async fn confirm_select(&self) -> Result<(), LinkError> {
        Channel::confirm_select(self, ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| LinkError::ChannelError(err.to_string()))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), LinkError> {
        let confirm = Channel::basic_publish(
            self,
            exchange,
            routing_key,
            BasicPublishOptions {
                mandatory,
                immediate: false,
            },
            body,
            properties,
        )
        .await
        .map_err(|err| LinkError::PublishingError(err.to_string()))?;

        match confirm
            .await
            .map_err(|err| LinkError::PublishingError(err.to_string()))?
        {
            Confirmation::Ack(Some(_)) => Err(LinkError::PublishingError(
                "message returned as unroutable".to_owned(),
            )),
            Confirmation::Nack(_) => Err(LinkError::PublishingError(
                "message nacked by broker".to_owned(),
            )),
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), LinkError> {
        Channel::close(self, 200, "OK")
            .await
            .map_err(|err| LinkError::ChannelError(err.to_string()))
    }
}
