// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! Message types travelling through the interceptor pipelines and the pull
//! consumer: [`ConsumedMessage`] on the delivery path, [`PublishMessage`] on
//! the publish path and [`PulledMessage`], the handle an application receives
//! from a pull consumer and settles with its [`AckStrategy`].

use crate::{errors::LinkError, model::RawDelivery, promise::Promise};
use lapin::BasicProperties;
use std::ops::Deref;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Application decision on a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStrategy {
    /// Accept and remove from the queue
    Ack,
    /// Reject, the broker dead-letters or drops it
    Nack,
    /// Reject and put back in the queue
    Requeue,
}

/// Outcome of a delivery: the application's decision, or why none was made.
pub type AckOutcome = Result<AckStrategy, LinkError>;

/// Delivery metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveProperties {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
    /// The message was published with this application's app id
    pub is_from_this_app: bool,
}

/// Message received from the broker.
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    pub body: Vec<u8>,
    pub properties: BasicProperties,
    pub receive: ReceiveProperties,
    /// Fires when the message can no longer be settled, i.e. its channel went inactive
    pub cancellation: CancellationToken,
}

impl ConsumedMessage {
    pub fn new(
        body: Vec<u8>,
        properties: BasicProperties,
        receive: ReceiveProperties,
        cancellation: CancellationToken,
    ) -> Self {
        ConsumedMessage {
            body,
            properties,
            receive,
            cancellation,
        }
    }

    pub(crate) fn from_delivery(
        delivery: RawDelivery,
        queue: &str,
        app_id: &str,
        cancellation: CancellationToken,
    ) -> Self {
        let is_from_this_app = delivery
            .properties
            .app_id()
            .as_ref()
            .is_some_and(|id| id.as_str() == app_id);

        ConsumedMessage {
            receive: ReceiveProperties {
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
                exchange: delivery.exchange,
                routing_key: delivery.routing_key,
                queue: queue.to_owned(),
                is_from_this_app,
            },
            body: delivery.body,
            properties: delivery.properties,
            cancellation,
        }
    }
}

/// Routing of an outgoing message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub routing_key: String,
    /// Ask the broker to return the message when no queue is bound for it
    pub mandatory: bool,
}

/// Message to be published.
#[derive(Debug, Clone, Default)]
pub struct PublishMessage {
    pub body: Vec<u8>,
    pub properties: BasicProperties,
    pub publish: PublishProperties,
}

impl PublishMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        PublishMessage {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn routing_key(mut self, routing_key: &str) -> Self {
        self.publish.routing_key = routing_key.to_owned();
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.publish.mandatory = true;
        self
    }

    pub fn properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }
}

/// Message taken from a pull consumer.
///
/// Settle it with [`ack`](Self::ack), [`nack`](Self::nack),
/// [`requeue`](Self::requeue) or [`fail`](Self::fail); only the first call has
/// an effect. A message dropped unsettled is requeued.
#[derive(Debug)]
pub struct PulledMessage {
    message: ConsumedMessage,
    outcome: Promise<AckOutcome>,
}

impl PulledMessage {
    pub(crate) fn new(message: ConsumedMessage, outcome: Promise<AckOutcome>) -> Self {
        PulledMessage { message, outcome }
    }

    pub fn ack(&self) -> bool {
        self.outcome.resolve(Ok(AckStrategy::Ack))
    }

    pub fn nack(&self) -> bool {
        self.outcome.resolve(Ok(AckStrategy::Nack))
    }

    pub fn requeue(&self) -> bool {
        self.outcome.resolve(Ok(AckStrategy::Requeue))
    }

    /// Settles the message with an application failure. Consumers requeue failed messages.
    pub fn fail(&self, err: LinkError) -> bool {
        self.outcome.resolve(Err(err))
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.is_resolved()
    }
}

impl Deref for PulledMessage {
    type Target = ConsumedMessage;

    fn deref(&self) -> &ConsumedMessage {
        &self.message
    }
}

impl Drop for PulledMessage {
    fn drop(&mut self) {
        if self.requeue() {
            debug!(
                delivery_tag = self.message.receive.delivery_tag,
                "message dropped unsettled, requeuing"
            );
        }
    }
}
