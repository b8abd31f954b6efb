// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient AMQP Client
//!
//! This module provides the error taxonomy shared by every recoverable resource
//! (channel, topology, consumer, producer) and by the per-message path
//! (pull-consumer queue, interceptor pipeline).
//!
//! Cancellation and disposal are distinct outcomes and never merged with
//! generic failures: callers can always tell `Cancelled` from `Disposed`.

use thiserror::Error;

/// Represents errors that can occur while operating the AMQP client.
///
/// Protocol failures carry the text of the underlying broker/client error,
/// user handler failures carry the text the handler produced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The resource was torn down before or while the operation was pending
    #[error("object disposed")]
    Disposed,

    /// The caller's own cancellation signal fired first
    #[error("operation cancelled")]
    Cancelled,

    /// The configured timeout elapsed
    #[error("operation timed out")]
    Timeout,

    /// Error establishing a connection to the broker
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating, using or closing a channel
    #[error("channel failure `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error deleting an exchange
    #[error("failure to delete an exchange `{0}`")]
    DeleteExchangeError(String),

    /// Error declaring a queue
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error deleting a queue
    #[error("failure to delete a queue `{0}`")]
    DeleteQueueError(String),

    /// Error purging a queue
    #[error("failure to purge a queue `{0}`")]
    PurgeQueueError(String),

    /// Error binding or unbinding queues and exchanges
    #[error("failure to bind `{0}`")]
    BindingError(String),

    /// Error declaring or running a consumer
    #[error("consumer failure `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error compressing or decompressing a message body
    #[error("failure to transform body `{0}`")]
    CompressionError(String),

    /// A user supplied routine returned an error
    #[error("handler failure `{0}`")]
    HandlerError(String),

    /// A user supplied routine panicked
    #[error("handler panicked `{0}`")]
    HandlerPanicked(String),

    /// Settings rejected at construction time
    #[error("invalid configuration `{0}`")]
    InvalidConfiguration(String),
}

impl LinkError {
    /// Whether this error is one of the two lifecycle outcomes (`Cancelled`, `Disposed`)
    /// rather than an actual failure.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, LinkError::Cancelled | LinkError::Disposed)
    }
}
