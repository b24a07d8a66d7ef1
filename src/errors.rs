// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Client
//!
//! This module provides the error type shared by every layer of the client:
//! connection and channel establishment, topology setup, the consumer
//! delivery loop, the producer publish gate and the reconnecting supervisors.
//!
//! Each variant carries the causal message of the underlying failure as a
//! `String`, so a top-level log line carries the full chain while the enum
//! stays comparable in tests.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Invalid client configuration
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`: {2}")]
    BindingExchangeToQueueError(String, String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`: {1}")]
    BindingConsumerError(String, String),

    /// Error cancelling a consumer registration
    #[error("failure to cancel consumer `{0}`: {1}")]
    CancelConsumerError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`: {1}")]
    QoSDeclarationError(u16, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error rejecting a message
    #[error("failure to reject message: {0}")]
    RejectMessageError(String),

    /// The handler callback failed while processing a delivery
    #[error("handler returned error: {0}")]
    HandlerError(String),

    /// The deliveries stream ended without cancellation being requested
    #[error("deliveries stream closed")]
    DeliveriesClosed,

    /// Error reported by the broker while receiving a delivery
    #[error("failure to consume message: {0}")]
    ConsumerError(String),

    /// The broker closed the channel the operation was running on
    #[error("channel closed by the broker: {0}")]
    ChannelClosed(String),

    /// The producer observed a close notification and no longer publishes
    #[error("producer has already closed the connection")]
    ProducerClosed,

    /// The supervised producer has no live connection at the moment
    #[error("producer is not connected")]
    NotConnected,

    /// The supervisor exhausted its retry budget
    #[error("retry attempts exceeded after {attempts} attempts, last error: {last}")]
    RetryAttemptsExceeded { attempts: u32, last: String },

    /// Error closing a channel or a connection
    #[error("failure to close: {0}")]
    CloseError(String),

    /// The operation was aborted by cancellation
    #[error("operation canceled")]
    Canceled,
}
