// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Declarations
//!
//! This module provides the types used to describe the queues a
//! [`crate::topology::Setup`] declares and the bindings between queues and
//! exchanges. Common queue arguments (message TTL, length limits and dead
//! lettering) have dedicated setters; anything else goes through `param`.

use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Declaration of a RabbitMQ queue.
///
/// Built with chained setters, starting from a non-durable, non-exclusive queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueConfig {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl QueueConfig {
    pub fn new(name: &str) -> QueueConfig {
        QueueConfig {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the queue once its last consumer unsubscribes.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes, which is why
    /// topology is declared again after every reconnect.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks that the queue exists, without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) of the queue, in milliseconds.
    pub fn ttl(self, ttl: i32) -> Self {
        self.param(
            AMQP_HEADERS_MESSAGE_TTL,
            AMQPValue::LongInt(LongInt::from(ttl)),
        )
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(self, max: i32) -> Self {
        self.param(
            AMQP_HEADERS_MAX_LENGTH,
            AMQPValue::LongInt(LongInt::from(max)),
        )
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(self, max_bytes: i32) -> Self {
        self.param(
            AMQP_HEADERS_MAX_LENGTH_BYTES,
            AMQPValue::LongInt(LongInt::from(max_bytes)),
        )
    }

    /// Routes rejected, expired and overflowing messages to `exchange` with `routing_key`.
    pub fn dead_letter(self, exchange: &str, routing_key: &str) -> Self {
        self.param(
            AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
            AMQPValue::LongString(LongString::from(exchange)),
        )
        .param(
            AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
            AMQPValue::LongString(LongString::from(routing_key)),
        )
    }

    /// Adds a single broker specific argument.
    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}

/// Binding of a queue to an exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueBindConfig {
    pub(crate) queue: String,
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl QueueBindConfig {
    /// Creates a binding for `queue`; exchange and routing key default to empty.
    pub fn new(queue: &str) -> QueueBindConfig {
        QueueBindConfig {
            queue: queue.to_owned(),
            ..Default::default()
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Adds a binding argument, e.g. the match rules of a headers exchange.
    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}
