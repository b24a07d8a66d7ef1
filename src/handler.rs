// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! A [`Handler`] binds application logic to a queue. The consumer calls
//! [`Handler::receive_message`] once per delivery and settles the delivery
//! with the [`Acknowledgement`] it returns.

use async_trait::async_trait;
use opentelemetry::Context;

/// Error returned by a handler; it stops the consumer that called it.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Payload of a delivery, only borrowed for the duration of the callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
}

/// How a delivery is settled with the broker. Exactly one decision is taken
/// per delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Ack,
    Nack { requeue: bool },
    Reject { requeue: bool },
}

#[async_trait]
pub trait Handler: Send + Sync {
    fn queue_name(&self) -> &str;
    fn consumer_tag(&self) -> &str;

    /// When true the broker settles deliveries itself and the returned
    /// [`Acknowledgement`] is ignored.
    fn queue_auto_ack(&self) -> bool {
        false
    }

    fn exclusive_consumer(&self) -> bool {
        false
    }

    fn must_stop_on_ack_error(&self) -> bool {
        false
    }

    fn must_stop_on_nack_error(&self) -> bool {
        false
    }

    fn must_stop_on_reject_error(&self) -> bool {
        false
    }

    /// When true, cancellation waits for the delivery being processed to be
    /// settled before closing the channel.
    fn wait_to_consume_inflight(&self) -> bool {
        false
    }

    /// `ctx` carries the trace context propagated in the delivery headers.
    async fn receive_message(
        &self,
        ctx: &Context,
        message: &Message,
    ) -> Result<Acknowledgement, HandlerError>;
}
