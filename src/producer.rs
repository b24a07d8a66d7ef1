// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Producer
//!
//! A [`Producer`] publishes on its own channel. Before every publish it checks
//! the close notification of that channel without blocking; once a closure
//! was observed the producer stays closed and rejects every later call with
//! [`AmqpError::ProducerClosed`] without touching the network.
//!
//! Outgoing messages carry a generated message id and the current
//! OpenTelemetry context in their headers.

use crate::{
    amqp::{AmqpChannel, CloseListener, CloseNotification, PublishOptions},
    client::RabbitClient,
    errors::AmqpError,
    logging::{Field, StructuredLogger},
    metrics::Metric,
    otel,
};
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per message publishing arguments.
#[derive(Debug, Clone, Default)]
pub struct MessageArgs {
    pub mandatory: bool,
    pub immediate: bool,
    /// Per message TTL, in milliseconds, as a decimal string.
    pub expiration: Option<String>,
    /// Application headers, inspected by headers exchanges.
    pub headers: Option<FieldTable>,
    pub correlation_id: Option<String>,
}

impl MessageArgs {
    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn expiration(mut self, expiration: &str) -> Self {
        self.expiration = Some(expiration.to_owned());
        self
    }

    pub fn headers(mut self, headers: FieldTable) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

pub struct Producer {
    client: Arc<dyn RabbitClient>,
    channel: Arc<dyn AmqpChannel>,
    listener: CloseListener,
    logger: Arc<dyn StructuredLogger>,
    metric: Arc<dyn Metric>,
    closed: AtomicBool,
}

impl Producer {
    /// Opens the channel the producer publishes on.
    pub async fn new(
        cancel: &CancellationToken,
        client: Arc<dyn RabbitClient>,
        logger: Arc<dyn StructuredLogger>,
        metric: Arc<dyn Metric>,
    ) -> Result<Producer, AmqpError> {
        let channel = client.create_channel(cancel).await?;
        let listener = channel.notify_close();

        Ok(Producer {
            client,
            channel,
            listener,
            logger,
            metric,
            closed: AtomicBool::new(false),
        })
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        args: MessageArgs,
    ) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AmqpError::ProducerClosed);
        }

        if let Some(notification) = self.listener.try_closed() {
            // only the caller flipping the flag reports the closure
            if !self.closed.swap(true, Ordering::AcqRel) {
                self.log_closure(&notification, args.correlation_id.as_deref());
            }
            return Err(AmqpError::ProducerClosed);
        }

        let mut properties = BasicProperties::default()
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(otel::inject_context(args.headers));

        if let Some(id) = args.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(id));
        }

        if let Some(expiration) = args.expiration {
            properties = properties.with_expiration(ShortString::from(expiration));
        }

        let result = self
            .channel
            .publish(
                exchange,
                routing_key,
                PublishOptions {
                    mandatory: args.mandatory,
                    immediate: args.immediate,
                },
                body,
                properties,
            )
            .await;

        self.metric.observe_msg_publish(result.is_ok());
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.listener.try_closed().is_some()
    }

    /// Resolves once the channel of the producer is closed.
    pub async fn closed(&self) -> CloseNotification {
        self.listener.clone().closed().await
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        self.client.close().await
    }

    fn log_closure(&self, notification: &CloseNotification, correlation_id: Option<&str>) {
        match notification {
            CloseNotification::Error(reason) => self.logger.warn(
                "RMQ closed the connection",
                &[
                    Field::string("reason", reason.reason.as_str()),
                    Field::int("code", i64::from(reason.code)),
                    Field::bool("recover", reason.recover),
                    Field::bool("server", reason.server),
                    Field::tracing_id(correlation_id),
                ],
            ),
            CloseNotification::Graceful => self.logger.warn(
                "RMQ closed the connection without an error",
                &[Field::tracing_id(correlation_id)],
            ),
        }
    }
}
