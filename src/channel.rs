// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! `lapin` implementation of the broker boundary. [`LapinConnector`] dials the
//! broker and every channel opened on the resulting connection reports its end
//! of life through a [`CloseNotifier`], fed by the `on_error` callbacks of the
//! channel and of its connection.

use crate::{
    amqp::{
        AmqpChannel, AmqpConnection, AmqpDelivery, CloseListener, CloseNotification,
        CloseNotifier, CloseReason, ConsumeOptions, Connector, DeliveryStream, PublishOptions,
    },
    errors::AmqpError,
    exchange::ExchangeConfig,
    queue::{QueueBindConfig, QueueConfig},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    protocol::AMQPErrorKind,
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ with `lapin`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn dial(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        let conn = match Connection::connect(uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let channels = Arc::new(Mutex::new(Vec::<CloseNotifier>::new()));

        // a connection level error takes every channel down with it
        let notifiers = channels.clone();
        conn.on_error(move |err| {
            let notification = close_notification(&err);
            let notifiers = notifiers.lock().unwrap_or_else(PoisonError::into_inner);
            for notifier in notifiers.iter() {
                notifier.notify(notification.clone());
            }
        });

        Ok(Arc::new(LapinConnection { conn, channels }))
    }
}

struct LapinConnection {
    conn: Connection,
    channels: Arc<Mutex<Vec<CloseNotifier>>>,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        let channel = match self.conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;
        debug!("channel created");

        let notifier = CloseNotifier::new();
        let on_error = notifier.clone();
        channel.on_error(move |err| {
            on_error.notify(close_notification(&err));
        });

        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.retain(|n| !n.is_closed());
        channels.push(notifier.clone());

        Ok(Arc::new(LapinChannel { channel, notifier }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let result = self
            .conn
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()));

        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        for notifier in channels.iter() {
            notifier.notify(CloseNotification::Graceful);
        }

        result
    }
}

fn close_notification(err: &lapin::Error) -> CloseNotification {
    match err {
        lapin::Error::ProtocolError(amqp_error) => CloseNotification::Error(CloseReason {
            code: amqp_error.get_id(),
            reason: amqp_error.get_message().as_str().to_owned(),
            server: true,
            recover: matches!(amqp_error.kind(), AMQPErrorKind::Soft(_)),
        }),
        other => CloseNotification::Error(CloseReason {
            code: 0,
            reason: other.to_string(),
            server: false,
            recover: false,
        }),
    }
}

struct LapinChannel {
    channel: Channel,
    notifier: CloseNotifier,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn notify_close(&self) -> CloseListener {
        self.notifier.subscribe()
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(prefetch_count, err.to_string()))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.auto_ack,
                    exclusive: options.exclusive,
                    nowait: options.no_wait,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to declare consumer");
                AmqpError::BindingConsumerError(consumer_tag.to_owned(), err.to_string())
            })?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Box::new(LapinDelivery(delivery)) as Box<dyn AmqpDelivery>),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| AmqpError::CancelConsumerError(consumer_tag.to_owned(), err.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    immediate: options.immediate,
                },
                body,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn exchange_declare(&self, exch: &ExchangeConfig) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &exch.name,
                (&exch.kind).into(),
                ExchangeDeclareOptions {
                    passive: exch.passive,
                    durable: exch.durable,
                    auto_delete: exch.auto_delete,
                    internal: exch.internal,
                    nowait: exch.no_wait,
                },
                exch.arguments(),
            )
            .await
            .map_err(|err| AmqpError::DeclareExchangeError(exch.name.clone(), err.to_string()))
    }

    async fn queue_declare(&self, queue: &QueueConfig) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    passive: queue.passive,
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    nowait: queue.no_wait,
                },
                queue.arguments(),
            )
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::DeclareQueueError(queue.name.clone(), err.to_string()))
    }

    async fn queue_bind(&self, binding: &QueueBindConfig) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions {
                    nowait: binding.no_wait,
                },
                binding.arguments(),
            )
            .await
            .map_err(|err| {
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange.clone(),
                    binding.queue.clone(),
                    err.to_string(),
                )
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let result = self
            .channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()));

        self.notifier.notify(CloseNotification::Graceful);
        result
    }
}

struct LapinDelivery(Delivery);

#[async_trait]
impl AmqpDelivery for LapinDelivery {
    fn body(&self) -> &[u8] {
        &self.0.data
    }

    fn correlation_id(&self) -> Option<&str> {
        self.0
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str())
    }

    fn headers(&self) -> Option<&FieldTable> {
        self.0.properties.headers().as_ref()
    }

    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|err| AmqpError::RejectMessageError(err.to_string()))
    }
}
