// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Boundary
//!
//! The client drives connections, channels and deliveries through the traits
//! of this module. The wire protocol is left to the AMQP library behind them:
//! [`crate::channel`] implements them with `lapin`, and tests swap in in-memory
//! fakes.
//!
//! A channel publishes its end of life through a [`CloseNotifier`]. The
//! notification is sticky: once a channel is reported closed every listener,
//! including the ones subscribed afterwards, observes the same
//! [`CloseNotification`].

use crate::{
    errors::AmqpError,
    exchange::ExchangeConfig,
    queue::{QueueBindConfig, QueueConfig},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{types::FieldTable, BasicProperties};
use std::{fmt, sync::Arc};
use tokio::sync::watch;

/// Details reported by the broker when it closes a channel or a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
    /// Whether the close was initiated by the server.
    pub server: bool,
    /// Whether the error is a soft one the broker expects clients to recover from.
    pub recover: bool,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.reason, self.code)
    }
}

/// How a channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseNotification {
    /// The broker closed the channel and reported why.
    Error(CloseReason),
    /// The channel was closed without an error payload.
    Graceful,
}

impl fmt::Display for CloseNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseNotification::Error(reason) => reason.fmt(f),
            CloseNotification::Graceful => f.write_str("closed without an error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChannelState {
    Open,
    Closed(CloseNotification),
}

/// Publishing side of a channel close notification.
#[derive(Clone)]
pub struct CloseNotifier {
    tx: Arc<watch::Sender<ChannelState>>,
}

impl CloseNotifier {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ChannelState::Open);
        CloseNotifier { tx: Arc::new(tx) }
    }

    /// Marks the channel closed. Only the first notification is kept; returns
    /// `false` when the channel was already closed.
    pub fn notify(&self, notification: CloseNotification) -> bool {
        self.tx.send_if_modified(|state| match state {
            ChannelState::Open => {
                *state = ChannelState::Closed(notification);
                true
            }
            ChannelState::Closed(_) => false,
        })
    }

    pub fn subscribe(&self) -> CloseListener {
        CloseListener {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.tx.borrow(), ChannelState::Closed(_))
    }
}

impl Default for CloseNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a channel close notification.
#[derive(Clone)]
pub struct CloseListener {
    rx: watch::Receiver<ChannelState>,
}

impl CloseListener {
    /// Non-blocking check for a pending close notification.
    pub fn try_closed(&self) -> Option<CloseNotification> {
        match &*self.rx.borrow() {
            ChannelState::Closed(notification) => Some(notification.clone()),
            ChannelState::Open => None,
        }
    }

    /// Waits until the channel is closed.
    pub async fn closed(&mut self) -> CloseNotification {
        loop {
            if let ChannelState::Closed(notification) = &*self.rx.borrow_and_update() {
                return notification.clone();
            }

            // the notifier is gone together with the channel it belonged to
            if self.rx.changed().await.is_err() {
                return self.try_closed().unwrap_or(CloseNotification::Graceful);
            }
        }
    }
}

/// Options of a consumer registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
}

/// Delivery flags of a published message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub mandatory: bool,
    pub immediate: bool,
}

/// A message handed from the broker to a consumer.
#[async_trait]
pub trait AmqpDelivery: Send + Sync {
    fn body(&self) -> &[u8];
    fn correlation_id(&self) -> Option<&str>;
    fn headers(&self) -> Option<&FieldTable>;

    async fn ack(&self) -> Result<(), AmqpError>;
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// Deliveries of a consumer registration, ending when the registration does.
pub type DeliveryStream = BoxStream<'static, Result<Box<dyn AmqpDelivery>, AmqpError>>;

/// A logical channel multiplexed over a connection.
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn notify_close(&self) -> CloseListener;

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn exchange_declare(&self, exchange: &ExchangeConfig) -> Result<(), AmqpError>;
    async fn queue_declare(&self, queue: &QueueConfig) -> Result<(), AmqpError>;
    async fn queue_bind(&self, binding: &QueueBindConfig) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A physical connection to the broker.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Dials the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}
