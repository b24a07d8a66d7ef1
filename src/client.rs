// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Client
//!
//! A [`Client`] owns one broker connection. Consumers and producers ask it
//! for their own channel, and [`RabbitClient::setup`] declares the topology
//! on a dedicated one.
//!
//! Dialing and opening channels are retried with an exponential backoff up
//! to [`ClientConfig::connect_retry_attempts`] times, reporting every attempt
//! to the configured [`crate::metrics::Metric`].

use crate::{
    amqp::{AmqpChannel, AmqpConnection, Connector},
    backoff::ExponentialBackoff,
    channel::LapinConnector,
    config::ClientConfig,
    errors::AmqpError,
    retry::{retry_with_backoff, Attempt, RetryError},
    topology::Setup,
};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Operations consumers, producers and supervisors need from a connected client.
#[async_trait]
pub trait RabbitClient: Send + Sync {
    /// Opens a new channel, retrying with backoff.
    async fn create_channel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    /// Declares `setup` on a dedicated channel. Any failure, cancellation
    /// included, aborts the setup and leaves the topology in an unknown state.
    async fn setup(&self, cancel: &CancellationToken, setup: &Setup) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Creates connected clients; supervisors call it on every reconnect.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(
        &self,
        cancel: &CancellationToken,
        config: Arc<ClientConfig>,
    ) -> Result<Arc<dyn RabbitClient>, AmqpError>;
}

/// [`ClientFactory`] connecting [`Client`]s through a [`Connector`], `lapin` by default.
#[derive(Clone)]
pub struct DefaultClientFactory {
    connector: Arc<dyn Connector>,
}

impl DefaultClientFactory {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(LapinConnector))
    }

    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        DefaultClientFactory { connector }
    }
}

impl Default for DefaultClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientFactory for DefaultClientFactory {
    async fn create(
        &self,
        cancel: &CancellationToken,
        config: Arc<ClientConfig>,
    ) -> Result<Arc<dyn RabbitClient>, AmqpError> {
        let client = Client::connect_with(self.connector.clone(), cancel, config).await?;
        Ok(Arc::new(client))
    }
}

pub struct Client {
    connection: Arc<dyn AmqpConnection>,
    config: Arc<ClientConfig>,
    closed: AtomicBool,
}

impl Client {
    /// Dials the broker with `lapin`.
    pub async fn connect(
        cancel: &CancellationToken,
        config: Arc<ClientConfig>,
    ) -> Result<Client, AmqpError> {
        Self::connect_with(Arc::new(LapinConnector), cancel, config).await
    }

    pub async fn connect_with(
        connector: Arc<dyn Connector>,
        cancel: &CancellationToken,
        config: Arc<ClientConfig>,
    ) -> Result<Client, AmqpError> {
        let metric = config.metric.as_ref();
        let connector = connector.as_ref();
        let uri = config.connection_uri.as_str();
        let name = config.connection_name.as_str();
        let mut backoff = ExponentialBackoff::new(config.backoff);

        let result = retry_with_backoff(
            cancel,
            Some(config.connect_retry_attempts.max(1)),
            &mut backoff,
            move || async move {
                match connector.dial(uri, name).await {
                    Ok(connection) => {
                        metric.observe_connection();
                        Ok(connection)
                    }
                    Err(err) => {
                        warn!(error = err.to_string(), "failed to connect to rabbitmq, retrying");
                        metric.observe_connection_retry();
                        Err(Attempt::Retryable(err))
                    }
                }
            },
        )
        .await;

        match result {
            Ok(connection) => Ok(Client {
                connection,
                config,
                closed: AtomicBool::new(false),
            }),
            Err(RetryError::Canceled) => Err(AmqpError::Canceled),
            Err(err) => {
                metric.observe_connection_failed();
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

#[async_trait]
impl RabbitClient for Client {
    async fn create_channel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AmqpError::ChannelError("client already closed".to_owned()));
        }

        let metric = self.config.metric.as_ref();
        let connection = self.connection.as_ref();
        let mut backoff = ExponentialBackoff::new(self.config.backoff);

        let result = retry_with_backoff(
            cancel,
            Some(self.config.connect_retry_attempts.max(1)),
            &mut backoff,
            move || async move {
                match connection.create_channel().await {
                    Ok(channel) => {
                        metric.observe_channel_connection();
                        Ok(channel)
                    }
                    Err(err) => {
                        warn!(error = err.to_string(), "failed to open a channel, retrying");
                        metric.observe_channel_connection_retry();
                        Err(Attempt::Retryable(err))
                    }
                }
            },
        )
        .await;

        match result {
            Ok(channel) => Ok(channel),
            Err(RetryError::Canceled) => Err(AmqpError::Canceled),
            Err(err) => {
                metric.observe_channel_connection_failed();
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn setup(&self, cancel: &CancellationToken, setup: &Setup) -> Result<(), AmqpError> {
        if setup.is_empty() {
            return Ok(());
        }

        let channel = self.create_channel(cancel).await?;

        let result = cancel
            .run_until_cancelled(setup.install(channel.as_ref()))
            .await
            .unwrap_or(Err(AmqpError::Canceled));

        if let Err(err) = channel.close().await {
            debug!(error = err.to_string(), "failed to close the setup channel");
        }

        result
    }

    /// Closes the connection. Closing an already closed client is a no-op.
    async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.connection.close().await
    }
}
