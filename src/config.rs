// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client Configuration
//!
//! Configuration of the connection ([`ClientConfig`]), of a single consumer
//! ([`ConsumerConfig`]) and of the reconnecting supervisors. The supervisors
//! hold the [`ClientConfig`] behind an `Arc` so every reconnect attempt dials
//! with identical parameters.
//!
//! [`RabbitMQSettings`] describes the broker coordinates the way applications
//! usually ship them (deserialized from a config file or read from the
//! environment) and renders them into a [`ClientConfig`].

use crate::{
    backoff::BackoffConfig,
    errors::AmqpError,
    metrics::{Metric, NullMetric},
};
use serde::Deserialize;
use std::{fmt, sync::Arc};

pub const DEFAULT_CONNECTION_NAME: &str = "rabbitmq-client";
pub const DEFAULT_CONNECT_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_HEALTH_CHECK_FACTOR: u32 = 2;

/// Parameters used to dial the broker and open channels.
#[derive(Clone)]
pub struct ClientConfig {
    pub connection_uri: String,
    /// Name reported to the broker, visible in the management UI.
    pub connection_name: String,
    pub metric: Arc<dyn Metric>,
    /// Number of dial (and channel open) attempts before giving up.
    pub connect_retry_attempts: u32,
    pub backoff: BackoffConfig,
}

impl ClientConfig {
    pub fn new(connection_uri: &str) -> ClientConfig {
        ClientConfig {
            connection_uri: connection_uri.to_owned(),
            connection_name: DEFAULT_CONNECTION_NAME.to_owned(),
            metric: Arc::new(NullMetric),
            connect_retry_attempts: DEFAULT_CONNECT_RETRY_ATTEMPTS,
            backoff: BackoffConfig::default(),
        }
    }

    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = name.to_owned();
        self
    }

    pub fn metric(mut self, metric: Arc<dyn Metric>) -> Self {
        self.metric = metric;
        self
    }

    pub fn connect_retry_attempts(mut self, attempts: u32) -> Self {
        self.connect_retry_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

// The URI carries the credentials, keep it out of the logs.
impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("connection_name", &self.connection_name)
            .field("connect_retry_attempts", &self.connect_retry_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// Configuration of a single consumer.
///
/// There is no default prefetch count: a consumer holding too many unacked
/// deliveries distributes the load badly among competing consumers and grows
/// its memory footprint, so every caller has to pick a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub prefetch_count: u16,
}

impl ConsumerConfig {
    pub fn new(prefetch_count: u16) -> ConsumerConfig {
        ConsumerConfig { prefetch_count }
    }
}

/// Configuration of a [`crate::retryable_consumer::RetryableConsumer`].
#[derive(Debug, Clone)]
pub struct RetryableConsumerConfig {
    /// Retries allowed after the first failure; `0` retries forever.
    pub max_retry_attempts: u32,
    /// How many times `backoff.max` a run must stay up to count as healthy.
    ///
    /// E.g. with `backoff.max = 1min` and a factor of `2`, a consumer that ran
    /// for more than 2 minutes before failing starts again from `backoff.base`.
    pub health_check_factor: u32,
    pub backoff: BackoffConfig,
    pub consumer: ConsumerConfig,
    pub client: Arc<ClientConfig>,
}

impl RetryableConsumerConfig {
    pub fn new(client: Arc<ClientConfig>, consumer: ConsumerConfig) -> RetryableConsumerConfig {
        RetryableConsumerConfig {
            max_retry_attempts: 0,
            health_check_factor: DEFAULT_HEALTH_CHECK_FACTOR,
            backoff: BackoffConfig::default(),
            consumer,
            client,
        }
    }

    /// Reconnects forever, waiting `timeout` between attempts.
    pub fn persistent(
        client: Arc<ClientConfig>,
        consumer: ConsumerConfig,
        timeout: std::time::Duration,
    ) -> RetryableConsumerConfig {
        RetryableConsumerConfig {
            backoff: BackoffConfig::constant(timeout),
            ..Self::new(client, consumer)
        }
    }

    pub fn max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    pub fn health_check_factor(mut self, factor: u32) -> Self {
        self.health_check_factor = factor;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Configuration of a [`crate::retryable_producer::RetryableProducer`].
#[derive(Debug, Clone)]
pub struct RetryableProducerConfig {
    /// Retries allowed after the first failure; `0` retries forever.
    pub max_retry_attempts: u32,
    /// See [`RetryableConsumerConfig::health_check_factor`].
    pub health_check_factor: u32,
    pub backoff: BackoffConfig,
    pub client: Arc<ClientConfig>,
}

impl RetryableProducerConfig {
    pub fn new(client: Arc<ClientConfig>) -> RetryableProducerConfig {
        RetryableProducerConfig {
            max_retry_attempts: 0,
            health_check_factor: DEFAULT_HEALTH_CHECK_FACTOR,
            backoff: BackoffConfig::default(),
            client,
        }
    }

    /// Reconnects forever, waiting `timeout` between attempts.
    pub fn persistent(
        client: Arc<ClientConfig>,
        timeout: std::time::Duration,
    ) -> RetryableProducerConfig {
        RetryableProducerConfig {
            backoff: BackoffConfig::constant(timeout),
            ..Self::new(client)
        }
    }

    pub fn max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    pub fn health_check_factor(mut self, factor: u32) -> Self {
        self.health_check_factor = factor;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Broker coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub app_name: String,
}

impl Default for RabbitMQSettings {
    fn default() -> Self {
        RabbitMQSettings {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            app_name: DEFAULT_CONNECTION_NAME.to_owned(),
        }
    }
}

impl RabbitMQSettings {
    /// Reads the settings from the `RABBITMQ_*` and `APP_NAME` environment
    /// variables, keeping the defaults for the missing ones.
    pub fn from_env() -> Result<Self, AmqpError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = RabbitMQSettings::default();

        if let Some(host) = lookup("RABBITMQ_HOST") {
            settings.host = host;
        }

        if let Some(port) = lookup("RABBITMQ_PORT") {
            settings.port = port.parse().map_err(|_| {
                AmqpError::ConfigurationError(format!("RABBITMQ_PORT is not a valid port: {port}"))
            })?;
        }

        if let Some(user) = lookup("RABBITMQ_USER") {
            settings.user = user;
        }

        if let Some(password) = lookup("RABBITMQ_PASSWORD") {
            settings.password = password;
        }

        if let Some(vhost) = lookup("RABBITMQ_VHOST") {
            settings.vhost = vhost;
        }

        if let Some(app_name) = lookup("APP_NAME") {
            settings.app_name = app_name;
        }

        Ok(settings)
    }

    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }

    /// Builds a [`ClientConfig`] connecting with these settings.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(&self.uri()).connection_name(&self.app_name)
    }
}
