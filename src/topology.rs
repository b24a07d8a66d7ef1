// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Setup
//!
//! A [`Setup`] is the declarative list of exchanges, queues and queue bindings
//! an application needs. It is installed on a freshly opened channel every time
//! a connection is (re)established, which is safe because re-declaring an
//! identical topology is a no-op for the broker.
//!
//! Installation order matters: exchanges first, then queues, then the bindings
//! that reference both. The first failing declaration aborts the installation;
//! callers must then assume nothing about the state of the topology.

use crate::{
    amqp::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeConfig,
    queue::{QueueBindConfig, QueueConfig},
};
use tracing::{debug, error};

/// Declarative topology installed by [`crate::client::RabbitClient::setup`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Setup {
    pub(crate) exchanges: Vec<ExchangeConfig>,
    pub(crate) queues: Vec<QueueConfig>,
    pub(crate) queue_bindings: Vec<QueueBindConfig>,
}

impl Setup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an exchange declaration.
    pub fn exchange(mut self, def: ExchangeConfig) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue declaration.
    pub fn queue(mut self, def: QueueConfig) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding.
    pub fn queue_binding(mut self, binding: QueueBindConfig) -> Self {
        self.queue_bindings.push(binding);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.queue_bindings.is_empty()
    }

    /// Declares every exchange, then every queue, then every binding on `channel`.
    pub async fn install(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        self.install_exchanges(channel).await?;
        self.install_queues(channel).await?;
        self.bind_queues(channel).await
    }

    async fn install_exchanges(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            if let Err(err) = channel.exchange_declare(exch).await {
                error!(
                    error = err.to_string(),
                    name = %exch.name,
                    "error to declare the exchange"
                );
                return Err(err);
            }

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queues(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        for queue in &self.queues {
            debug!("creating queue: {}", queue.name);

            if let Err(err) = channel.queue_declare(queue).await {
                error!(
                    error = err.to_string(),
                    name = %queue.name,
                    "error to declare the queue"
                );
                return Err(err);
            }

            debug!("queue: {} was created", queue.name);
        }

        Ok(())
    }

    async fn bind_queues(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        for binding in &self.queue_bindings {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue, binding.exchange, binding.routing_key
            );

            if let Err(err) = channel.queue_bind(binding).await {
                error!(error = err.to_string(), "error to bind queue to exchange");
                return Err(err);
            }
        }

        Ok(())
    }
}
