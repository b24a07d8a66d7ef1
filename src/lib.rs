// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Client
//!
//! Connection and channel lifecycle management for RabbitMQ, a consumer
//! driving the acknowledgement protocol of a [`handler::Handler`], a producer
//! that stops publishing once its channel is gone, and supervisors keeping
//! both alive across broker outages.
//!
//! ```no_run
//! use rabbitmq_client::{
//!     client::DefaultClientFactory,
//!     config::{ConsumerConfig, RabbitMQSettings, RetryableConsumerConfig},
//!     logging::TracingLogger,
//!     metrics::NullMetric,
//!     retryable_consumer::RetryableConsumer,
//! };
//! # use rabbitmq_client::handler::Handler;
//! # use std::sync::Arc;
//! # async fn run(handler: Arc<dyn Handler>) -> Result<(), rabbitmq_client::errors::AmqpError> {
//! let client = Arc::new(RabbitMQSettings::from_env()?.client_config());
//! let config = RetryableConsumerConfig::new(client, ConsumerConfig::new(20)).max_retry_attempts(5);
//!
//! let consumer = RetryableConsumer::new(
//!     Arc::new(DefaultClientFactory::new()),
//!     handler,
//!     config,
//!     Arc::new(TracingLogger),
//!     Arc::new(NullMetric),
//! );
//! consumer.run(&tokio_util::sync::CancellationToken::new()).await
//! # }
//! ```

mod otel;

pub mod amqp;
pub mod backoff;
pub mod channel;
pub mod client;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod logging;
pub mod metrics;
pub mod producer;
pub mod queue;
pub mod retry;
pub mod retryable_consumer;
pub mod retryable_producer;
pub mod topology;

#[cfg(test)]
mod testing;
