// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnecting Consumer
//!
//! [`RetryableConsumer`] keeps a [`Consumer`] running across broker outages.
//! Every attempt connects a fresh client, declares the topology again and
//! runs a consumer until it fails; the next attempt waits for the backoff
//! computed by [`ReconnectState`].
//!
//! With `max_retry_attempts = N` the supervisor gives up after the first
//! failure plus `N` retries and returns [`AmqpError::RetryAttemptsExceeded`].
//! Cancellation always ends `run` with `Ok(())`.
//!
//! A persistent consumer is a retryable one configured through
//! [`RetryableConsumerConfig::persistent`].

use crate::{
    backoff::{BackoffFactory, ExponentialBackoffFactory},
    client::ClientFactory,
    config::RetryableConsumerConfig,
    consumer::Consumer,
    errors::AmqpError,
    handler::Handler,
    logging::{Field, StructuredLogger},
    metrics::Metric,
    retry::{sleep_or_cancel, ReconnectState},
    topology::Setup,
};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct RetryableConsumer {
    client_factory: Arc<dyn ClientFactory>,
    handler: Arc<dyn Handler>,
    config: RetryableConsumerConfig,
    logger: Arc<dyn StructuredLogger>,
    metric: Arc<dyn Metric>,
    setup: Option<Setup>,
    backoff_factory: Arc<dyn BackoffFactory>,
}

impl RetryableConsumer {
    pub fn new(
        client_factory: Arc<dyn ClientFactory>,
        handler: Arc<dyn Handler>,
        config: RetryableConsumerConfig,
        logger: Arc<dyn StructuredLogger>,
        metric: Arc<dyn Metric>,
    ) -> RetryableConsumer {
        RetryableConsumer {
            client_factory,
            handler,
            config,
            logger,
            metric,
            setup: None,
            backoff_factory: Arc::new(ExponentialBackoffFactory::new()),
        }
    }

    /// Topology declared after every (re)connection, before consuming.
    pub fn with_setup(mut self, setup: Setup) -> Self {
        self.setup = Some(setup);
        self
    }

    pub fn with_backoff_factory(mut self, factory: Arc<dyn BackoffFactory>) -> Self {
        self.backoff_factory = factory;
        self
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), AmqpError> {
        let mut state = ReconnectState::new(
            self.backoff_factory.clone(),
            self.config.backoff,
            self.config.health_check_factor,
            self.config.max_retry_attempts,
        );

        loop {
            let started = Instant::now();

            let err = match self.run_once(cancel).await {
                Ok(()) | Err(AmqpError::Canceled) => {
                    self.logger.info("received context cancel", &[]);
                    return Ok(());
                }
                // e.g. an ack failing on the channel the shutdown just closed
                Err(err) if cancel.is_cancelled() => {
                    self.logger.info(
                        "received context cancel, ignoring the last run error",
                        &[Field::error(&err)],
                    );
                    return Ok(());
                }
                Err(err) => err,
            };

            self.logger
                .error("consumer run failed with error", &[Field::error(&err)]);

            let Some(delay) = state.record_failure(started.elapsed()) else {
                self.logger.error(
                    "retry attempts exceeded",
                    &[Field::int("attempts", i64::from(state.failures()))],
                );
                return Err(AmqpError::RetryAttemptsExceeded {
                    attempts: state.failures(),
                    last: err.to_string(),
                });
            };

            if !sleep_or_cancel(cancel, delay).await {
                self.logger.info("received context cancel", &[]);
                return Ok(());
            }
        }
    }

    async fn run_once(&self, cancel: &CancellationToken) -> Result<(), AmqpError> {
        if cancel.is_cancelled() {
            return Err(AmqpError::Canceled);
        }

        self.logger.info("RabbitMQ consumer run", &[]);
        let client = cancel
            .run_until_cancelled(self.client_factory.create(cancel, self.config.client.clone()))
            .await
            .unwrap_or(Err(AmqpError::Canceled))?;

        let result = match &self.setup {
            Some(setup) => cancel
                .run_until_cancelled(client.setup(cancel, setup))
                .await
                .unwrap_or(Err(AmqpError::Canceled)),
            None => Ok(()),
        };

        let result = match result {
            Ok(()) => {
                self.logger.info("starting to run the consumer", &[]);
                Consumer::new(
                    client.clone(),
                    self.handler.clone(),
                    self.logger.clone(),
                    self.metric.clone(),
                    self.config.consumer,
                )
                .run(cancel)
                .await
            }
            Err(err) => Err(err),
        };

        if let Err(err) = client.close().await {
            self.logger
                .warn("cannot close RabbitMQ client connection", &[Field::error(&err)]);
        }

        result
    }
}
