// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnecting Producer
//!
//! [`RetryableProducer`] owns a background task that connects a
//! [`Producer`], waits for its channel to close and connects a new one.
//! Publishers always go through the latest live producer; between a closure
//! and the next successful connection they get [`AmqpError::NotConnected`].
//!
//! Nothing waits on the background task, so when the retry budget is
//! exhausted it logs and stops instead of returning an error.

use crate::{
    backoff::{BackoffFactory, ExponentialBackoffFactory},
    client::ClientFactory,
    config::RetryableProducerConfig,
    errors::AmqpError,
    logging::{Field, StructuredLogger},
    metrics::Metric,
    producer::{MessageArgs, Producer},
    retry::{sleep_or_cancel, ReconnectState},
    topology::Setup,
};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

pub struct RetryableProducer {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    producer: RwLock<Option<Arc<Producer>>>,
    client_factory: Arc<dyn ClientFactory>,
    config: RetryableProducerConfig,
    setup: Option<Setup>,
    logger: Arc<dyn StructuredLogger>,
    metric: Arc<dyn Metric>,
}

impl RetryableProducer {
    /// Starts connecting in the background; the producer runs until `cancel` fires.
    pub fn new(
        cancel: CancellationToken,
        client_factory: Arc<dyn ClientFactory>,
        config: RetryableProducerConfig,
        logger: Arc<dyn StructuredLogger>,
        metric: Arc<dyn Metric>,
    ) -> RetryableProducer {
        Self::builder(client_factory, config, logger, metric).start(cancel)
    }

    pub fn builder(
        client_factory: Arc<dyn ClientFactory>,
        config: RetryableProducerConfig,
        logger: Arc<dyn StructuredLogger>,
        metric: Arc<dyn Metric>,
    ) -> RetryableProducerBuilder {
        RetryableProducerBuilder {
            client_factory,
            config,
            logger,
            metric,
            setup: None,
            backoff_factory: Arc::new(ExponentialBackoffFactory::new()),
        }
    }

    /// Publishes through the current producer.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        args: MessageArgs,
    ) -> Result<(), AmqpError> {
        let producer = self.inner.current().ok_or(AmqpError::NotConnected)?;
        producer.publish(exchange, routing_key, body, args).await
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .current()
            .is_some_and(|producer| !producer.is_closed())
    }

    /// Waits for the background task to stop, after cancellation or once the
    /// retry budget is exhausted.
    pub async fn join(&self) {
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                self.inner
                    .logger
                    .error("producer supervisor panicked", &[Field::error(&err)]);
            }
        }
    }
}

/// Optional settings of a [`RetryableProducer`].
pub struct RetryableProducerBuilder {
    client_factory: Arc<dyn ClientFactory>,
    config: RetryableProducerConfig,
    logger: Arc<dyn StructuredLogger>,
    metric: Arc<dyn Metric>,
    setup: Option<Setup>,
    backoff_factory: Arc<dyn BackoffFactory>,
}

impl RetryableProducerBuilder {
    /// Topology declared after every (re)connection.
    pub fn setup(mut self, setup: Setup) -> Self {
        self.setup = Some(setup);
        self
    }

    pub fn backoff_factory(mut self, factory: Arc<dyn BackoffFactory>) -> Self {
        self.backoff_factory = factory;
        self
    }

    pub fn start(self, cancel: CancellationToken) -> RetryableProducer {
        let inner = Arc::new(Inner {
            producer: RwLock::new(None),
            client_factory: self.client_factory,
            config: self.config,
            setup: self.setup,
            logger: self.logger,
            metric: self.metric,
        });

        let supervisor = tokio::spawn(inner.clone().supervise(cancel, self.backoff_factory));

        RetryableProducer {
            inner,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }
}

impl Inner {
    fn current(&self) -> Option<Arc<Producer>> {
        self.producer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn swap(&self, producer: Option<Arc<Producer>>) {
        *self.producer.write().unwrap_or_else(PoisonError::into_inner) = producer;
    }

    async fn supervise(self: Arc<Self>, cancel: CancellationToken, factory: Arc<dyn BackoffFactory>) {
        let mut state = ReconnectState::new(
            factory,
            self.config.backoff,
            self.config.health_check_factor,
            self.config.max_retry_attempts,
        );

        loop {
            let started = Instant::now();

            let producer = match self.connect(&cancel).await {
                Ok(producer) => Arc::new(producer),
                Err(AmqpError::Canceled) => {
                    self.logger.info("received context cancel", &[]);
                    return;
                }
                Err(_) if cancel.is_cancelled() => {
                    self.logger.info("received context cancel", &[]);
                    return;
                }
                Err(err) => {
                    self.logger
                        .error("producer connection failed with error", &[Field::error(&err)]);

                    let Some(delay) = state.record_failure(started.elapsed()) else {
                        self.logger.error(
                            "retry attempts exceeded",
                            &[Field::int("attempts", i64::from(state.failures()))],
                        );
                        return;
                    };

                    if !sleep_or_cancel(&cancel, delay).await {
                        self.logger.info("received context cancel", &[]);
                        return;
                    }
                    continue;
                }
            };

            self.swap(Some(producer.clone()));
            let connected_at = Instant::now();

            let closed = tokio::select! {
                _ = cancel.cancelled() => None,
                notification = producer.closed() => Some(notification),
            };

            self.swap(None);

            if let Err(err) = producer.close().await {
                self.logger
                    .warn("cannot close RabbitMQ client connection", &[Field::error(&err)]);
            }

            match closed {
                None => {
                    self.logger.info("received shut down signal", &[]);
                    return;
                }
                Some(notification) => {
                    self.logger.info(
                        "RabbitMQ producer client closed the connection, trying to reconnect",
                        &[Field::string("reason", notification.to_string())],
                    );
                    state.record_healthy_run(connected_at.elapsed());
                }
            }
        }
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<Producer, AmqpError> {
        if cancel.is_cancelled() {
            return Err(AmqpError::Canceled);
        }

        let client = cancel
            .run_until_cancelled(self.client_factory.create(cancel, self.config.client.clone()))
            .await
            .unwrap_or(Err(AmqpError::Canceled))?;

        let producer = match &self.setup {
            Some(setup) => cancel
                .run_until_cancelled(client.setup(cancel, setup))
                .await
                .unwrap_or(Err(AmqpError::Canceled)),
            None => Ok(()),
        };

        let producer = match producer {
            Ok(()) => cancel
                .run_until_cancelled(Producer::new(
                    cancel,
                    client.clone(),
                    self.logger.clone(),
                    self.metric.clone(),
                ))
                .await
                .unwrap_or(Err(AmqpError::Canceled)),
            Err(err) => Err(err),
        };

        if producer.is_err() {
            if let Err(err) = client.close().await {
                self.logger
                    .error("cannot close RabbitMQ client connection", &[Field::error(&err)]);
            }
        }

        producer
    }
}
