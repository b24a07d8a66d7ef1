// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! A [`Consumer`] binds a [`Handler`] to its own channel and settles every
//! delivery with the acknowledgement the handler returns.
//!
//! [`Consumer::run`] drives two tasks: the delivery loop and a watcher racing
//! the channel close notification against cancellation.
//!
//! - Cancellation: the watcher cancels the consumer registration, waits for
//!   the delivery being processed when the handler asks for it, then closes
//!   the channel and the client. `run` returns `Ok(())`.
//! - Broker closure: the watcher stops the delivery loop right away, there is
//!   nothing left to drain on a dead channel. `run` returns
//!   [`AmqpError::ChannelClosed`].
//!
//! A handler error, an acknowledgement failure the handler asked to stop on
//! and an unexpected end of the deliveries stream are fatal to the loop.

use crate::{
    amqp::{AmqpChannel, AmqpDelivery, CloseListener, CloseNotification, ConsumeOptions},
    client::RabbitClient,
    config::ConsumerConfig,
    errors::AmqpError,
    handler::{Acknowledgement, Handler, Message},
    logging::{Field, StructuredLogger},
    metrics::Metric,
    otel,
};
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub struct Consumer {
    client: Arc<dyn RabbitClient>,
    handler: Arc<dyn Handler>,
    logger: Arc<dyn StructuredLogger>,
    metric: Arc<dyn Metric>,
    config: ConsumerConfig,
    inflight: Arc<InflightTracker>,
    tracer: BoxedTracer,
}

impl Consumer {
    pub fn new(
        client: Arc<dyn RabbitClient>,
        handler: Arc<dyn Handler>,
        logger: Arc<dyn StructuredLogger>,
        metric: Arc<dyn Metric>,
        config: ConsumerConfig,
    ) -> Consumer {
        Consumer {
            client,
            handler,
            logger,
            metric,
            config,
            inflight: Arc::new(InflightTracker::default()),
            tracer: global::tracer(otel::TRACER_NAME),
        }
    }

    /// Consumes until `cancel` fires or the consumer fails.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), AmqpError> {
        let channel = self.client.create_channel(cancel).await?;

        let token = cancel.child_token();
        let stop_guard = token.clone().drop_guard();

        let watcher = tokio::spawn(watch_close(
            channel.notify_close(),
            token.clone(),
            Shutdown {
                channel: channel.clone(),
                client: self.client.clone(),
                handler: self.handler.clone(),
                logger: self.logger.clone(),
                inflight: self.inflight.clone(),
            },
        ));

        let result = self.consume(channel.as_ref(), &token).await;

        // stops the watcher when the loop failed on its own
        drop(stop_guard);

        let closed_by_broker = match watcher.await {
            Ok(closed) => closed,
            Err(err) => {
                self.logger
                    .error("RMQ consumer watcher panicked", &[Field::error(&err)]);
                None
            }
        };

        match (result, closed_by_broker) {
            (Ok(()) | Err(AmqpError::DeliveriesClosed), Some(notification)) => {
                Err(AmqpError::ChannelClosed(notification.to_string()))
            }
            (result, _) => result,
        }
    }

    async fn consume(
        &self,
        channel: &dyn AmqpChannel,
        token: &CancellationToken,
    ) -> Result<(), AmqpError> {
        if token.is_cancelled() {
            return Ok(());
        }

        channel.qos(self.config.prefetch_count).await?;

        let mut deliveries = channel
            .consume(
                self.handler.queue_name(),
                self.handler.consumer_tag(),
                ConsumeOptions {
                    auto_ack: self.handler.queue_auto_ack(),
                    exclusive: self.handler.exclusive_consumer(),
                    ..Default::default()
                },
            )
            .await?;

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.logger.warn("RMQ handler stopping", &[]);
                    return Ok(());
                }
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    self.logger
                        .error("failed to receive RMQ delivery", &[Field::error(&err)]);
                    return Err(err);
                }
                None => {
                    self.logger.warn("RMQ handler deliveries channel closed", &[]);
                    return Err(AmqpError::DeliveriesClosed);
                }
            };

            let _inflight = self.inflight.begin();
            // the watcher may already be past its drain wait, the delivery stays
            // unacked and the broker redelivers it
            if token.is_cancelled() {
                return Ok(());
            }

            self.handle_single_delivery(delivery.as_ref()).await?;
        }
    }

    async fn handle_single_delivery(&self, delivery: &dyn AmqpDelivery) -> Result<(), AmqpError> {
        self.metric.observe_msg_delivered();

        let (ctx, mut span) =
            otel::new_span(delivery.headers(), &self.tracer, self.handler.queue_name());

        let message = Message {
            body: delivery.body().to_vec(),
            correlation_id: delivery.correlation_id().map(str::to_owned),
        };

        let acknowledgement = match self.handler.receive_message(&ctx, &message).await {
            Ok(acknowledgement) => acknowledgement,
            Err(err) => {
                let err = AmqpError::HandlerError(err.to_string());
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("handler returned error"),
                });
                return Err(err);
            }
        };

        if self.handler.queue_auto_ack() {
            self.metric.observe_ack(true);
            span.set_status(Status::Ok);
            return Ok(());
        }

        let tracing_id = Field::tracing_id(delivery.correlation_id());

        let result = match acknowledgement {
            Acknowledgement::Ack => {
                let result = delivery.ack().await;
                self.metric.observe_ack(result.is_ok());
                self.settled(
                    result,
                    self.handler.must_stop_on_ack_error(),
                    "successful ack message",
                    "failed to ack message",
                    tracing_id,
                )
            }
            Acknowledgement::Nack { requeue } => {
                let result = delivery.nack(requeue).await;
                self.metric.observe_nack(result.is_ok());
                self.settled(
                    result,
                    self.handler.must_stop_on_nack_error(),
                    "successful nack message",
                    "failed to nack message",
                    tracing_id,
                )
            }
            Acknowledgement::Reject { requeue } => {
                let result = delivery.reject(requeue).await;
                self.metric.observe_reject(result.is_ok());
                self.settled(
                    result,
                    self.handler.must_stop_on_reject_error(),
                    "successful rejected message",
                    "failed to reject message",
                    tracing_id,
                )
            }
        };

        match &result {
            Ok(()) => span.set_status(Status::Ok),
            Err(err) => {
                span.record_error(err);
                span.set_status(Status::Error {
                    description: Cow::from("error to settle msg"),
                });
            }
        }

        result
    }

    /// Logs the outcome of a settlement; failures only propagate when `must_stop`.
    fn settled(
        &self,
        result: Result<(), AmqpError>,
        must_stop: bool,
        success: &str,
        failure: &str,
        tracing_id: Field,
    ) -> Result<(), AmqpError> {
        match result {
            Ok(()) => {
                self.logger.info(success, &[tracing_id]);
                Ok(())
            }
            Err(err) => {
                self.logger.error(failure, &[Field::error(&err), tracing_id]);
                if must_stop {
                    return Err(err);
                }
                Ok(())
            }
        }
    }
}

/// What the watcher releases once the consumer is canceled.
struct Shutdown {
    channel: Arc<dyn AmqpChannel>,
    client: Arc<dyn RabbitClient>,
    handler: Arc<dyn Handler>,
    logger: Arc<dyn StructuredLogger>,
    inflight: Arc<InflightTracker>,
}

/// Returns the close notification when the broker closed the channel first.
async fn watch_close(
    mut listener: CloseListener,
    token: CancellationToken,
    shutdown: Shutdown,
) -> Option<CloseNotification> {
    let logger = shutdown.logger.as_ref();

    tokio::select! {
        biased;
        notification = listener.closed() => {
            token.cancel();
            match &notification {
                CloseNotification::Error(reason) => logger.warn(
                    "RMQ closed the connection",
                    &[
                        Field::string("reason", reason.reason.as_str()),
                        Field::int("code", i64::from(reason.code)),
                        Field::bool("recover", reason.recover),
                        Field::bool("server", reason.server),
                    ],
                ),
                CloseNotification::Graceful => {
                    logger.warn("RMQ closed the connection without an error", &[])
                }
            }
            Some(notification)
        }
        _ = token.cancelled() => {
            logger.info("received context cancel, going to close RMQ connections", &[]);

            if let Err(err) = shutdown.channel.cancel(shutdown.handler.consumer_tag()).await {
                logger.warn(
                    "failed to cancel the RMQ channel while stopping handler",
                    &[Field::error(&err)],
                );
            }

            // deliveries can only be settled while the channel is open
            if shutdown.handler.wait_to_consume_inflight() {
                shutdown.inflight.wait_idle().await;
            }

            if let Err(err) = shutdown.channel.close().await {
                logger.warn("failed to close the RMQ channel", &[Field::error(&err)]);
            }
            logger.info("RMQ consumer stopped", &[]);

            if let Err(err) = shutdown.client.close().await {
                logger.warn("failed to close the RMQ client", &[Field::error(&err)]);
            }
            None
        }
    }
}

/// Counts deliveries between their reception and their settlement.
#[derive(Default)]
struct InflightTracker {
    count: AtomicUsize,
    idle: Notify,
}

impl InflightTracker {
    fn begin(self: &Arc<Self>) -> InflightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InflightGuard(self.clone())
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }

            notified.await;
        }
    }
}

struct InflightGuard(Arc<InflightTracker>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}
