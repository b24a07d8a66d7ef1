// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory fakes of the broker boundary, the client and the handler.
//!
//! Every fake records what it was asked to do in a journal that tests assert
//! on; the deliveries handed out by a [`FakeChannel`] write their
//! acknowledgements into the journal of that channel, so the ordering between
//! settling a delivery and closing its channel is observable.

use crate::{
    amqp::{
        AmqpChannel, AmqpConnection, AmqpDelivery, CloseListener, CloseNotification,
        CloseNotifier, CloseReason, ConsumeOptions, Connector, DeliveryStream, PublishOptions,
    },
    client::{ClientFactory, RabbitClient},
    config::ClientConfig,
    errors::AmqpError,
    exchange::ExchangeConfig,
    handler::{Acknowledgement, Handler, HandlerError, Message},
    logging::{Field, StructuredLogger},
    metrics::Metric,
    queue::{QueueBindConfig, QueueConfig},
    topology::Setup,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{types::FieldTable, BasicProperties};
use opentelemetry::Context;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Journal = Arc<Mutex<Vec<ChannelCall>>>;
type DeliveryItem = Result<Box<dyn AmqpDelivery>, AmqpError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCall {
    Qos(u16),
    Consume(String, String, ConsumeOptions),
    Cancel(String),
    Publish {
        exchange: String,
        routing_key: String,
        correlation_id: Option<String>,
    },
    ExchangeDeclare(String),
    QueueDeclare(String),
    QueueBind(String, String),
    Close,
    Ack(u64),
    Nack(u64, bool),
    Reject(u64, bool),
    ClientClose,
}

fn record(journal: &Journal, call: ChannelCall) {
    journal.lock().unwrap().push(call);
}

fn decrement(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub fn broker_close_reason() -> CloseNotification {
    CloseNotification::Error(CloseReason {
        code: 320,
        reason: "CONNECTION_FORCED - broker forced connection closure".to_owned(),
        server: true,
        recover: false,
    })
}

pub struct FakeChannel {
    journal: Journal,
    notifier: CloseNotifier,
    sender: Mutex<Option<mpsc::UnboundedSender<DeliveryItem>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<DeliveryItem>>>,
    qos_error: Mutex<Option<AmqpError>>,
    queue_declare_error: Mutex<Option<AmqpError>>,
    publish_error: Mutex<Option<AmqpError>>,
}

impl FakeChannel {
    pub fn new() -> Arc<FakeChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(FakeChannel {
            journal: Journal::default(),
            notifier: CloseNotifier::new(),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            qos_error: Mutex::new(None),
            queue_declare_error: Mutex::new(None),
            publish_error: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> Vec<ChannelCall> {
        self.journal.lock().unwrap().clone()
    }

    pub fn publishes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, ChannelCall::Publish { .. }))
            .count()
    }

    /// Position of the first journal entry matching `pred`.
    pub fn position(&self, pred: impl Fn(&ChannelCall) -> bool) -> Option<usize> {
        self.calls().iter().position(pred)
    }

    pub fn deliver(&self, mut delivery: FakeDelivery) {
        delivery.journal = self.journal.clone();
        if let Some(tx) = self.sender.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(Box::new(delivery)));
        }
    }

    pub fn fail_stream(&self, err: AmqpError) {
        if let Some(tx) = self.sender.lock().unwrap().as_ref() {
            let _ = tx.send(Err(err));
        }
    }

    /// Ends the deliveries stream without closing the channel.
    pub fn end_deliveries(&self) {
        self.sender.lock().unwrap().take();
    }

    pub fn close_by_broker(&self, notification: CloseNotification) {
        self.notifier.notify(notification);
    }

    pub fn fail_qos(&self, err: AmqpError) {
        *self.qos_error.lock().unwrap() = Some(err);
    }

    pub fn fail_queue_declare(&self, err: AmqpError) {
        *self.queue_declare_error.lock().unwrap() = Some(err);
    }

    pub fn fail_publish(&self, err: AmqpError) {
        *self.publish_error.lock().unwrap() = Some(err);
    }

    fn outcome(slot: &Mutex<Option<AmqpError>>) -> Result<(), AmqpError> {
        match slot.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    fn notify_close(&self) -> CloseListener {
        self.notifier.subscribe()
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        record(&self.journal, ChannelCall::Qos(prefetch_count));
        Self::outcome(&self.qos_error)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        record(
            &self.journal,
            ChannelCall::Consume(queue.to_owned(), consumer_tag.to_owned(), options),
        );

        let rx = self.receiver.lock().unwrap().take().ok_or_else(|| {
            AmqpError::BindingConsumerError(consumer_tag.to_owned(), "already consuming".to_owned())
        })?;

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        record(&self.journal, ChannelCall::Cancel(consumer_tag.to_owned()));
        self.end_deliveries();
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _options: PublishOptions,
        _body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        record(
            &self.journal,
            ChannelCall::Publish {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                correlation_id: properties
                    .correlation_id()
                    .as_ref()
                    .map(|id| id.as_str().to_owned()),
            },
        );
        Self::outcome(&self.publish_error)
    }

    async fn exchange_declare(&self, exchange: &ExchangeConfig) -> Result<(), AmqpError> {
        record(
            &self.journal,
            ChannelCall::ExchangeDeclare(exchange.name().to_owned()),
        );
        Ok(())
    }

    async fn queue_declare(&self, queue: &QueueConfig) -> Result<(), AmqpError> {
        record(&self.journal, ChannelCall::QueueDeclare(queue.name().to_owned()));
        Self::outcome(&self.queue_declare_error)
    }

    async fn queue_bind(&self, binding: &QueueBindConfig) -> Result<(), AmqpError> {
        record(
            &self.journal,
            ChannelCall::QueueBind(
                binding.queue_name().to_owned(),
                binding.exchange_name().to_owned(),
            ),
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        record(&self.journal, ChannelCall::Close);
        self.notifier.notify(CloseNotification::Graceful);
        self.end_deliveries();
        Ok(())
    }
}

#[derive(Clone)]
pub struct FakeDelivery {
    tag: u64,
    body: Vec<u8>,
    correlation_id: Option<String>,
    ack_error: Option<AmqpError>,
    nack_error: Option<AmqpError>,
    reject_error: Option<AmqpError>,
    settle_delay: Duration,
    journal: Journal,
}

impl FakeDelivery {
    pub fn new(tag: u64, body: &[u8]) -> FakeDelivery {
        FakeDelivery {
            tag,
            body: body.to_vec(),
            correlation_id: None,
            ack_error: None,
            nack_error: None,
            reject_error: None,
            settle_delay: Duration::ZERO,
            journal: Journal::default(),
        }
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn fail_ack(mut self) -> Self {
        self.ack_error = Some(AmqpError::AckMessageError("channel/connection is not open".to_owned()));
        self
    }

    pub fn fail_nack(mut self) -> Self {
        self.nack_error = Some(AmqpError::NackMessageError("channel/connection is not open".to_owned()));
        self
    }

    pub fn fail_reject(mut self) -> Self {
        self.reject_error = Some(AmqpError::RejectMessageError("channel/connection is not open".to_owned()));
        self
    }

    /// Makes ack/nack/reject take `delay` before completing.
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    async fn settle(&self, call: ChannelCall, error: &Option<AmqpError>) -> Result<(), AmqpError> {
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }

        record(&self.journal, call);
        match error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AmqpDelivery for FakeDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    fn headers(&self) -> Option<&FieldTable> {
        None
    }

    async fn ack(&self) -> Result<(), AmqpError> {
        self.settle(ChannelCall::Ack(self.tag), &self.ack_error).await
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.settle(ChannelCall::Nack(self.tag, requeue), &self.nack_error)
            .await
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.settle(ChannelCall::Reject(self.tag, requeue), &self.reject_error)
            .await
    }
}

#[derive(Default)]
pub struct FakeConnection {
    channels: Mutex<VecDeque<Arc<FakeChannel>>>,
    channel_failures: AtomicU32,
    opened: AtomicU32,
    closes: AtomicU32,
}

impl FakeConnection {
    pub fn new() -> Arc<FakeConnection> {
        Arc::new(FakeConnection::default())
    }

    /// Channel handed out by the next successful `create_channel`.
    pub fn next_channel(&self) -> Arc<FakeChannel> {
        let channel = FakeChannel::new();
        self.channels.lock().unwrap().push_back(channel.clone());
        channel
    }

    pub fn fail_channels(&self, times: u32) {
        self.channel_failures.store(times, Ordering::SeqCst);
    }

    pub fn channels_opened(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AmqpConnection for FakeConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if decrement(&self.channel_failures) {
            return Err(AmqpError::ChannelError("CHANNEL_ERROR".to_owned()));
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        let channel = self
            .channels
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(FakeChannel::new);
        Ok(channel)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeConnector {
    failures: AtomicU32,
    dials: AtomicU32,
    connection: Arc<FakeConnection>,
}

impl FakeConnector {
    /// Refuses the first `times` dials.
    pub fn failing(times: u32) -> Arc<FakeConnector> {
        Arc::new(FakeConnector {
            failures: AtomicU32::new(times),
            dials: AtomicU32::new(0),
            connection: FakeConnection::new(),
        })
    }

    pub fn with_connection(connection: Arc<FakeConnection>) -> Arc<FakeConnector> {
        Arc::new(FakeConnector {
            failures: AtomicU32::new(0),
            dials: AtomicU32::new(0),
            connection,
        })
    }

    pub fn dials(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn dial(
        &self,
        _uri: &str,
        _connection_name: &str,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if decrement(&self.failures) {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        Ok(self.connection.clone())
    }
}

#[derive(Default)]
pub struct FakeClient {
    channels: Mutex<VecDeque<Arc<FakeChannel>>>,
    opened: Mutex<Vec<Arc<FakeChannel>>>,
    channel_error: Mutex<Option<AmqpError>>,
    setup_error: Mutex<Option<AmqpError>>,
    setup_hangs: AtomicBool,
    setups: AtomicU32,
    closes: AtomicU32,
}

impl FakeClient {
    pub fn new() -> Arc<FakeClient> {
        Arc::new(FakeClient::default())
    }

    /// A client whose next channel is `channel`.
    pub fn with_channel(channel: Arc<FakeChannel>) -> Arc<FakeClient> {
        let client = FakeClient::new();
        client.channels.lock().unwrap().push_back(channel);
        client
    }

    pub fn fail_channels(&self, err: AmqpError) {
        *self.channel_error.lock().unwrap() = Some(err);
    }

    pub fn fail_setup(&self, err: AmqpError) {
        *self.setup_error.lock().unwrap() = Some(err);
    }

    /// Makes `setup` wait forever, like a broker that stopped answering.
    pub fn hang_setup(&self) {
        self.setup_hangs.store(true, Ordering::SeqCst);
    }

    pub fn setups(&self) -> u32 {
        self.setups.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RabbitClient for FakeClient {
    async fn create_channel(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if let Some(err) = self.channel_error.lock().unwrap().clone() {
            return Err(err);
        }

        let channel = self
            .channels
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(FakeChannel::new);
        self.opened.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    async fn setup(&self, _cancel: &CancellationToken, _setup: &Setup) -> Result<(), AmqpError> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        if self.setup_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        match self.setup_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        for channel in self.opened.lock().unwrap().iter() {
            record(&channel.journal, ChannelCall::ClientClose);
        }
        Ok(())
    }
}

/// Hands out the queued clients in order, then refuses to connect.
#[derive(Default)]
pub struct FakeClientFactory {
    clients: Mutex<VecDeque<Result<Arc<FakeClient>, AmqpError>>>,
    creates: AtomicU32,
}

impl FakeClientFactory {
    pub fn new() -> Arc<FakeClientFactory> {
        Arc::new(FakeClientFactory::default())
    }

    pub fn push_client(&self, client: Arc<FakeClient>) {
        self.clients.lock().unwrap().push_back(Ok(client));
    }

    pub fn push_failure(&self, err: AmqpError) {
        self.clients.lock().unwrap().push_back(Err(err));
    }

    pub fn creates(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientFactory for FakeClientFactory {
    async fn create(
        &self,
        _cancel: &CancellationToken,
        _config: Arc<ClientConfig>,
    ) -> Result<Arc<dyn RabbitClient>, AmqpError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        match self.clients.lock().unwrap().pop_front() {
            Some(Ok(client)) => Ok(client),
            Some(Err(err)) => Err(err),
            None => Err(AmqpError::ConnectionError("connection refused".to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Default)]
pub struct RecordingLogger {
    entries: Mutex<Vec<(LogLevel, String, Vec<Field>)>>,
}

impl RecordingLogger {
    pub fn new() -> Arc<RecordingLogger> {
        Arc::new(RecordingLogger::default())
    }

    pub fn contains(&self, level: LogLevel, msg: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|(l, m, _)| *l == level && m == msg)
    }

    /// Fields of the first entry logged with `msg`.
    pub fn fields(&self, msg: &str) -> Option<Vec<Field>> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|(_, m, _)| m == msg)
            .map(|(_, _, fields)| fields.clone())
    }

    fn push(&self, level: LogLevel, msg: &str, fields: &[Field]) {
        self.entries
            .lock()
            .unwrap()
            .push((level, msg.to_owned(), fields.to_vec()));
    }
}

impl StructuredLogger for RecordingLogger {
    fn info(&self, msg: &str, fields: &[Field]) {
        self.push(LogLevel::Info, msg, fields);
    }

    fn warn(&self, msg: &str, fields: &[Field]) {
        self.push(LogLevel::Warn, msg, fields);
    }

    fn error(&self, msg: &str, fields: &[Field]) {
        self.push(LogLevel::Error, msg, fields);
    }
}

/// Metric counting each observation, split by outcome where there is one.
#[derive(Default)]
pub struct CountingMetric {
    pub delivered: AtomicU32,
    pub acks: [AtomicU32; 2],
    pub nacks: [AtomicU32; 2],
    pub rejects: [AtomicU32; 2],
    pub publishes: [AtomicU32; 2],
}

impl CountingMetric {
    pub fn new() -> Arc<CountingMetric> {
        Arc::new(CountingMetric::default())
    }

    /// Reads `counter[success]`.
    pub fn get(counter: &[AtomicU32; 2], success: bool) -> u32 {
        counter[usize::from(success)].load(Ordering::SeqCst)
    }

    fn bump(counter: &[AtomicU32; 2], success: bool) {
        counter[usize::from(success)].fetch_add(1, Ordering::SeqCst);
    }
}

impl Metric for CountingMetric {
    fn observe_connection_failed(&self) {}
    fn observe_connection_retry(&self) {}
    fn observe_connection(&self) {}
    fn observe_channel_connection_failed(&self) {}
    fn observe_channel_connection_retry(&self) {}
    fn observe_channel_connection(&self) {}

    fn observe_msg_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
    }

    fn observe_ack(&self, success: bool) {
        Self::bump(&self.acks, success);
    }

    fn observe_nack(&self, success: bool) {
        Self::bump(&self.nacks, success);
    }

    fn observe_reject(&self, success: bool) {
        Self::bump(&self.rejects, success);
    }

    fn observe_msg_publish(&self, success: bool) {
        Self::bump(&self.publishes, success);
    }
}

/// Handler answering with queued responses, then with a default acknowledgement.
pub struct TestHandler {
    queue: String,
    tag: String,
    auto_ack: bool,
    stop_on_ack: bool,
    stop_on_nack: bool,
    stop_on_reject: bool,
    wait_inflight: bool,
    default: Acknowledgement,
    responses: Mutex<VecDeque<Result<Acknowledgement, String>>>,
    received: Mutex<Vec<Message>>,
    processing: Duration,
}

impl TestHandler {
    pub fn new(queue: &str) -> TestHandler {
        TestHandler {
            queue: queue.to_owned(),
            tag: format!("{queue}-consumer"),
            auto_ack: false,
            stop_on_ack: false,
            stop_on_nack: false,
            stop_on_reject: false,
            wait_inflight: false,
            default: Acknowledgement::Ack,
            responses: Mutex::new(VecDeque::new()),
            received: Mutex::new(Vec::new()),
            processing: Duration::ZERO,
        }
    }

    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    pub fn stop_on_ack_error(mut self) -> Self {
        self.stop_on_ack = true;
        self
    }

    pub fn stop_on_nack_error(mut self) -> Self {
        self.stop_on_nack = true;
        self
    }

    pub fn stop_on_reject_error(mut self) -> Self {
        self.stop_on_reject = true;
        self
    }

    pub fn wait_inflight(mut self) -> Self {
        self.wait_inflight = true;
        self
    }

    pub fn answer(mut self, acknowledgement: Acknowledgement) -> Self {
        self.default = acknowledgement;
        self
    }

    /// Time spent in `receive_message`.
    pub fn processing(mut self, delay: Duration) -> Self {
        self.processing = delay;
        self
    }

    pub fn fail_next(self, err: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(err.to_owned()));
        self
    }

    pub fn build(self) -> Arc<TestHandler> {
        Arc::new(self)
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }

    /// Waits until `count` messages reached the handler.
    pub async fn wait_received(&self, count: usize) {
        loop {
            let received = self.received.lock().unwrap().len();
            if received >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl Handler for TestHandler {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    fn consumer_tag(&self) -> &str {
        &self.tag
    }

    fn queue_auto_ack(&self) -> bool {
        self.auto_ack
    }

    fn must_stop_on_ack_error(&self) -> bool {
        self.stop_on_ack
    }

    fn must_stop_on_nack_error(&self) -> bool {
        self.stop_on_nack
    }

    fn must_stop_on_reject_error(&self) -> bool {
        self.stop_on_reject
    }

    fn wait_to_consume_inflight(&self) -> bool {
        self.wait_inflight
    }

    async fn receive_message(
        &self,
        _ctx: &Context,
        message: &Message,
    ) -> Result<Acknowledgement, HandlerError> {
        self.received.lock().unwrap().push(message.clone());

        if !self.processing.is_zero() {
            tokio::time::sleep(self.processing).await;
        }

        let response = self.responses.lock().unwrap().pop_front();
        match response {
            Some(Ok(acknowledgement)) => Ok(acknowledgement),
            Some(Err(err)) => Err(err.into()),
            None => Ok(self.default),
        }
    }
}
