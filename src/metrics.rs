// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client Metrics
//!
//! The client reports connection lifecycle and message outcomes through the
//! [`Metric`] trait. Applications plug in their own collector; [`NullMetric`]
//! discards everything.

/// Observer of connection, channel and message events.
#[cfg_attr(test, mockall::automock)]
pub trait Metric: Send + Sync {
    fn observe_connection_failed(&self);
    fn observe_connection_retry(&self);
    fn observe_connection(&self);

    fn observe_channel_connection_failed(&self);
    fn observe_channel_connection_retry(&self);
    fn observe_channel_connection(&self);

    fn observe_msg_delivered(&self);
    fn observe_ack(&self, success: bool);
    fn observe_nack(&self, success: bool);
    fn observe_reject(&self, success: bool);
    fn observe_msg_publish(&self, success: bool);
}

/// Metric implementation that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetric;

impl Metric for NullMetric {
    fn observe_connection_failed(&self) {}
    fn observe_connection_retry(&self) {}
    fn observe_connection(&self) {}
    fn observe_channel_connection_failed(&self) {}
    fn observe_channel_connection_retry(&self) {}
    fn observe_channel_connection(&self) {}
    fn observe_msg_delivered(&self) {}
    fn observe_ack(&self, _success: bool) {}
    fn observe_nack(&self, _success: bool) {}
    fn observe_reject(&self, _success: bool) {}
    fn observe_msg_publish(&self, _success: bool) {}
}
