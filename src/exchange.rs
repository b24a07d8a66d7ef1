// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Declarations
//!
//! This module provides the types used to describe the exchanges a [`crate::topology::Setup`]
//! declares. Exchanges are the routing mechanism in RabbitMQ that determine how
//! messages are distributed to queues.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::collections::BTreeMap;

/// Constant for the header field used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Exchange type of the delayed message plugin
pub const AMQP_DELAYED_MESSAGE_EXCHANGE: &str = "x-delayed-message";

/// Routing behavior of an exchange.
///
/// `XMessageDelayed` needs the delayed message plugin on the broker and
/// `Custom` names any other plugin provided type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
    Custom(String),
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom(AMQP_DELAYED_MESSAGE_EXCHANGE.to_owned())
            }
            ExchangeKind::Custom(kind) => lapin::ExchangeKind::Custom(kind.clone()),
        }
    }
}

/// Declaration of a RabbitMQ exchange.
///
/// Built with chained setters, starting from a non-durable direct exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeConfig {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) auto_delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeConfig {
    pub fn new(name: &str) -> ExchangeConfig {
        ExchangeConfig {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            auto_delete: false,
            durable: false,
            passive: false,
            internal: false,
            no_wait: false,
            params: BTreeMap::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    pub fn headers(self) -> Self {
        self.kind(ExchangeKind::Headers)
    }

    /// Creates a delayed exchange routing like `routing_kind` ("direct", "fanout", ...).
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn delayed(mut self, routing_kind: &str) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from(routing_kind)),
        );
        self
    }

    /// Replaces the broker specific arguments.
    pub fn params(mut self, params: BTreeMap<ShortString, AMQPValue>) -> Self {
        self.params = params;
        self
    }

    /// Adds a single broker specific argument.
    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    /// Deletes the exchange once no queue is bound to it anymore.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Only checks that the exchange exists, without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Prevents clients from publishing to the exchange directly.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}
