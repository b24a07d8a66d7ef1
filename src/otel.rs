// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Trace context travels in the message headers: the producer injects the
//! current context before publishing and the consumer extracts it to open a
//! consumer span around the handler callback.

use lapin::types::{AMQPValue, FieldTable, ShortString};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

pub(crate) const TRACER_NAME: &str = "rabbitmq-client";

/// Adapter injecting and extracting OpenTelemetry context in RabbitMQ headers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the current trace context into `headers`, keeping the existing entries.
pub(crate) fn inject_context(headers: Option<FieldTable>) -> FieldTable {
    let mut btree = headers.map(|h| h.inner().clone()).unwrap_or_default();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(
            &Context::current(),
            &mut RabbitMQTracePropagator::new(&mut btree),
        )
    });

    FieldTable::from(btree)
}

/// Extracts the trace context of a delivery and opens a consumer span named `name`.
pub(crate) fn new_span(
    headers: Option<&FieldTable>,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut btree = headers.map(|h| h.inner().clone()).unwrap_or_default();

    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(&mut btree))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
