// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Structured Logging
//!
//! Components receive their logger at construction time as an
//! `Arc<dyn StructuredLogger>` instead of reaching for a process wide
//! instance. [`TracingLogger`] is the default implementation and forwards
//! every entry to `tracing`, rendering the structured fields as a JSON object.

use serde_json::{Map, Value};
use tracing::{error, info, warn};

/// A structured key-value pair attached to a log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub key: &'static str,
    pub value: Value,
}

impl Field {
    pub fn error(err: &dyn std::error::Error) -> Self {
        Field {
            key: "error",
            value: Value::String(err.to_string()),
        }
    }

    pub fn string(key: &'static str, value: impl Into<String>) -> Self {
        Field {
            key,
            value: Value::String(value.into()),
        }
    }

    pub fn bool(key: &'static str, value: bool) -> Self {
        Field {
            key,
            value: Value::Bool(value),
        }
    }

    pub fn int(key: &'static str, value: i64) -> Self {
        Field {
            key,
            value: Value::from(value),
        }
    }

    /// Correlation id of a message, omitted from the entry when empty.
    pub fn tracing_id(correlation_id: Option<&str>) -> Self {
        match correlation_id {
            Some(id) if !id.is_empty() => Field::string("tracing_id", id),
            _ => Field::skip(),
        }
    }

    /// A field that is never rendered.
    pub fn skip() -> Self {
        Field {
            key: "",
            value: Value::Null,
        }
    }

    pub fn is_skip(&self) -> bool {
        self.key.is_empty()
    }
}

/// Logger boundary used by the consumer, producer and supervisors.
pub trait StructuredLogger: Send + Sync {
    fn info(&self, msg: &str, fields: &[Field]);
    fn warn(&self, msg: &str, fields: &[Field]);
    fn error(&self, msg: &str, fields: &[Field]);
}

/// Forwards log entries to the `tracing` subscriber installed by the application.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl StructuredLogger for TracingLogger {
    fn info(&self, msg: &str, fields: &[Field]) {
        match render(fields) {
            Some(fields) => info!(fields = %fields, "{}", msg),
            None => info!("{}", msg),
        }
    }

    fn warn(&self, msg: &str, fields: &[Field]) {
        match render(fields) {
            Some(fields) => warn!(fields = %fields, "{}", msg),
            None => warn!("{}", msg),
        }
    }

    fn error(&self, msg: &str, fields: &[Field]) {
        match render(fields) {
            Some(fields) => error!(fields = %fields, "{}", msg),
            None => error!("{}", msg),
        }
    }
}

fn render(fields: &[Field]) -> Option<Value> {
    let map: Map<String, Value> = fields
        .iter()
        .filter(|field| !field.is_skip())
        .map(|field| (field.key.to_owned(), field.value.clone()))
        .collect();

    if map.is_empty() {
        return None;
    }

    Some(Value::Object(map))
}
