use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("invalid event definition")]
    Invalid,
    #[error("invalid severity level {0:?}")]
    InvalidSeverity(String),
}

/// A discrete state-change notification for the ingestion gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeEvent {
    #[serde(default)]
    pub id: String,
    pub event_type: String,
    pub org_id: i64,
    /// One of INFO, OK, WARN, ERROR (case-insensitive on decode).
    pub severity: String,
    pub source: String,
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
    pub message: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl ProbeEvent {
    pub fn validate(&self) -> Result<(), EventError> {
        if self.event_type.is_empty()
            || self.org_id == 0
            || self.source.is_empty()
            || self.timestamp == 0
            || self.message.is_empty()
        {
            return Err(EventError::Invalid);
        }
        match self.severity.to_lowercase().as_str() {
            "info" | "ok" | "warn" | "error" | "warning" | "critical" => Ok(()),
            _ => Err(EventError::InvalidSeverity(self.severity.clone())),
        }
    }
}

/// The legacy JSON shape, where tags are a list of `"key:value"` strings.
/// Only ever decoded; the probe encodes msgpack.
#[derive(Debug, Deserialize)]
pub struct LegacyProbeEvent {
    #[serde(default)]
    pub id: String,
    pub event_type: String,
    pub org_id: i64,
    pub severity: String,
    pub source: String,
    pub timestamp: i64,
    pub message: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl From<LegacyProbeEvent> for ProbeEvent {
    fn from(old: LegacyProbeEvent) -> Self {
        let tags = old
            .tags
            .iter()
            .map(|t| match t.split_once(':') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (t.to_string(), String::new()),
            })
            .collect();
        ProbeEvent {
            id: old.id,
            event_type: old.event_type,
            org_id: old.org_id,
            severity: old.severity,
            source: old.source,
            timestamp: old.timestamp,
            message: old.message,
            tags,
        }
    }
}
