//! Error reports and their queued form

use crate::sanitize::sanitize;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use wardstream_error::WardstreamError;
use wardstream_traits::EnvironmentSnapshot;

/// Coarse source of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network or HTTP failure
    Network,
    /// Failed to load a code chunk
    ChunkLoad,
    /// Parse or syntax failure
    Syntax,
    /// Streaming connection failure
    Stream,
    /// Local storage failure
    Storage,
    /// Anything else
    Runtime,
}

impl ErrorCategory {
    /// Classifies a failure from its message
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["chunkloaderror", "chunk load", "loading chunk"]) {
            Self::ChunkLoad
        } else if has(&["syntaxerror", "syntax error", "unexpected token"]) {
            Self::Syntax
        } else if has(&["heartbeat", "event stream", "eventsource", "stream closed"]) {
            Self::Stream
        } else if has(&["quota", "storage"]) {
            Self::Storage
        } else if has(&[
            "network", "fetch", "timeout", "timed out", "connection", "econn", "dns",
        ]) {
            Self::Network
        } else {
            Self::Runtime
        }
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::ChunkLoad => "chunk_load",
            Self::Syntax => "syntax",
            Self::Stream => "stream",
            Self::Storage => "storage",
            Self::Runtime => "runtime",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Informational
    Low,
    /// Degraded behaviour
    Medium,
    /// Feature broken
    High,
    /// Application unusable
    Critical,
}

impl ErrorSeverity {
    /// Default severity for a category
    pub fn for_category(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::Storage => Self::Low,
            ErrorCategory::Network | ErrorCategory::ChunkLoad | ErrorCategory::Stream => {
                Self::Medium
            }
            ErrorCategory::Syntax | ErrorCategory::Runtime => Self::High,
        }
    }
}

/// A failure to be reported
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ErrorReport {
    /// Error name or type
    pub name: Option<String>,
    /// Error message
    pub message: String,
    /// Stack or backtrace text
    pub stack: Option<String>,
    /// Where it happened
    pub component: Option<String>,
    /// Overrides classification
    pub severity: Option<ErrorSeverity>,
    /// Additional properties
    pub extra: Map<String, Value>,
}

impl ErrorReport {
    /// Report with just a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Report for a typed error
    pub fn from_error(error: &WardstreamError) -> Self {
        let mut report = Self::new(error.to_string()).with_name(format!("{:?}", error.code()));
        report
            .extra
            .insert("code".to_string(), Value::from(error.code() as u32));
        if let Some(status) = error.status() {
            report
                .extra
                .insert("status".to_string(), Value::from(status));
        }
        report
    }

    /// Set the error name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the stack
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Set the component
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    /// Override the severity
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Add a property
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }

    /// Sanitized JSON details
    pub fn details(&self) -> Value {
        let mut details = Map::new();
        if let Some(name) = &self.name {
            details.insert("name".to_string(), Value::from(name.as_str()));
        }
        details.insert("message".to_string(), Value::from(self.message.as_str()));
        if let Some(stack) = &self.stack {
            details.insert("stack".to_string(), Value::from(stack.as_str()));
        }
        if let Some(component) = &self.component {
            details.insert("component".to_string(), Value::from(component.as_str()));
        }
        for (k, v) in &self.extra {
            details.entry(k.clone()).or_insert_with(|| v.clone());
        }

        let mut details = Value::Object(details);
        sanitize(&mut details);
        details
    }
}

/// A report waiting to be synced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedError {
    /// Unique id
    pub id: String,
    /// Capture time, milliseconds since the epoch
    pub timestamp_ms: i64,
    /// Sanitized error payload
    pub error_details: Value,
    /// Environment at capture time
    pub context: EnvironmentSnapshot,
    /// Session that captured it
    pub session_id: String,
    /// Accepted by the server
    #[serde(default)]
    pub synced: bool,
    /// Classified source
    pub category: ErrorCategory,
    /// Severity
    pub severity: ErrorSeverity,
}

impl QueuedError {
    /// Builds the queued form of `report`
    pub fn new(report: &ErrorReport, context: EnvironmentSnapshot, session_id: &str) -> Self {
        let category = ErrorCategory::classify(&report.message);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
            error_details: report.details(),
            context,
            session_id: session_id.to_string(),
            synced: false,
            category,
            severity: report
                .severity
                .unwrap_or_else(|| ErrorSeverity::for_category(category)),
        }
    }

    /// Age relative to `now_ms`
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.timestamp_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wardstream_traits::ConnectionType;

    fn snapshot() -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            viewport: None,
            memory: None,
            online: true,
            connection_type: ConnectionType::Wifi,
            platform: "test".to_string(),
        }
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            ErrorCategory::classify("ChunkLoadError: Loading chunk 42 failed"),
            ErrorCategory::ChunkLoad
        );
        assert_eq!(
            ErrorCategory::classify("SyntaxError: Unexpected token <"),
            ErrorCategory::Syntax
        );
        assert_eq!(
            ErrorCategory::classify("Network error: connection reset"),
            ErrorCategory::Network
        );
        assert_eq!(ErrorCategory::classify("undefined is not a function"), ErrorCategory::Runtime);
    }

    #[test]
    fn test_queued_error_sanitizes_and_classifies() {
        let report = ErrorReport::new("fetch failed")
            .with_component("ward-map")
            .with_field("token", "abc");
        let queued = QueuedError::new(&report, snapshot(), "session-1");

        assert_eq!(queued.category, ErrorCategory::Network);
        assert_eq!(queued.severity, ErrorSeverity::Medium);
        assert_eq!(queued.error_details["token"], crate::sanitize::REDACTED);
        assert_eq!(queued.error_details["component"], "ward-map");
        assert!(!queued.synced);
    }

    #[test]
    fn test_wire_shape() {
        let queued = QueuedError::new(&ErrorReport::new("x"), snapshot(), "s");
        let json = serde_json::to_value(&queued).unwrap();
        assert!(json.get("timestampMs").is_some());
        assert!(json.get("errorDetails").is_some());
        assert_eq!(json["sessionId"], "s");
        assert_eq!(json["severity"], "high");
    }

    #[test]
    fn test_from_typed_error() {
        let report = ErrorReport::from_error(&WardstreamError::from_status(503, "down"));
        assert_eq!(report.extra["status"], 503);
        assert_eq!(report.name.as_deref(), Some("Server"));
    }
}
