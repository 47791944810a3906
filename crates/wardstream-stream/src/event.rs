//! Stream event vocabulary
//!
//! Wire events arrive as SSE frames whose `data` is JSON. They are parsed
//! into [`StreamEvent`]s; lifecycle events (connected, disconnected, ...)
//! share the same enum so listeners subscribe to both the same way.

use crate::network::QualityTier;
use crate::sse::SseFrame;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use wardstream_error::{Result, WardstreamError};

/// Server clock value: epoch milliseconds or an RFC 3339 string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerTimestamp {
    /// Milliseconds since the Unix epoch
    Millis(i64),
    /// RFC 3339 timestamp
    Rfc3339(DateTime<Utc>),
}

impl ServerTimestamp {
    /// Converts to a UTC datetime
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Millis(ms) => DateTime::from_timestamp_millis(*ms),
            Self::Rfc3339(dt) => Some(*dt),
        }
    }
}

/// Severity / urgency labels used by briefs and alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Critical
    Critical,
    /// Error
    Error,
    /// High
    High,
    /// Medium
    Medium,
    /// Low
    Low,
    /// Informational
    Info,
    /// Any label this client does not know
    #[serde(other)]
    Unknown,
}

impl Severity {
    /// Error and critical severities
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Critical | Self::Error)
    }
}

/// `analysis` / `multimodel-analysis`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisEvent {
    /// Sent as `multimodel-analysis`
    pub multimodel: bool,
    /// Full result payload
    pub result: Value,
    /// Confidence reported with the result
    pub confidence_score: Option<f64>,
    /// Server time of the result
    pub timestamp: Option<ServerTimestamp>,
}

/// `confidence-update`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceUpdate {
    /// Confidence score
    pub score: f64,
    /// Direction of change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trend: Option<String>,
    /// Remaining fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `progress` / `analysis-progress`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Current stage label
    pub stage: String,
    /// Completion in `[0, 1]`
    pub progress: f64,
    /// Estimated seconds remaining
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,
    /// Remaining fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `intelligence-brief`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntelligenceBrief {
    /// Headline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headline: Option<String>,
    /// Summary text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Severity label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// Remaining fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `priority-alert`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityAlert {
    /// Alert title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Alert body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Urgency label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<Severity>,
    /// Remaining fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `heartbeat`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Server clock at send time
    #[serde(default)]
    pub timestamp: Option<ServerTimestamp>,
}

/// Every event delivered to listeners
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// Analysis result
    Analysis(AnalysisEvent),
    /// Confidence change
    ConfidenceUpdate(ConfidenceUpdate),
    /// Analysis progress
    Progress(ProgressUpdate),
    /// Intelligence brief
    IntelligenceBrief(IntelligenceBrief),
    /// Priority alert
    PriorityAlert(PriorityAlert),
    /// Server heartbeat
    Heartbeat(Heartbeat),
    /// Transport opened
    Connected {
        /// Resource the stream serves
        resource_key: String,
    },
    /// Transport closed
    Disconnected {
        /// Resource the stream served
        resource_key: String,
        /// `manual`, `max_retries_exceeded` or `fatal`
        reason: String,
    },
    /// A reconnect is scheduled
    Reconnecting {
        /// Reconnect attempt number, starting at 1
        attempt: u32,
        /// Wait before the attempt
        delay: Duration,
    },
    /// Non-terminal failure
    Error {
        /// Failure description
        message: String,
    },
    /// Network quality tier changed
    QualityChanged {
        /// Previous tier
        from: QualityTier,
        /// New tier
        to: QualityTier,
    },
}

/// Listener subscription key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// [`StreamEvent::Analysis`]
    Analysis,
    /// [`StreamEvent::ConfidenceUpdate`]
    ConfidenceUpdate,
    /// [`StreamEvent::Progress`]
    Progress,
    /// [`StreamEvent::IntelligenceBrief`]
    IntelligenceBrief,
    /// [`StreamEvent::PriorityAlert`]
    PriorityAlert,
    /// [`StreamEvent::Heartbeat`]
    Heartbeat,
    /// [`StreamEvent::Connected`]
    Connected,
    /// [`StreamEvent::Disconnected`]
    Disconnected,
    /// [`StreamEvent::Reconnecting`]
    Reconnecting,
    /// [`StreamEvent::Error`]
    Error,
    /// [`StreamEvent::QualityChanged`]
    QualityChanged,
}

impl EventKind {
    /// Every kind, in declaration order
    pub const ALL: [EventKind; 11] = [
        Self::Analysis,
        Self::ConfidenceUpdate,
        Self::Progress,
        Self::IntelligenceBrief,
        Self::PriorityAlert,
        Self::Heartbeat,
        Self::Connected,
        Self::Disconnected,
        Self::Reconnecting,
        Self::Error,
        Self::QualityChanged,
    ];

    /// Wire/listener name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::ConfidenceUpdate => "confidence-update",
            Self::Progress => "progress",
            Self::IntelligenceBrief => "intelligence-brief",
            Self::PriorityAlert => "priority-alert",
            Self::Heartbeat => "heartbeat",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::QualityChanged => "quality-changed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn malformed(event: &str, reason: impl fmt::Display) -> WardstreamError {
    WardstreamError::MalformedEvent {
        event: event.to_string(),
        reason: reason.to_string(),
    }
}

fn typed<T: serde::de::DeserializeOwned>(event: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| malformed(event, e))
}

impl StreamEvent {
    /// Parses an SSE frame.
    ///
    /// Frames without an `event:` line fall back to a `type` field in the
    /// JSON body. Unknown event names are rejected as malformed.
    pub fn from_frame(frame: &SseFrame) -> Result<Self> {
        let data = frame.data.trim();
        let value: Value = if data.is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(data).map_err(|e| malformed(frame.event_name(), e))?
        };

        let name = match frame.event.as_deref() {
            Some(name) if name != "message" => name.to_string(),
            _ => value
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("message")
                .to_string(),
        };

        Self::from_parts(&name, value)
    }

    /// Builds a typed event from its wire name and JSON payload
    pub fn from_parts(name: &str, value: Value) -> Result<Self> {
        match name {
            "analysis" | "multimodel-analysis" => {
                if !value.is_object() {
                    return Err(malformed(name, "analysis payload must be an object"));
                }
                let confidence_score = value.get("confidence_score").and_then(Value::as_f64);
                let timestamp = value
                    .get("timestamp")
                    .cloned()
                    .and_then(|ts| serde_json::from_value(ts).ok());
                Ok(Self::Analysis(AnalysisEvent {
                    multimodel: name == "multimodel-analysis",
                    result: value,
                    confidence_score,
                    timestamp,
                }))
            }
            "confidence-update" => Ok(Self::ConfidenceUpdate(typed(name, value)?)),
            "progress" | "analysis-progress" => {
                let mut update: ProgressUpdate = typed(name, value)?;
                if !update.progress.is_finite() {
                    return Err(malformed(name, "progress is not a number"));
                }
                update.progress = update.progress.clamp(0.0, 1.0);
                Ok(Self::Progress(update))
            }
            "intelligence-brief" => Ok(Self::IntelligenceBrief(typed(name, value)?)),
            "priority-alert" => Ok(Self::PriorityAlert(typed(name, value)?)),
            "heartbeat" => Ok(Self::Heartbeat(typed(name, value)?)),
            other => Err(malformed(other, "unknown event type")),
        }
    }

    /// Listener key for this event
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Analysis(_) => EventKind::Analysis,
            Self::ConfidenceUpdate(_) => EventKind::ConfidenceUpdate,
            Self::Progress(_) => EventKind::Progress,
            Self::IntelligenceBrief(_) => EventKind::IntelligenceBrief,
            Self::PriorityAlert(_) => EventKind::PriorityAlert,
            Self::Heartbeat(_) => EventKind::Heartbeat,
            Self::Connected { .. } => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::Reconnecting { .. } => EventKind::Reconnecting,
            Self::Error { .. } => EventKind::Error,
            Self::QualityChanged { .. } => EventKind::QualityChanged,
        }
    }

    /// Wire name, used in throttle keys
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Analysis(a) if a.multimodel => "multimodel-analysis",
            other => other.kind().as_str(),
        }
    }

    /// True for events parsed from the wire
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            Self::Analysis(_)
                | Self::ConfidenceUpdate(_)
                | Self::Progress(_)
                | Self::IntelligenceBrief(_)
                | Self::PriorityAlert(_)
        )
    }

    /// Unmodelled payload fields, if the event carries any
    pub fn fields(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Analysis(a) => a.result.as_object(),
            Self::ConfidenceUpdate(c) => Some(&c.extra),
            Self::Progress(p) => Some(&p.extra),
            Self::IntelligenceBrief(b) => Some(&b.extra),
            Self::PriorityAlert(a) => Some(&a.extra),
            _ => None,
        }
    }

    /// Severity carried by the payload
    pub fn severity(&self) -> Option<Severity> {
        match self {
            Self::IntelligenceBrief(b) if b.severity.is_some() => b.severity,
            _ => self
                .fields()
                .and_then(|f| f.get("severity"))
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
        }
    }

    /// Value of an explicit `priority` field
    pub fn explicit_priority(&self) -> Option<&str> {
        self.fields()
            .and_then(|f| f.get("priority"))
            .and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_analysis() {
        let frame = SseFrame::new(
            "multimodel-analysis",
            r#"{"summary":"flooding risk","confidence_score":0.82,"timestamp":1700000000000}"#,
        );
        let StreamEvent::Analysis(analysis) = StreamEvent::from_frame(&frame).unwrap() else {
            panic!("expected analysis");
        };
        assert!(analysis.multimodel);
        assert_eq!(analysis.confidence_score, Some(0.82));
        assert_eq!(
            analysis.timestamp.and_then(|t| t.to_datetime()).map(|d| d.timestamp()),
            Some(1_700_000_000)
        );
    }

    #[test]
    fn test_parse_progress_clamps() {
        let event = StreamEvent::from_parts(
            "analysis-progress",
            json!({"stage": "aggregate", "progress": 1.4, "eta": 3.0}),
        )
        .unwrap();
        match event {
            StreamEvent::Progress(p) => {
                assert_eq!(p.progress, 1.0);
                assert_eq!(p.eta, Some(3.0));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_type_field_fallback() {
        let frame = SseFrame {
            data: r#"{"type":"confidence-update","score":0.4,"trend":"down"}"#.to_string(),
            ..Default::default()
        };
        let event = StreamEvent::from_frame(&frame).unwrap();
        assert_eq!(event.kind(), EventKind::ConfidenceUpdate);
    }

    #[test]
    fn test_heartbeat_timestamp_forms() {
        let millis = StreamEvent::from_frame(&SseFrame::new("heartbeat", r#"{"timestamp":5}"#));
        assert!(matches!(millis, Ok(StreamEvent::Heartbeat(_))));

        let iso = StreamEvent::from_frame(&SseFrame::new(
            "heartbeat",
            r#"{"timestamp":"2024-05-01T12:00:00Z"}"#,
        ))
        .unwrap();
        let StreamEvent::Heartbeat(hb) = iso else {
            panic!("expected heartbeat");
        };
        assert!(matches!(hb.timestamp, Some(ServerTimestamp::Rfc3339(_))));
    }

    #[test]
    fn test_malformed_payloads() {
        let bad_json = StreamEvent::from_frame(&SseFrame::new("analysis", "{not json"));
        assert!(matches!(bad_json, Err(WardstreamError::MalformedEvent { .. })));

        let missing = StreamEvent::from_parts("confidence-update", json!({"trend": "up"}));
        assert!(missing.is_err());

        let unknown = StreamEvent::from_parts("weather", json!({}));
        assert!(matches!(
            unknown,
            Err(WardstreamError::MalformedEvent { event, .. }) if event == "weather"
        ));
    }

    #[test]
    fn test_severity_and_priority_lookup() {
        let brief = StreamEvent::from_parts(
            "intelligence-brief",
            json!({"headline": "x", "severity": "error", "priority": "low"}),
        )
        .unwrap();
        assert_eq!(brief.severity(), Some(Severity::Error));
        assert_eq!(brief.explicit_priority(), Some("low"));

        let alert = StreamEvent::from_parts("priority-alert", json!({"urgency": "galactic"})).unwrap();
        match alert {
            StreamEvent::PriorityAlert(a) => assert_eq!(a.urgency, Some(Severity::Unknown)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_serialize_tagged() {
        let event = StreamEvent::Connected {
            resource_key: "ward-7".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "connected");
        assert_eq!(value["data"]["resource_key"], "ward-7");
    }
}
