//! Inbound message prioritisation
//!
//! Sits between the transport and listeners: assigns each data event a
//! [`MessagePriority`], suppresses repeats of the same event type for the
//! same resource inside the throttle window, optionally shrinks payloads on
//! poor links, and drains in priority order (newest first on ties).

use crate::event::{Severity, StreamEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use wardstream_error::WardstreamError;

/// Delivery priority, ordered lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    /// Delivered last
    Background,
    /// Confidence and progress updates
    Low,
    /// Analyses and ordinary briefs
    Medium,
    /// Alerts
    High,
    /// Never throttled
    Critical,
}

impl MessagePriority {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessagePriority {
    type Err = WardstreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "background" => Ok(Self::Background),
            "low" => Ok(Self::Low),
            "medium" | "normal" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" | "urgent" => Ok(Self::Critical),
            other => Err(WardstreamError::Config(format!("unknown priority '{}'", other))),
        }
    }
}

/// Assigns a priority to an event.
///
/// Error or critical severity always wins, then an explicit `priority`
/// field, then the per-type defaults.
pub fn infer_priority(event: &StreamEvent) -> MessagePriority {
    if event.severity().is_some_and(|s| s.is_critical()) {
        return MessagePriority::Critical;
    }
    if let Some(explicit) = event.explicit_priority().and_then(|p| p.parse().ok()) {
        return explicit;
    }

    match event {
        StreamEvent::PriorityAlert(alert) => match alert.urgency {
            Some(urgency) if urgency.is_critical() => MessagePriority::Critical,
            _ => MessagePriority::High,
        },
        StreamEvent::IntelligenceBrief(brief) => match brief.severity {
            Some(Severity::High) => MessagePriority::High,
            Some(Severity::Low) | Some(Severity::Info) => MessagePriority::Low,
            _ => MessagePriority::Medium,
        },
        StreamEvent::Analysis(_) => MessagePriority::Medium,
        StreamEvent::ConfidenceUpdate(_) | StreamEvent::Progress(_) => MessagePriority::Low,
        _ => MessagePriority::Background,
    }
}

/// Limits applied when payloads are reduced
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadLimits {
    /// Max characters kept in `summary` fields
    pub summary_chars: usize,
    /// Max items kept in arrays
    pub array_items: usize,
    /// Object-valued fields removed entirely
    pub detail_keys: Vec<String>,
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self {
            summary_chars: 200,
            array_items: 5,
            detail_keys: ["details", "detail", "raw", "debug"]
                .iter()
                .map(|k| k.to_string())
                .collect(),
        }
    }
}

fn truncate_chars(text: &mut String, limit: usize) {
    if let Some((idx, _)) = text.char_indices().nth(limit) {
        text.truncate(idx);
    }
}

/// Shrinks a JSON payload in place
pub fn reduce_value(value: &mut Value, limits: &PayloadLimits) {
    match value {
        Value::Object(map) => {
            map.retain(|key, v| !(v.is_object() && limits.detail_keys.iter().any(|d| d == key)));
            for (key, v) in map.iter_mut() {
                match v {
                    Value::String(s) if key == "summary" => truncate_chars(s, limits.summary_chars),
                    other => reduce_value(other, limits),
                }
            }
        }
        Value::Array(items) => {
            items.truncate(limits.array_items);
            for item in items.iter_mut() {
                reduce_value(item, limits);
            }
        }
        _ => {}
    }
}

/// Shrinks an event's payload
pub fn reduce_event(event: &mut StreamEvent, limits: &PayloadLimits) {
    match event {
        StreamEvent::Analysis(analysis) => reduce_value(&mut analysis.result, limits),
        StreamEvent::IntelligenceBrief(brief) => {
            if let Some(summary) = brief.summary.as_mut() {
                truncate_chars(summary, limits.summary_chars);
            }
            let mut extra = Value::Object(std::mem::take(&mut brief.extra));
            reduce_value(&mut extra, limits);
            if let Value::Object(map) = extra {
                brief.extra = map;
            }
        }
        StreamEvent::PriorityAlert(alert) => {
            let mut extra = Value::Object(std::mem::take(&mut alert.extra));
            reduce_value(&mut extra, limits);
            if let Value::Object(map) = extra {
                alert.extra = map;
            }
        }
        _ => {}
    }
}

/// Queue tuning
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityQueueConfig {
    /// Minimum spacing between deliveries with the same throttle key
    pub throttle: Duration,
    /// Messages drained per batch in the foreground
    pub batch_size: usize,
    /// Queue bound; the lowest-priority, oldest message is evicted beyond it
    pub max_queue_size: usize,
    /// Payload reduction limits
    pub limits: PayloadLimits,
}

impl Default for PriorityQueueConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(1000),
            batch_size: 10,
            max_queue_size: 500,
            limits: PayloadLimits::default(),
        }
    }
}

impl PriorityQueueConfig {
    /// Set the throttle window
    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    /// Set the foreground batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the queue bound
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size.max(1);
        self
    }
}

/// A prioritised inbound event
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    /// The event
    pub event: StreamEvent,
    /// Assigned priority
    pub priority: MessagePriority,
    /// When it was enqueued
    pub received_at: Instant,
    /// `"{event_type}:{resource_key}"`
    pub throttle_key: String,
    seq: u64,
}

impl QueuedMessage {
    fn rank(&self) -> (MessagePriority, u64) {
        (self.priority, self.seq)
    }
}

/// Result of [`MessagePriorityQueue::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Accepted at this priority
    Queued(MessagePriority),
    /// Suppressed by the throttle window
    Throttled,
}

/// In-memory priority queue for inbound events
#[derive(Debug)]
pub struct MessagePriorityQueue {
    config: PriorityQueueConfig,
    messages: Vec<QueuedMessage>,
    last_delivered: HashMap<String, Instant>,
    next_seq: u64,
    backgrounded: bool,
    reduce_payloads: bool,
    evicted: u64,
}

impl MessagePriorityQueue {
    /// Creates an empty queue
    pub fn new(config: PriorityQueueConfig) -> Self {
        Self {
            config,
            messages: Vec::new(),
            last_delivered: HashMap::new(),
            next_seq: 0,
            backgrounded: false,
            reduce_payloads: false,
            evicted: 0,
        }
    }

    /// Batches shrink to one message while backgrounded
    pub fn set_backgrounded(&mut self, backgrounded: bool) {
        self.backgrounded = backgrounded;
    }

    /// Enables payload reduction for subsequently enqueued events
    pub fn set_payload_reduction(&mut self, enabled: bool) {
        self.reduce_payloads = enabled;
    }

    /// Whether payloads are currently reduced
    pub fn payload_reduction(&self) -> bool {
        self.reduce_payloads
    }

    /// Current batch size
    pub fn batch_size(&self) -> usize {
        if self.backgrounded {
            1
        } else {
            self.config.batch_size
        }
    }

    /// Queues `event` for `resource_key` unless throttled
    pub fn enqueue(&mut self, mut event: StreamEvent, resource_key: &str) -> EnqueueOutcome {
        let priority = infer_priority(&event);
        let throttle_key = format!("{}:{}", event.event_type(), resource_key);

        if priority != MessagePriority::Critical {
            if let Some(last) = self.last_delivered.get(&throttle_key) {
                if last.elapsed() < self.config.throttle {
                    tracing::debug!(key = %throttle_key, "Message throttled");
                    return EnqueueOutcome::Throttled;
                }
            }
        }

        if self.reduce_payloads {
            reduce_event(&mut event, &self.config.limits);
        }

        // Window opens at acceptance; delivery refreshes it.
        let now = Instant::now();
        if priority != MessagePriority::Critical {
            self.last_delivered.insert(throttle_key.clone(), now);
        }

        self.next_seq += 1;
        self.messages.push(QueuedMessage {
            event,
            priority,
            received_at: now,
            throttle_key,
            seq: self.next_seq,
        });

        if self.messages.len() > self.config.max_queue_size {
            if let Some(idx) = self
                .messages
                .iter()
                .enumerate()
                .min_by_key(|(_, m)| m.rank())
                .map(|(idx, _)| idx)
            {
                let dropped = self.messages.swap_remove(idx);
                self.evicted += 1;
                tracing::warn!(
                    key = %dropped.throttle_key,
                    priority = %dropped.priority,
                    "Message queue full, evicting lowest priority"
                );
            }
        }

        EnqueueOutcome::Queued(priority)
    }

    /// Removes the next batch: highest priority first, newest first on ties
    pub fn drain_batch(&mut self) -> Vec<QueuedMessage> {
        if self.messages.is_empty() {
            return Vec::new();
        }

        self.messages.sort_by_key(|m| std::cmp::Reverse(m.rank()));
        let take = self.batch_size().min(self.messages.len());
        let batch: Vec<_> = self.messages.drain(..take).collect();

        let now = Instant::now();
        for message in &batch {
            self.last_delivered.insert(message.throttle_key.clone(), now);
        }
        batch
    }

    /// Queued messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages evicted for capacity
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Drops queued messages and throttle history
    pub fn clear(&mut self) {
        self.messages.clear();
        self.last_delivered.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str, payload: Value) -> StreamEvent {
        StreamEvent::from_parts(name, payload).unwrap()
    }

    fn queue() -> MessagePriorityQueue {
        MessagePriorityQueue::new(PriorityQueueConfig::default())
    }

    #[test]
    fn test_inference_table() {
        assert_eq!(
            infer_priority(&event("priority-alert", json!({"title": "x"}))),
            MessagePriority::High
        );
        assert_eq!(
            infer_priority(&event("priority-alert", json!({"urgency": "critical"}))),
            MessagePriority::Critical
        );
        assert_eq!(
            infer_priority(&event("intelligence-brief", json!({"headline": "x"}))),
            MessagePriority::Medium
        );
        assert_eq!(
            infer_priority(&event("intelligence-brief", json!({"severity": "high"}))),
            MessagePriority::High
        );
        assert_eq!(
            infer_priority(&event("analysis", json!({"summary": "x"}))),
            MessagePriority::Medium
        );
        assert_eq!(
            infer_priority(&event("confidence-update", json!({"score": 0.5}))),
            MessagePriority::Low
        );
        assert_eq!(
            infer_priority(&event("progress", json!({"stage": "a", "progress": 0.1}))),
            MessagePriority::Low
        );
    }

    #[test]
    fn test_explicit_and_forced_priority() {
        assert_eq!(
            infer_priority(&event("analysis", json!({"priority": "background"}))),
            MessagePriority::Background
        );
        assert_eq!(
            infer_priority(&event(
                "analysis",
                json!({"priority": "low", "severity": "error"})
            )),
            MessagePriority::Critical
        );
    }

    #[test]
    fn test_drain_order_priority_then_newest() {
        let mut q = queue();
        q.enqueue(event("analysis", json!({"n": 1})), "a");
        q.enqueue(event("analysis", json!({"n": 2})), "b");
        q.enqueue(event("priority-alert", json!({"title": "t"})), "a");
        q.enqueue(event("progress", json!({"stage": "s", "progress": 0.2})), "a");

        let order: Vec<_> = q
            .drain_batch()
            .into_iter()
            .map(|m| (m.priority, m.throttle_key))
            .collect();
        assert_eq!(
            order,
            vec![
                (MessagePriority::High, "priority-alert:a".to_string()),
                (MessagePriority::Medium, "analysis:b".to_string()),
                (MessagePriority::Medium, "analysis:a".to_string()),
                (MessagePriority::Low, "progress:a".to_string()),
            ]
        );
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_after_delivery() {
        let mut q = queue();
        assert!(matches!(
            q.enqueue(event("analysis", json!({})), "ward-1"),
            EnqueueOutcome::Queued(_)
        ));
        q.drain_batch();

        assert_eq!(
            q.enqueue(event("analysis", json!({})), "ward-1"),
            EnqueueOutcome::Throttled
        );
        // different resource, different key
        assert!(matches!(
            q.enqueue(event("analysis", json!({})), "ward-2"),
            EnqueueOutcome::Queued(_)
        ));
        // critical bypasses the window
        assert_eq!(
            q.enqueue(event("analysis", json!({"severity": "critical"})), "ward-1"),
            EnqueueOutcome::Queued(MessagePriority::Critical)
        );

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(matches!(
            q.enqueue(event("analysis", json!({})), "ward-1"),
            EnqueueOutcome::Queued(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_within_one_flush() {
        let mut q = queue();
        let progress = || event("progress", json!({"stage": "triage", "progress": 0.1}));

        assert_eq!(
            q.enqueue(progress(), "ward-1"),
            EnqueueOutcome::Queued(MessagePriority::Low)
        );
        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(q.enqueue(progress(), "ward-1"), EnqueueOutcome::Throttled);

        let delivered = q
            .drain_batch()
            .into_iter()
            .filter(|m| m.throttle_key == "progress:ward-1")
            .count();
        assert_eq!(delivered, 1);
    }

    #[test]
    fn test_background_batch_size() {
        let mut q = MessagePriorityQueue::new(PriorityQueueConfig::default().with_batch_size(3));
        for n in 0..5 {
            q.enqueue(event("analysis", json!({ "n": n })), &format!("w{}", n));
        }
        assert_eq!(q.drain_batch().len(), 3);

        q.set_backgrounded(true);
        assert_eq!(q.batch_size(), 1);
        assert_eq!(q.drain_batch().len(), 1);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_capacity_evicts_lowest() {
        let mut q = MessagePriorityQueue::new(PriorityQueueConfig::default().with_max_queue_size(2));
        q.enqueue(event("progress", json!({"stage": "s", "progress": 0.1})), "a");
        q.enqueue(event("priority-alert", json!({})), "a");
        q.enqueue(event("analysis", json!({})), "a");

        assert_eq!(q.len(), 2);
        assert_eq!(q.evicted(), 1);
        let priorities: Vec<_> = q.drain_batch().into_iter().map(|m| m.priority).collect();
        assert_eq!(priorities, vec![MessagePriority::High, MessagePriority::Medium]);
    }

    #[test]
    fn test_payload_reduction() {
        let long = "x".repeat(450);
        let mut q = queue();
        q.set_payload_reduction(true);
        q.enqueue(
            event(
                "analysis",
                json!({
                    "summary": long,
                    "hotspots": [1, 2, 3, 4, 5, 6, 7],
                    "details": {"model": "m"},
                    "confidence_score": 0.7
                }),
            ),
            "a",
        );

        let message = q.drain_batch().remove(0);
        let StreamEvent::Analysis(analysis) = message.event else {
            panic!("expected analysis");
        };
        assert_eq!(analysis.result["summary"].as_str().unwrap().chars().count(), 200);
        assert_eq!(analysis.result["hotspots"].as_array().unwrap().len(), 5);
        assert!(analysis.result.get("details").is_none());
        assert_eq!(analysis.confidence_score, Some(0.7));
    }

    #[test]
    fn test_brief_summary_truncated_on_char_boundary() {
        let mut brief = event("intelligence-brief", json!({"summary": "é".repeat(300)}));
        reduce_event(&mut brief, &PayloadLimits::default());
        let StreamEvent::IntelligenceBrief(b) = brief else {
            panic!("expected brief");
        };
        assert_eq!(b.summary.unwrap().chars().count(), 200);
    }

    #[test]
    fn test_clear() {
        let mut q = queue();
        q.enqueue(event("analysis", json!({})), "a");
        q.drain_batch();
        q.enqueue(event("analysis", json!({})), "b");
        q.clear();
        assert!(q.is_empty());
        // throttle history gone too
        assert!(matches!(
            q.enqueue(event("analysis", json!({})), "a"),
            EnqueueOutcome::Queued(_)
        ));
    }
}
