//! Edge case and property tests for the streaming building blocks
//!
//! Tests cover:
//! - SSE decoding under arbitrary chunking
//! - Heartbeat interval bounds
//! - Priority ordering and queue bounds
//! - Retry-After parsing

use proptest::prelude::*;
use std::time::Duration;
use wardstream_stream::{
    EnqueueOutcome, HeartbeatTable, MessagePriority, MessagePriorityQueue, PriorityQueueConfig,
    SseDecoder, SseFrame, StreamEvent,
};
use wardstream_testing::*;

fn decode_all(chunks: &[&[u8]]) -> Vec<SseFrame> {
    let mut decoder = SseDecoder::new();
    let mut frames: Vec<SseFrame> = chunks
        .iter()
        .flat_map(|c| decoder.feed(c).unwrap())
        .collect();
    frames.extend(decoder.finish());
    frames
}

// ============================================================================
// SSE Decoding
// ============================================================================

mod sse_tests {
    use super::*;

    #[test]
    fn test_multiline_data_joined() {
        let frames = decode_all(&[b"event: analysis\ndata: {\"a\":\ndata: 1}\n\n"]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"a\":\n1}");
        assert!(StreamEvent::from_frame(&frames[0]).is_ok());
    }

    #[test]
    fn test_event_without_data_not_dispatched() {
        assert!(decode_all(&[b"event: heartbeat\n\n"]).is_empty());
    }

    #[test]
    fn test_trailing_event_dispatched_at_eof() {
        let frames = decode_all(&[b"data: {\"type\":\"heartbeat\"}"]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, None);
    }

    #[test]
    fn test_retry_and_id_fields() {
        let frames = decode_all(&[b"id: 42\nretry: 3000\nretry: soon\ndata: {}\n\n"]);
        assert_eq!(frames[0].id.as_deref(), Some("42"));
        assert_eq!(frames[0].retry, Some(3000));
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_frames((bytes, cuts) in chunked_bytes()) {
            let whole = decode_all(&[&bytes]);

            let mut chunks: Vec<&[u8]> = Vec::new();
            let mut rest = bytes.as_slice();
            for cut in cuts {
                let at = cut.min(rest.len());
                let (head, tail) = rest.split_at(at);
                chunks.push(head);
                rest = tail;
            }
            chunks.push(rest);

            prop_assert_eq!(decode_all(&chunks), whole);
        }
    }
}

// ============================================================================
// Heartbeat Intervals
// ============================================================================

mod heartbeat_tests {
    use super::*;

    proptest! {
        #[test]
        fn prop_interval_capped_at_offline(
            connection in connection_type(),
            battery in maybe_battery(),
            foreground in any::<bool>(),
        ) {
            let table = HeartbeatTable::default();
            let interval = table.interval_for(connection, battery, foreground);
            prop_assert!(interval <= table.offline);
            prop_assert!(interval >= table.base_interval(connection).min(table.offline));
        }

        #[test]
        fn prop_background_never_faster(
            connection in connection_type(),
            battery in maybe_battery(),
        ) {
            let table = HeartbeatTable::default();
            prop_assert!(
                table.interval_for(connection, battery, false)
                    >= table.interval_for(connection, battery, true)
            );
        }
    }

    #[test]
    fn test_small_change_does_not_restart() {
        let table = HeartbeatTable::default();
        assert!(!table.should_restart(Duration::from_secs(30), Duration::from_secs(32)));
        assert!(table.should_restart(Duration::from_secs(30), Duration::from_secs(45)));
    }
}

// ============================================================================
// Priority Queue
// ============================================================================

mod priority_tests {
    use super::*;

    fn event(frame: SseFrame) -> StreamEvent {
        StreamEvent::from_frame(&frame).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_alert_drains_first() {
        let mut queue = MessagePriorityQueue::new(PriorityQueueConfig::default().with_batch_size(1));
        queue.enqueue(event(frames::progress("triage", 0.2)), "ward-1");
        queue.enqueue(event(frames::analysis("stable")), "ward-1");
        let outcome = queue.enqueue(event(frames::alert("critical")), "ward-1");
        assert_eq!(outcome, EnqueueOutcome::Queued(MessagePriority::Critical));

        let order: Vec<MessagePriority> = (0..3)
            .flat_map(|_| queue.drain_batch())
            .map(|m| m.priority)
            .collect();
        assert_eq!(
            order,
            vec![
                MessagePriority::Critical,
                MessagePriority::Medium,
                MessagePriority::Low
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_window_per_resource() {
        let mut queue = MessagePriorityQueue::new(PriorityQueueConfig::default());
        queue.enqueue(event(frames::analysis("a")), "ward-1");
        queue.drain_batch();

        assert_eq!(
            queue.enqueue(event(frames::analysis("b")), "ward-1"),
            EnqueueOutcome::Throttled
        );
        assert!(matches!(
            queue.enqueue(event(frames::analysis("c")), "ward-2"),
            EnqueueOutcome::Queued(_)
        ));

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(matches!(
            queue.enqueue(event(frames::analysis("d")), "ward-1"),
            EnqueueOutcome::Queued(_)
        ));
    }

    proptest! {
        #[test]
        fn prop_queue_bounded(
            max in 1usize..16,
            frames in proptest::collection::vec(data_frame(), 0..48),
        ) {
            let mut queue = MessagePriorityQueue::new(
                PriorityQueueConfig::default().with_max_queue_size(max),
            );
            for (i, frame) in frames.iter().enumerate() {
                queue.enqueue(event(frame.clone()), &format!("ward-{}", i));
            }
            prop_assert!(queue.len() <= max);
            prop_assert_eq!(queue.len() as u64 + queue.evicted(), frames.len() as u64);
        }
    }
}

// ============================================================================
// Retry-After
// ============================================================================

mod retry_after_tests {
    use wardstream_resilience::HttpRetryClassifier;

    #[test]
    fn test_seconds_form() {
        assert_eq!(
            HttpRetryClassifier::parse_retry_after("120"),
            Some(std::time::Duration::from_secs(120))
        );
    }

    #[test]
    fn test_garbage_ignored() {
        assert_eq!(HttpRetryClassifier::parse_retry_after("soon"), None);
    }
}
