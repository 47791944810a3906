//! `text/event-stream` decoding
//!
//! [`SseDecoder`] is an incremental line parser: feed it raw chunks as they
//! arrive and it yields complete [`SseFrame`]s. [`decode_frames`] adapts a
//! byte stream into a frame stream. Lines and events are size-capped; a
//! stream that exceeds either cap fails with `MalformedEvent`.

use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::VecDeque;
use wardstream_error::{Result, WardstreamError};

/// Default cap on a single line, in bytes
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Default cap on the accumulated `data` of one event, in bytes
pub const MAX_EVENT_BYTES: usize = 4 * 1024 * 1024;

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    /// `event:` field, `None` for the default `message` type
    pub event: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: String,
    /// `id:` field
    pub id: Option<String>,
    /// `retry:` field in milliseconds
    pub retry: Option<u64>,
}

impl SseFrame {
    /// Frame with an explicit event name
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
            ..Default::default()
        }
    }

    /// Event name, defaulting to `message`
    pub fn event_name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Incremental event-stream parser
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    data_bytes: usize,
    id: Option<String>,
    retry: Option<u64>,
    comments: u64,
    max_line: usize,
    max_event: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limits(MAX_LINE_BYTES, MAX_EVENT_BYTES)
    }
}

impl SseDecoder {
    /// Creates an empty decoder with the default size caps
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a decoder with custom line and event caps
    pub fn with_limits(max_line: usize, max_event: usize) -> Self {
        Self {
            buffer: Vec::new(),
            event: None,
            data: Vec::new(),
            data_bytes: 0,
            id: None,
            retry: None,
            comments: 0,
            max_line: max_line.max(1),
            max_event: max_event.max(1),
        }
    }

    /// Comment lines seen so far (servers use them as keep-alives)
    pub fn comments(&self) -> u64 {
        self.comments
    }

    /// Consumes a chunk and returns every frame it completes.
    ///
    /// Fails once a line or event outgrows its cap; the decoder is reset and
    /// the frames completed by this chunk are discarded.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            if pos > self.max_line {
                return Err(self.overflow("line", pos, self.max_line));
            }
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
            if self.data_bytes > self.max_event {
                return Err(self.overflow("event", self.data_bytes, self.max_event));
            }
        }

        if self.buffer.len() > self.max_line {
            return Err(self.overflow("line", self.buffer.len(), self.max_line));
        }
        Ok(frames)
    }

    fn overflow(&mut self, what: &str, size: usize, limit: usize) -> WardstreamError {
        let event = self.event.clone().unwrap_or_else(|| "message".to_string());
        self.reset();
        tracing::warn!(size, limit, "SSE {} exceeds size cap", what);
        WardstreamError::MalformedEvent {
            event,
            reason: format!("{} of {} bytes exceeds {} byte cap", what, size, limit),
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.event = None;
        self.data.clear();
        self.data_bytes = 0;
        self.id = None;
        self.retry = None;
    }

    /// Flushes a trailing unterminated line and any pending event at end of
    /// stream.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let line = String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned();
            let line = line.trim_end_matches('\r');
            if let Some(frame) = self.process_line(line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            self.comments += 1;
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data_bytes += value.len() + 1;
                self.data.push(value.to_string());
            }
            "id" => self.id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse() {
                    self.retry = Some(ms);
                }
            }
            other => tracing::trace!(field = other, "Ignoring unknown SSE field"),
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let id = self.id.take();
        let retry = self.retry.take();
        self.data_bytes = 0;
        if self.data.is_empty() {
            return None;
        }
        Some(SseFrame {
            event,
            data: std::mem::take(&mut self.data).join("\n"),
            id,
            retry,
        })
    }
}

/// Adapts a stream of byte chunks into a stream of frames.
///
/// A chunk or decode error is yielded once and ends the stream.
pub fn decode_frames<S, B>(bytes: S) -> BoxStream<'static, Result<SseFrame>>
where
    S: Stream<Item = Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = (bytes.boxed(), SseDecoder::new(), VecDeque::new(), false);

    stream::unfold(state, |(mut bytes, mut decoder, mut pending, mut done)| async move {
        loop {
            if let Some(frame) = pending.pop_front() {
                return Some((Ok(frame), (bytes, decoder, pending, done)));
            }
            if done {
                return None;
            }
            match bytes.next().await {
                Some(Ok(chunk)) => match decoder.feed(chunk.as_ref()) {
                    Ok(frames) => pending.extend(frames),
                    Err(e) => {
                        done = true;
                        return Some((Err(e), (bytes, decoder, pending, done)));
                    }
                },
                Some(Err(e)) => {
                    done = true;
                    return Some((Err(e), (bytes, decoder, pending, done)));
                }
                None => {
                    done = true;
                    pending.extend(decoder.finish());
                }
            }
        }
    })
    .boxed()
}
