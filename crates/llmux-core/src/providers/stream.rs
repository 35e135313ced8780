//! Incremental decoding of vendor streaming bodies
//!
//! A [`StreamDecoder`] is fed raw byte chunks in arrival order and returns the
//! text fragments completed by each chunk. Lines are only classified once
//! their `\n` terminator arrives, so the split points of the transport never
//! change the fragment sequence.

use std::fmt::Display;
use std::time::Duration;

use async_stream::stream;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::debug;

use crate::error::{ProviderError, Result};

use super::types::FragmentStream;

/// Line framing used by a vendor's streaming endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// One JSON object per line, `response` fragments, `done: true` terminator
    Ndjson,
    /// `data: {...}` lines with `choices[0].delta.content`, `data: [DONE]` terminator
    Sse,
    /// `data: {...}` lines with a `type` field; only `content_block_delta` carries text
    SseTyped,
}

/// Longest unterminated line a stream may hold before decoding gives up
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Per-stream decoding state
#[derive(Debug)]
pub struct StreamDecoder {
    provider: String,
    framing: Framing,
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to hold no `\n`
    scanned: usize,
    frames: usize,
    rejected: usize,
    finished: bool,
    /// In-band error held back until the fragments before it are delivered
    deferred: Option<ProviderError>,
}

impl StreamDecoder {
    pub fn new(provider: impl Into<String>, framing: Framing) -> Self {
        Self {
            provider: provider.into(),
            framing,
            buffer: Vec::new(),
            scanned: 0,
            frames: 0,
            rejected: 0,
            finished: false,
            deferred: None,
        }
    }

    /// Whether the terminal sentinel has been seen (or the stream was flushed)
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Consume one chunk and return the fragments it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>> {
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }
        let mut fragments = Vec::new();
        if self.finished {
            return Ok(fragments);
        }

        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.extend_from_slice(chunk);
        let mut start = 0;
        let mut scan = self.scanned;
        self.scanned = 0;
        while let Some(offset) = buffer[scan..].iter().position(|b| *b == b'\n') {
            let end = scan + offset;
            let decoded = self.decode_line(&buffer[start..=end]);
            start = end + 1;
            scan = start;
            match decoded {
                Ok(Some(fragment)) => fragments.push(fragment),
                Ok(None) => {}
                Err(err) if fragments.is_empty() => return Err(err),
                Err(err) => {
                    self.deferred = Some(err);
                    return Ok(fragments);
                }
            }
            if self.finished {
                return Ok(fragments);
            }
        }

        buffer.drain(..start);
        if buffer.len() > MAX_LINE_BYTES {
            return Err(ProviderError::decode(
                &self.provider,
                format!("line longer than {} bytes", MAX_LINE_BYTES),
            ));
        }
        self.scanned = buffer.len();
        self.buffer = buffer;
        Ok(fragments)
    }

    /// Flush the trailing unterminated line at end of stream
    pub fn finish(&mut self) -> Result<Vec<String>> {
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }
        let mut fragments = Vec::new();
        if !self.finished && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            if let Some(fragment) = self.decode_line(&line)? {
                fragments.push(fragment);
            }
        }
        self.finished = true;

        if self.frames == 0 && self.rejected > 0 {
            return Err(ProviderError::decode(
                &self.provider,
                format!("no recognizable frames ({} lines rejected)", self.rejected),
            ));
        }
        Ok(fragments)
    }

    fn decode_line(&mut self, raw: &[u8]) -> Result<Option<String>> {
        let Ok(line) = std::str::from_utf8(raw) else {
            self.rejected += 1;
            return Ok(None);
        };
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        match self.framing {
            Framing::Ndjson => self.decode_ndjson(line),
            Framing::Sse | Framing::SseTyped => {
                let Some(data) = line.strip_prefix("data:") else {
                    if is_sse_field(line) {
                        return Ok(None);
                    }
                    self.reject(line);
                    return Ok(None);
                };
                let data = data.trim_start();
                if data == "[DONE]" {
                    self.frames += 1;
                    self.finished = true;
                    return Ok(None);
                }
                if self.framing == Framing::Sse {
                    self.decode_sse(data)
                } else {
                    self.decode_typed(data)
                }
            }
        }
    }

    fn decode_ndjson(&mut self, line: &str) -> Result<Option<String>> {
        let Ok(frame) = serde_json::from_str::<NdjsonFrame>(line) else {
            self.reject(line);
            return Ok(None);
        };
        self.frames += 1;

        if let Some(error) = frame.error {
            return Err(self.in_band_error(error));
        }
        if frame.done {
            self.finished = true;
        }
        Ok(frame.response.filter(|r| !r.is_empty()))
    }

    fn decode_sse(&mut self, data: &str) -> Result<Option<String>> {
        let Ok(chunk) = serde_json::from_str::<SseChunk>(data) else {
            self.reject(data);
            return Ok(None);
        };
        self.frames += 1;

        if let Some(error) = chunk.error {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(self.in_band_error(message));
        }
        Ok(chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|c| !c.is_empty()))
    }

    fn decode_typed(&mut self, data: &str) -> Result<Option<String>> {
        let Ok(event) = serde_json::from_str::<TypedEvent>(data) else {
            self.reject(data);
            return Ok(None);
        };
        self.frames += 1;

        match event {
            TypedEvent::ContentBlockDelta { delta } => Ok(delta.text.filter(|t| !t.is_empty())),
            TypedEvent::MessageStop => {
                self.finished = true;
                Ok(None)
            }
            TypedEvent::Error { error } => Err(self.in_band_error(error.message)),
            TypedEvent::Other => Ok(None),
        }
    }

    fn reject(&mut self, line: &str) {
        debug!("{}: discarding unparseable stream line: {}", self.provider, line);
        self.rejected += 1;
    }

    fn in_band_error(&mut self, message: String) -> ProviderError {
        self.finished = true;
        ProviderError::BackendError {
            provider: self.provider.clone(),
            status: 200,
            body: message,
        }
    }
}

/// SSE control fields that carry no data
fn is_sse_field(line: &str) -> bool {
    line.starts_with(':')
        || line.starts_with("event:")
        || line.starts_with("id:")
        || line.starts_with("retry:")
}

/// Drive a byte-chunk stream through a decoder, yielding text fragments.
///
/// When `timeout` is set it bounds each pull from the underlying body.
pub fn decode_stream<S, B, E>(
    provider: String,
    framing: Framing,
    body: S,
    timeout: Option<Duration>,
) -> FragmentStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    Box::pin(stream! {
        let mut decoder = StreamDecoder::new(provider.clone(), framing);
        let mut body = Box::pin(body);

        loop {
            let next = match timeout {
                Some(limit) => match tokio::time::timeout(limit, body.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        yield Err(ProviderError::Timeout {
                            provider: provider.clone(),
                            elapsed_ms: limit.as_millis() as u64,
                        });
                        return;
                    }
                },
                None => body.next().await,
            };
            let Some(chunk) = next else {
                break;
            };

            let fragments = match chunk {
                Ok(bytes) => decoder.feed(bytes.as_ref()),
                Err(e) => Err(ProviderError::unavailable(&provider, e)),
            };
            match fragments {
                Ok(fragments) => {
                    for fragment in fragments {
                        yield Ok(fragment);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
            if decoder.is_finished() {
                break;
            }
        }

        match decoder.finish() {
            Ok(fragments) => {
                for fragment in fragments {
                    yield Ok(fragment);
                }
            }
            Err(e) => yield Err(e),
        }
    })
}

// ── Frame wire types ──

#[derive(Debug, Deserialize)]
struct NdjsonFrame {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseChunk {
    #[serde(default)]
    choices: Vec<SseChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SseChoice {
    #[serde(default)]
    delta: SseDelta,
}

#[derive(Debug, Default, Deserialize)]
struct SseDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TypedEvent {
    ContentBlockDelta { delta: BlockDelta },
    MessageStop,
    Error { error: TypedError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct BlockDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TypedError {
    #[serde(default)]
    message: String,
}
