use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

const FRAME_DELIMITER: &[u8] = b"\n\n";
const DATA_PREFIX: &str = "data:";

/// One record of the chat event stream.
///
/// Wire shapes: `{"Thought": ".."}`, `{"Final": ".."}` and
/// `{"type": "error", "content": ".."}`. Anything else fails to decode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ChatStreamEvent {
    Thought {
        #[serde(rename = "Thought")]
        text: String,
    },
    Final {
        #[serde(rename = "Final")]
        text: String,
    },
    Error {
        #[serde(rename = "type")]
        kind: ErrorMarker,
        #[serde(default)]
        content: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMarker {
    Error,
}

impl ChatStreamEvent {
    pub fn thought(text: impl Into<String>) -> Self {
        Self::Thought { text: text.into() }
    }

    pub fn final_answer(text: impl Into<String>) -> Self {
        Self::Final { text: text.into() }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::Error {
            kind: ErrorMarker::Error,
            content: content.into(),
        }
    }

    /// Renders the record as a single `data:` frame including its delimiter.
    pub fn to_frame(&self) -> Result<String, FrameError> {
        let json = serde_json::to_string(self).map_err(|err| FrameError::Encode(err.to_string()))?;
        Ok(format!("{DATA_PREFIX} {json}\n\n"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("unrecognized record: {0}")]
    Unrecognized(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> DecodeReport<T> {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.errors.is_empty()
    }
}

/// Incremental decoder for a `text/event-stream` body.
///
/// Holds only the bytes that have not yet been terminated by a blank line.
/// Use one instance per exchange.
pub struct SseFrameDecoder {
    max_frame_bytes: usize,
    pending: Vec<u8>,
}

impl SseFrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<ChatStreamEvent> {
        let mut report = DecodeReport::default();
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        while let Some(idx) = find_delimiter(&self.pending) {
            let frame = self
                .pending
                .drain(..idx + FRAME_DELIMITER.len())
                .take(idx)
                .collect::<Vec<u8>>();
            self.decode_raw_frame(&frame, &mut report);
        }

        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    /// Decodes whatever unterminated tail is left once the body has ended.
    pub fn finish(&mut self) -> DecodeReport<ChatStreamEvent> {
        let mut report = DecodeReport::default();
        if self.pending.is_empty() {
            return report;
        }
        let tail = std::mem::take(&mut self.pending);
        self.decode_raw_frame(&tail, &mut report);
        report
    }

    fn decode_raw_frame(&self, frame: &[u8], report: &mut DecodeReport<ChatStreamEvent>) {
        if frame.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedFrame {
                size: frame.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        let text = match std::str::from_utf8(frame) {
            Ok(text) => text,
            Err(err) => {
                report.errors.push(FrameError::Decode(err.to_string()));
                return;
            }
        };
        let Some(payload) = data_payload(text) else {
            return;
        };
        if payload.trim().is_empty() {
            return;
        }
        let value: Value = match serde_json::from_str(&payload) {
            Ok(value) => value,
            Err(err) => {
                report.errors.push(FrameError::Decode(err.to_string()));
                return;
            }
        };
        match serde_json::from_value::<ChatStreamEvent>(value.clone()) {
            Ok(event) => report.frames.push(event),
            Err(_) => report.errors.push(FrameError::Unrecognized(value.to_string())),
        }
    }
}

impl Default for SseFrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_DELIMITER.len())
        .position(|window| window == FRAME_DELIMITER)
}

// None when the frame does not start with `data:`.
fn data_payload(frame: &str) -> Option<String> {
    let frame = frame.trim_start_matches(&['\r', '\n'][..]);
    if !frame.starts_with(DATA_PREFIX) {
        return None;
    }
    let parts: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix(DATA_PREFIX))
        .map(|rest| rest.trim_start())
        .collect();
    Some(parts.join("\n"))
}
