//! Newline-delimited JSON framing over an arbitrary byte stream.

use std::collections::VecDeque;

use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("frame exceeds the {limit} byte limit")]
    TooLarge { limit: usize },
}

/// Incremental NDJSON splitter.
///
/// Bytes are pushed in arrival order; complete lines become frames, an
/// incomplete trailing fragment is held until its newline arrives. A frame
/// that fails to parse is yielded as an error and framing continues with the
/// next line.
#[derive(Debug)]
pub struct NdjsonFramer {
    buffer: Vec<u8>,
    max_frame_bytes: usize,
    discarding: bool,
    pending: VecDeque<Result<Value, FrameError>>,
}

impl Default for NdjsonFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl NdjsonFramer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_bytes: max_frame_bytes.max(1),
            discarding: false,
            pending: VecDeque::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        let mut rest = bytes;
        while !rest.is_empty() {
            match rest.iter().position(|byte| *byte == b'\n') {
                Some(index) => {
                    let (line, tail) = rest.split_at(index);
                    rest = &tail[1..];
                    if self.discarding {
                        // End of an oversized frame; already reported.
                        self.discarding = false;
                        self.buffer.clear();
                        continue;
                    }
                    self.buffer.extend_from_slice(line);
                    let complete = std::mem::take(&mut self.buffer);
                    self.complete_line(&complete);
                }
                None => {
                    if !self.discarding {
                        self.buffer.extend_from_slice(rest);
                        if self.buffer.len() > self.max_frame_bytes {
                            self.buffer.clear();
                            self.discarding = true;
                            self.pending.push_back(Err(FrameError::TooLarge {
                                limit: self.max_frame_bytes,
                            }));
                        }
                    }
                    rest = &[];
                }
            }
        }
    }

    /// Treats any buffered fragment as a complete frame. Used at EOF and at
    /// datagram or message boundaries.
    pub fn finish(&mut self) {
        if self.discarding {
            self.discarding = false;
            self.buffer.clear();
            return;
        }
        if !self.buffer.is_empty() {
            let complete = std::mem::take(&mut self.buffer);
            self.complete_line(&complete);
        }
    }

    pub fn next_frame(&mut self) -> Option<Result<Value, FrameError>> {
        self.pending.pop_front()
    }

    pub fn frames(&mut self) -> impl Iterator<Item = Result<Value, FrameError>> + '_ {
        std::iter::from_fn(move || self.next_frame())
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn complete_line(&mut self, line: &[u8]) {
        if line.len() > self.max_frame_bytes {
            self.pending.push_back(Err(FrameError::TooLarge {
                limit: self.max_frame_bytes,
            }));
            return;
        }
        let Ok(text) = std::str::from_utf8(line) else {
            self.pending.push_back(Err(FrameError::InvalidUtf8));
            return;
        };
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        let frame = serde_json::from_str::<Value>(trimmed)
            .map_err(|error| FrameError::InvalidJson(error.to_string()));
        self.pending.push_back(frame);
    }
}
