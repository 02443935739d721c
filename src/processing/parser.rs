use crate::core::{MeasurementFrame, DEFAULT_MAX_LINE_BYTES};
use serde::Deserialize;
use std::fmt;

/// Errors that can occur while decoding one record of the ranging stream
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    MalformedJson { details: String },
    InvalidSchema { details: String },
    InvalidDistance { anchor_id: String, value: f64 },
    InvalidAnchorId { index: usize },
    InvalidUtf8 { valid_up_to: usize },
    LineTooLong { limit: usize, buffered: usize },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::MalformedJson { details } => write!(f, "Malformed JSON: {}", details),
            ParseError::InvalidSchema { details } => write!(f, "Invalid frame schema: {}", details),
            ParseError::InvalidDistance { anchor_id, value } => {
                write!(f, "Invalid distance {} from anchor {}", value, anchor_id)
            }
            ParseError::InvalidAnchorId { index } => write!(f, "Empty anchor ID in link {}", index),
            ParseError::InvalidUtf8 { valid_up_to } => {
                write!(f, "Line is not valid UTF-8 after byte {}", valid_up_to)
            }
            ParseError::LineTooLong { limit, buffered } => {
                write!(f, "Line exceeds {} bytes ({} buffered without newline)", limit, buffered)
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Incremental decoder turning a connection's byte stream into measurement frames.
///
/// Bytes are pushed as they arrive; complete `\n`-terminated records are decoded
/// lazily by [`FrameParser::next_frame`]. A record split across reads stays
/// buffered until its newline shows up. One parser belongs to one connection.
pub struct FrameParser {
    buffer: Vec<u8>,
    /// Start of the first unconsumed record in `buffer`
    start: usize,
    /// Everything before this offset is known to contain no newline
    scanned: usize,
    /// Set while skipping the remainder of an over-long record
    discarding: bool,
    max_line_bytes: usize,
}

impl FrameParser {
    /// Create a parser with the default record size limit
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    /// Create a parser that rejects records longer than `max_line_bytes`
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            start: 0,
            scanned: 0,
            discarding: false,
            max_line_bytes,
        }
    }

    /// Append freshly received bytes
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Number of bytes held back waiting for a newline
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() - self.start
    }

    /// Decode the next complete record, if any.
    ///
    /// Blank lines are skipped. Returns `None` once only a partial record (or
    /// nothing) is left in the buffer.
    pub fn next_frame(&mut self) -> Option<Result<MeasurementFrame, ParseError>> {
        loop {
            let search_from = self.scanned.max(self.start);
            let newline = self.buffer[search_from..].iter().position(|&b| b == b'\n');

            let Some(offset) = newline else {
                return self.hold_partial();
            };

            let line_start = self.start;
            let line_end = search_from + offset;
            self.start = line_end + 1;
            self.scanned = self.start;

            if self.discarding {
                self.discarding = false;
                continue;
            }

            let length = line_end - line_start;
            if length > self.max_line_bytes {
                return Some(Err(ParseError::LineTooLong {
                    limit: self.max_line_bytes,
                    buffered: length,
                }));
            }

            if let Some(result) = decode_line(&self.buffer[line_start..line_end]) {
                return Some(result);
            }
        }
    }

    /// Iterate over every complete record currently buffered
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { parser: self }
    }

    /// Decode whatever is left once the peer has closed the stream.
    ///
    /// Call until it returns `None`. Complete records still buffered come out
    /// first, in order; an unterminated final record is complete at end of
    /// stream, so it is parsed last rather than dropped.
    pub fn finish(&mut self) -> Option<Result<MeasurementFrame, ParseError>> {
        if let Some(result) = self.next_frame() {
            return Some(result);
        }

        let remainder = std::mem::take(&mut self.buffer);
        let discarding = self.discarding;
        let start = self.start;
        self.reset();

        if discarding {
            return None;
        }
        decode_line(&remainder[start..])
    }

    /// Drop all buffered state
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.start = 0;
        self.scanned = 0;
        self.discarding = false;
    }

    fn hold_partial(&mut self) -> Option<Result<MeasurementFrame, ParseError>> {
        let pending = self.buffer.len() - self.start;

        if self.discarding {
            self.reset();
            self.discarding = true;
            return None;
        }

        if pending > self.max_line_bytes {
            self.reset();
            self.discarding = true;
            return Some(Err(ParseError::LineTooLong {
                limit: self.max_line_bytes,
                buffered: pending,
            }));
        }

        // Compact so the buffer only holds the partial record
        self.buffer.drain(..self.start);
        self.scanned = self.buffer.len();
        self.start = 0;
        None
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the complete records buffered in a [`FrameParser`]
pub struct Frames<'a> {
    parser: &'a mut FrameParser,
}

impl Iterator for Frames<'_> {
    type Item = Result<MeasurementFrame, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.parser.next_frame()
    }
}

/// Decode a single record without its terminating newline.
///
/// Returns `None` for blank or whitespace-only lines.
pub fn decode_line(line: &[u8]) -> Option<Result<MeasurementFrame, ParseError>> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(e) => {
            return Some(Err(ParseError::InvalidUtf8 {
                valid_up_to: e.valid_up_to(),
            }))
        }
    };

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    Some(decode_record(trimmed))
}

fn decode_record(text: &str) -> Result<MeasurementFrame, ParseError> {
    let mut value: serde_json::Value = serde_json::from_str(text).map_err(|e| ParseError::MalformedJson {
        details: e.to_string(),
    })?;

    if !value.is_object() {
        return Err(ParseError::InvalidSchema {
            details: format!("expected a JSON object, got {}", json_kind(&value)),
        });
    }

    let frame = MeasurementFrame::deserialize(&value).map_err(|e| ParseError::InvalidSchema {
        details: e.to_string(),
    })?;
    validate_frame(&frame)?;

    // Missing or null links relay as an empty array
    let raw_links = value
        .get_mut("links")
        .map(serde_json::Value::take)
        .filter(|links| !links.is_null())
        .unwrap_or_else(|| serde_json::Value::Array(Vec::new()));

    Ok(frame.with_raw_links(raw_links))
}

/// Reject links that cannot be physical range measurements
fn validate_frame(frame: &MeasurementFrame) -> Result<(), ParseError> {
    for (index, link) in frame.links.iter().enumerate() {
        if link.anchor_id.trim().is_empty() {
            return Err(ParseError::InvalidAnchorId { index });
        }
        if !link.distance.is_finite() || link.distance < 0.0 {
            return Err(ParseError::InvalidDistance {
                anchor_id: link.anchor_id.clone(),
                value: link.distance,
            });
        }
    }
    Ok(())
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
