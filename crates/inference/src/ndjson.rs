//! Newline-delimited JSON decoding for the daemon's streaming responses
//!
//! Chunks arrive with arbitrary boundaries. [`LineBuffer`] keeps the last
//! incomplete fragment until its newline shows up; each complete line is
//! parsed on its own and a bad line is logged and skipped. A trailing line
//! without a newline is parsed once the body ends.

use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;

use crate::error::InferenceError;

/// Splits a byte stream into complete lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed. Blank lines are
    /// dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }

    /// Take the unterminated remainder at end of stream
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest);
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

/// Parse a single line, logging and discarding failures
pub fn parse_line<T: DeserializeOwned>(line: &str) -> Option<T> {
    match serde_json::from_str(line) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Skipping unparseable stream line ({}): {}", e, line);
            None
        }
    }
}

/// Decode a streamed body into one value per JSON line.
///
/// Transport errors end the stream with an error; parse errors do not.
pub fn decode_ndjson<T, S, B, E>(body: S) -> impl Stream<Item = Result<T, InferenceError>> + Send
where
    T: DeserializeOwned + Send + 'static,
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<InferenceError> + Send,
{
    async_stream::try_stream! {
        let mut buffer = LineBuffer::new();
        let mut body = Box::pin(body);

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(Into::<InferenceError>::into)?;
            for line in buffer.push(chunk.as_ref()) {
                if let Some(value) = parse_line::<T>(&line) {
                    yield value;
                }
            }
        }

        if let Some(line) = buffer.finish() {
            if let Some(value) = parse_line::<T>(&line) {
                yield value;
            }
        }
    }
}
