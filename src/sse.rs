//! Incremental decoding of `event:`/`data:` framed reply streams.
//!
//! Chunks arrive as arbitrary byte slices. [`Utf8StreamDecoder`] keeps any
//! incomplete multi-byte sequence between chunks, and [`EventStreamDecoder`]
//! buffers the decoded text until a blank line closes a frame.

use crate::protocol::StreamEvent;

const FRAME_DELIMITER: &str = "\n\n";
const DEFAULT_EVENT_NAME: &str = "message";

/// Stateful UTF-8 decoder that never splits a code point across chunks.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + invalid);
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more bytes.
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flushes held bytes at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// A single delimiter-bounded unit of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub event: String,
    pub data: String,
}

impl RawFrame {
    pub fn parse(raw: &str) -> Self {
        let mut event = DEFAULT_EVENT_NAME.to_string();
        let mut data = String::new();

        for line in raw.lines() {
            if let Some(name) = line.strip_prefix("event:") {
                event = name.trim().to_string();
            } else if let Some(fragment) = line.strip_prefix("data:") {
                data.push_str(fragment.strip_prefix(' ').unwrap_or(fragment));
            }
        }

        Self { event, data }
    }

    pub fn into_event(self) -> Option<StreamEvent> {
        StreamEvent::decode(&self.event, &self.data)
    }
}

#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    utf8: Utf8StreamDecoder,
    buffer: String,
    // A chunk ended in '\r' whose '\n' may still arrive.
    pending_cr: bool,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and drains every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        let mut text = self.utf8.decode(chunk);
        if std::mem::take(&mut self.pending_cr) {
            text.insert(0, '\r');
        }
        if text.ends_with('\r') {
            text.pop();
            self.pending_cr = true;
        }

        // Only the tail of the old buffer can start a new delimiter.
        let mut from = if self.buffer.ends_with('\n') {
            self.buffer.len() - 1
        } else {
            self.buffer.len()
        };
        self.buffer.push_str(&text.replace("\r\n", "\n"));

        let mut frames = Vec::new();
        while let Some(offset) = self.buffer[from..].find(FRAME_DELIMITER) {
            let idx = from + offset;
            frames.push(RawFrame::parse(&self.buffer[..idx]));
            self.buffer.drain(..idx + FRAME_DELIMITER.len());
            from = 0;
        }
        frames
    }

    pub fn push_events(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.push(chunk)
            .into_iter()
            .filter_map(RawFrame::into_event)
            .collect()
    }

    /// Ends the stream, returning an unterminated trailing frame if any.
    pub fn finish(&mut self) -> Option<RawFrame> {
        if std::mem::take(&mut self.pending_cr) {
            self.buffer.push('\r');
        }
        let rest = self.utf8.finish();
        self.buffer.push_str(&rest.replace("\r\n", "\n"));
        let remaining = std::mem::take(&mut self.buffer);

        if remaining.trim().is_empty() {
            None
        } else {
            Some(RawFrame::parse(&remaining))
        }
    }

    pub fn finish_events(&mut self) -> Vec<StreamEvent> {
        self.finish().and_then(RawFrame::into_event).into_iter().collect()
    }

    #[cfg(test)]
    pub fn buffered(&self) -> &str {
        &self.buffer
    }
}
