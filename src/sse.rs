//! Incremental server-sent-events accumulator.
//!
//! Collects `data: <json>` payloads from a byte stream, buffering partial
//! events until the blank-line boundary arrives. A payload that fails to
//! decode is logged and skipped, never fatal. End of stream is inferred from
//! connection close (`flush()` drains whatever remains).

use serde_json::Value;

pub(crate) struct SseAccumulator {
    buffer: Vec<u8>,
}

impl SseAccumulator {
    pub(crate) fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed a raw chunk; returns the JSON payloads of every event completed
    /// by this chunk. Bytes are buffered so multi-byte characters and events
    /// split across chunk boundaries are handled correctly.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = find_event_boundary(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            parse_block(&block[..pos], &mut events);
        }
        events
    }

    /// Drain any trailing event not terminated by a blank line.
    pub(crate) fn flush(&mut self) -> Vec<Value> {
        let block = std::mem::take(&mut self.buffer);
        let mut events = Vec::new();
        parse_block(&block, &mut events);
        events
    }
}

fn find_event_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn parse_block(block: &[u8], events: &mut Vec<Value>) {
    let text = String::from_utf8_lossy(block);
    for line in text.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(value) => events.push(value),
            Err(e) => {
                tracing::warn!("sse: skipping undecodable data line: {}", e);
            }
        }
    }
}
