use crate::{parse_state, InboundEvent, OutboundCommand, StateSnapshot};
use tracing::warn;

pub(crate) const READY: &str = "READY";
pub(crate) const STATE_PREFIX: &str = "STATE ";
pub(crate) const LEGACY_TEMP_PREFIX: &str = "TEMP(C):";

/// Line sent on the wire for `cmd`, including the `\n` terminator.
pub fn encode_command(cmd: &OutboundCommand) -> Vec<u8> {
    let mut out = cmd.text().into_bytes();
    out.push(b'\n');
    out
}

/// Turn one trimmed inbound line into an event.
pub fn classify_line(line: &str, legacy_temperature: bool) -> InboundEvent {
    if line == READY {
        return InboundEvent::Status(READY.to_string());
    }
    if let Some(body) = line.strip_prefix(STATE_PREFIX) {
        return InboundEvent::StateUpdate(parse_state(body));
    }
    if legacy_temperature {
        if let Some(value) = line.strip_prefix(LEGACY_TEMP_PREFIX) {
            let value = value.trim();
            if !value.is_empty() {
                let mut snap = StateSnapshot::new();
                snap.insert("T0", value);
                return InboundEvent::StateUpdate(snap);
            }
        }
    }
    InboundEvent::Log(line.to_string())
}

/// Accumulates raw bytes and yields complete `\n`-terminated lines.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    max_len: usize,
    overflowed: usize,
}

impl LineFramer {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(128),
            max_len,
            overflowed: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.max_len && !self.buf.contains(&b'\n') {
            warn!(len = self.buf.len(), "discarding unterminated input");
            self.overflowed += self.buf.len();
            self.buf.clear();
        }
    }

    /// Next complete line, decoded and trimmed. Invalid UTF-8 is dropped; blank lines are
    /// skipped.
    pub fn next_line(&mut self) -> Option<String> {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw[..raw.len() - 1]).replace('\u{FFFD}', "");
            let line = text.trim();
            if !line.is_empty() {
                return Some(line.to_string());
            }
        }
        None
    }

    /// Bytes discarded since the last call because no terminator arrived in time.
    pub fn take_overflow(&mut self) -> usize {
        std::mem::take(&mut self.overflowed)
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.overflowed = 0;
    }
}
