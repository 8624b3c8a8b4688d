use crate::{classify_line, InboundEvent, LineFramer, LinkManager, Profile, Queue, Timing};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 256;

/// Background loop turning serial bytes into [`InboundEvent`]s.
pub struct FrameReader {
    link: Arc<LinkManager>,
    events: Queue<InboundEvent>,
    framer: LineFramer,
    generation: u64,
    legacy_temperature: bool,
    timing: Timing,
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new(link: Arc<LinkManager>, events: Queue<InboundEvent>, profile: &Profile) -> Self {
        Self {
            link,
            events,
            framer: LineFramer::new(profile.max_line_len),
            generation: 0,
            legacy_temperature: profile.legacy_temperature,
            timing: profile.timing,
            buf: vec![0u8; READ_CHUNK],
        }
    }

    /// Run until `stop` is set. I/O errors are reported as `Log` events and never end the loop.
    pub fn run(mut self, stop: &AtomicBool) {
        debug!("reader started");
        while !stop.load(Ordering::SeqCst) {
            if let Some(pause) = self.poll_once() {
                thread::sleep(pause);
            }
        }
        debug!("reader stopped");
    }

    /// One pass: read what is waiting and emit events. Returns how long to sleep, if at all.
    pub fn poll_once(&mut self) -> Option<Duration> {
        match self.link.read_available(&mut self.buf) {
            Ok(None) => Some(self.timing.closed_poll()),
            Ok(Some((generation, n))) => {
                if generation != self.generation {
                    self.generation = generation;
                    self.framer.reset();
                }
                if n == 0 {
                    return Some(self.timing.idle_poll());
                }
                trace!(n, "read bytes");
                let chunk = self.buf[..n].to_vec();
                self.feed(&chunk);
                None
            }
            Err(e) => {
                warn!(error = %e, "serial read failed");
                self.events
                    .push(InboundEvent::Log(format!("serial read error: {e}")));
                Some(self.timing.error_backoff())
            }
        }
    }

    /// Append raw bytes and emit an event for every complete line.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.framer.push(bytes);
        let dropped = self.framer.take_overflow();
        if dropped > 0 {
            self.events.push(InboundEvent::Log(format!(
                "discarded {dropped} bytes without line terminator"
            )));
        }
        while let Some(line) = self.framer.next_line() {
            let event = classify_line(&line, self.legacy_temperature);
            if matches!(event, InboundEvent::Status(_)) {
                self.link.mark_handshake();
            }
            self.events.push(event);
        }
    }
}
