use crate::{Backend, LinkError, Port, PortSettings, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Description of the active (or most recently opened) link.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkHandle {
    pub port: String,
    pub baud_rate: u32,
    pub open: bool,
    pub handshake: bool,
}

struct ActiveLink {
    name: String,
    port: Box<dyn Port>,
}

/// Owns the single serial link shared by the reader, the writer and the consumer.
///
/// Open and close run under the port mutex, and the `open` flag only changes while that mutex
/// is held, so no thread can see a half-closed link as open.
pub struct LinkManager {
    backend: Arc<dyn Backend>,
    settings: PortSettings,
    active: Mutex<Option<ActiveLink>>,
    open: AtomicBool,
    handshake: AtomicBool,
    generation: AtomicU64,
}

impl LinkManager {
    pub fn new(backend: Arc<dyn Backend>, settings: PortSettings) -> Self {
        Self {
            backend,
            settings,
            active: Mutex::new(None),
            open: AtomicBool::new(false),
            handshake: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveLink>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Open `name`, replacing any link that is already open.
    ///
    /// The new port gets DTR and RTS asserted and both buffers cleared; the handshake flag
    /// starts false.
    pub fn open(&self, name: &str) -> Result<LinkHandle> {
        let mut active = self.lock();
        if let Some(prev) = active.take() {
            self.open.store(false, Ordering::SeqCst);
            self.handshake.store(false, Ordering::SeqCst);
            Self::release(prev);
        }

        let mut port = self.backend.open(name, &self.settings)?;
        if let Err(e) = Self::prepare(&mut *port) {
            let _ = port.close();
            warn!(port = name, error = %e, "port opened but could not be prepared");
            return Err(LinkError::PortUnavailable(format!("{name}: {e}")));
        }

        self.handshake.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        *active = Some(ActiveLink {
            name: name.to_string(),
            port,
        });
        self.open.store(true, Ordering::SeqCst);
        info!(port = name, baud = self.settings.baud_rate, "link open");
        Ok(LinkHandle {
            port: name.to_string(),
            baud_rate: self.settings.baud_rate,
            open: true,
            handshake: false,
        })
    }

    fn prepare(port: &mut dyn Port) -> Result<()> {
        // Some boards hold off USB enumeration until both lines are high.
        port.set_control_lines(true, true)?;
        port.clear_buffers()?;
        Ok(())
    }

    fn release(mut link: ActiveLink) {
        if let Err(e) = link.port.close() {
            debug!(port = %link.name, error = %e, "close failed");
        }
        info!(port = %link.name, "link closed");
    }

    /// Close the active link. Closing with nothing open is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut active = self.lock();
        self.open.store(false, Ordering::SeqCst);
        self.handshake.store(false, Ordering::SeqCst);
        match active.take() {
            Some(mut link) => {
                let res = link.port.close();
                info!(port = %link.name, "link closed");
                res
            }
            None => Ok(()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn handshake_received(&self) -> bool {
        self.handshake.load(Ordering::SeqCst)
    }

    pub fn mark_handshake(&self) {
        if self.is_open() {
            self.handshake.store(true, Ordering::SeqCst);
        }
    }

    /// Increases each time a link is opened.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn handle(&self) -> Option<LinkHandle> {
        let active = self.lock();
        active.as_ref().map(|link| LinkHandle {
            port: link.name.clone(),
            baud_rate: self.settings.baud_rate,
            open: self.is_open(),
            handshake: self.handshake_received(),
        })
    }

    /// Read whatever is waiting without blocking.
    ///
    /// Returns `None` when no link is open, otherwise the link generation the bytes came from
    /// and how many were read (possibly zero).
    pub fn read_available(&self, buf: &mut [u8]) -> Result<Option<(u64, usize)>> {
        let mut active = self.lock();
        let Some(link) = active.as_mut() else {
            return Ok(None);
        };
        let generation = self.generation();
        let waiting = link.port.bytes_available()?;
        if waiting == 0 || buf.is_empty() {
            return Ok(Some((generation, 0)));
        }
        let want = waiting.min(buf.len());
        let n = link.port.read(&mut buf[..want])?;
        Ok(Some((generation, n)))
    }

    /// Write `data` to the active link. Returns `false` when no link is open.
    pub fn write(&self, data: &[u8]) -> Result<bool> {
        let mut active = self.lock();
        let Some(link) = active.as_mut() else {
            return Ok(false);
        };
        link.port.write_all(data)?;
        Ok(true)
    }
}
