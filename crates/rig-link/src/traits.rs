use crate::{PortInfo, Result};
use std::time::Duration;

/// Parameters a backend needs to open a port.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortSettings {
    pub baud_rate: u32,
    pub timeout: Duration,
}

/// Byte-level access to one open serial device.
pub trait Port: Send {
    /// Bytes waiting in the input buffer; must not block.
    fn bytes_available(&mut self) -> Result<usize>;

    /// Read up to `buf.len()` bytes. A timeout with nothing read returns `Ok(0)`.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write and flush the whole buffer, bounded by the port timeout.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Drive the DTR and RTS lines.
    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<()>;

    /// Discard anything pending in both directions.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Release the device. The default relies on drop.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A family of ports: enumerates them and opens one by name.
pub trait Backend: Send + Sync {
    fn list(&self) -> Result<Vec<PortInfo>>;

    fn open(&self, name: &str, settings: &PortSettings) -> Result<Box<dyn Port>>;
}
