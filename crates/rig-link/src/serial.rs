use crate::{Backend, LinkError, Port, PortInfo, PortSettings, Result};
use serialport::{ClearBuffer, ErrorKind, SerialPort, SerialPortType};
use std::io::{self, Read, Write};

/// Hardware serial ports via the `serialport` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialBackend;

impl SerialBackend {
    pub fn new() -> Self {
        Self
    }
}

fn describe(kind: &SerialPortType) -> String {
    match kind {
        SerialPortType::UsbPort(usb) => {
            let mut parts = Vec::new();
            if let Some(m) = &usb.manufacturer {
                parts.push(m.clone());
            }
            if let Some(p) = &usb.product {
                parts.push(p.clone());
            }
            parts.push(format!("USB {:04x}:{:04x}", usb.vid, usb.pid));
            parts.join(" ")
        }
        SerialPortType::PciPort => "PCI serial".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth serial".to_string(),
        SerialPortType::Unknown => "serial".to_string(),
    }
}

fn open_error(name: &str, e: serialport::Error) -> LinkError {
    match e.kind() {
        ErrorKind::NoDevice => LinkError::DeviceNotFound(name.to_string()),
        ErrorKind::Io(io::ErrorKind::NotFound) => LinkError::DeviceNotFound(name.to_string()),
        ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            LinkError::PermissionDenied(name.to_string())
        }
        _ => LinkError::PortUnavailable(format!("{name}: {e}")),
    }
}

fn io_error(e: serialport::Error) -> LinkError {
    match e.kind() {
        ErrorKind::Io(io::ErrorKind::TimedOut) => LinkError::Timeout,
        _ => LinkError::Io(e.to_string()),
    }
}

impl Backend for SerialBackend {
    fn list(&self) -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(io_error)?;
        Ok(ports
            .into_iter()
            .map(|p| PortInfo {
                description: describe(&p.port_type),
                name: p.port_name,
            })
            .collect())
    }

    fn open(&self, name: &str, settings: &PortSettings) -> Result<Box<dyn Port>> {
        let port = serialport::new(name, settings.baud_rate)
            .timeout(settings.timeout)
            .open()
            .map_err(|e| open_error(name, e))?;
        Ok(Box::new(SerialLink { port }))
    }
}

struct SerialLink {
    port: Box<dyn SerialPort>,
}

impl Port for SerialLink {
    fn bytes_available(&mut self) -> Result<usize> {
        let n = self.port.bytes_to_read().map_err(io_error)?;
        Ok(n as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<()> {
        self.port.write_data_terminal_ready(dtr).map_err(io_error)?;
        self.port.write_request_to_send(rts).map_err(io_error)?;
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::All).map_err(io_error)
    }
}
