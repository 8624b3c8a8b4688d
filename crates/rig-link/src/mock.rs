use crate::{Backend, LinkError, Port, PortInfo, PortSettings, Result};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// In-process ports. Each port is backed by a [`MockWire`] that tests can inspect.
#[derive(Clone, Default)]
pub struct MockBackend {
    ports: Arc<Mutex<BTreeMap<String, MockWire>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend with one port, `mock0`, wired to a simulated rig.
    pub fn simulated() -> Self {
        let backend = Self::new();
        backend.add_simulated_port("mock0", "Simulated thermal rig");
        backend
    }

    pub fn add_port(&self, name: &str, description: &str) -> MockWire {
        let wire = MockWire::new(description, None);
        self.lock().insert(name.to_string(), wire.clone());
        wire
    }

    pub fn add_simulated_port(&self, name: &str, description: &str) -> MockWire {
        let wire = MockWire::new(description, Some(SimDevice::default()));
        self.lock().insert(name.to_string(), wire.clone());
        wire
    }

    pub fn wire(&self, name: &str) -> Option<MockWire> {
        self.lock().get(name).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, MockWire>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Backend for MockBackend {
    fn list(&self) -> Result<Vec<PortInfo>> {
        Ok(self
            .lock()
            .iter()
            .map(|(name, wire)| PortInfo {
                name: name.clone(),
                description: wire.state().description.clone(),
            })
            .collect())
    }

    fn open(&self, name: &str, settings: &PortSettings) -> Result<Box<dyn Port>> {
        let wire = self
            .wire(name)
            .ok_or_else(|| LinkError::DeviceNotFound(name.to_string()))?;
        {
            let mut st = wire.state();
            if st.busy || st.in_use {
                return Err(LinkError::PortUnavailable(format!("{name} is busy")));
            }
            st.in_use = true;
            st.opened_with = Some(*settings);
            if let Some(dev) = st.device.as_mut() {
                dev.greeted = false;
            }
        }
        Ok(Box::new(MockPort {
            wire,
            closed: false,
        }))
    }
}

struct WireState {
    description: String,
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    dtr: bool,
    rts: bool,
    busy: bool,
    in_use: bool,
    opened_with: Option<PortSettings>,
    closes: u32,
    read_faults: u32,
    write_faults: u32,
    write_fault_is_timeout: bool,
    device: Option<SimDevice>,
}

/// Both directions of one mock port.
#[derive(Clone)]
pub struct MockWire {
    inner: Arc<Mutex<WireState>>,
}

impl MockWire {
    fn new(description: &str, device: Option<SimDevice>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WireState {
                description: description.to_string(),
                inbound: VecDeque::new(),
                written: Vec::new(),
                dtr: false,
                rts: false,
                busy: false,
                in_use: false,
                opened_with: None,
                closes: 0,
                read_faults: 0,
                write_faults: 0,
                write_fault_is_timeout: false,
                device,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, WireState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue bytes as if the device had sent them.
    pub fn inject(&self, bytes: &[u8]) {
        self.state().inbound.extend(bytes.iter().copied());
    }

    pub fn inbound_len(&self) -> usize {
        self.state().inbound.len()
    }

    /// Everything the host has written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state().written.clone()
    }

    pub fn written_lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.written())
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// (DTR, RTS)
    pub fn control_lines(&self) -> (bool, bool) {
        let st = self.state();
        (st.dtr, st.rts)
    }

    pub fn opened_with(&self) -> Option<PortSettings> {
        self.state().opened_with
    }

    pub fn close_count(&self) -> u32 {
        self.state().closes
    }

    pub fn is_in_use(&self) -> bool {
        self.state().in_use
    }

    pub fn set_busy(&self, busy: bool) {
        self.state().busy = busy;
    }

    /// Make the next `n` reads fail with an I/O error.
    pub fn fail_reads(&self, n: u32) {
        self.state().read_faults = n;
    }

    /// Make the next `n` writes fail, either as timeouts or as I/O errors.
    pub fn fail_writes(&self, n: u32, timeout: bool) {
        let mut st = self.state();
        st.write_faults = n;
        st.write_fault_is_timeout = timeout;
    }
}

struct MockPort {
    wire: MockWire,
    closed: bool,
}

impl MockPort {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            let mut st = self.wire.state();
            st.in_use = false;
            st.closes += 1;
        }
    }
}

impl Port for MockPort {
    fn bytes_available(&mut self) -> Result<usize> {
        let mut st = self.wire.state();
        if st.read_faults > 0 {
            st.read_faults -= 1;
            return Err(LinkError::Io("mock read fault".into()));
        }
        let st = &mut *st;
        if let Some(dev) = st.device.as_mut() {
            if !dev.greeted {
                dev.greeted = true;
                st.inbound.extend(b"READY\n".iter().copied());
            }
        }
        Ok(st.inbound.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut st = self.wire.state();
        let n = buf.len().min(st.inbound.len());
        for (slot, b) in buf.iter_mut().zip(st.inbound.drain(..n)) {
            *slot = b;
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut st = self.wire.state();
        if st.write_faults > 0 {
            st.write_faults -= 1;
            return if st.write_fault_is_timeout {
                Err(LinkError::Timeout)
            } else {
                Err(LinkError::Io("mock write fault".into()))
            };
        }
        st.written.extend_from_slice(data);
        let st = &mut *st;
        if let Some(dev) = st.device.as_mut() {
            dev.receive(data, &mut st.inbound);
        }
        Ok(())
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<()> {
        let mut st = self.wire.state();
        st.dtr = dtr;
        st.rts = rts;
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.wire.state().inbound.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MockPort {
    fn drop(&mut self) {
        self.release();
    }
}

const AMBIENT_C: f32 = 22.0;

/// Firmware stand-in: greets with READY and answers each command with a STATE line.
#[derive(Default)]
struct SimDevice {
    greeted: bool,
    line: Vec<u8>,
    heater: bool,
    psu: bool,
    motor: u8,
    steps: i64,
    temp_c: Option<f32>,
}

impl SimDevice {
    fn receive(&mut self, data: &[u8], out: &mut VecDeque<u8>) {
        for &b in data {
            if b != b'\n' {
                self.line.push(b);
                continue;
            }
            let line = String::from_utf8_lossy(&self.line).trim().to_string();
            self.line.clear();
            if line.is_empty() {
                continue;
            }
            let reply = match self.apply(&line) {
                Ok(()) => self.state_line(),
                Err(msg) => msg,
            };
            out.extend(reply.as_bytes().iter().copied());
            out.push_back(b'\n');
        }
    }

    fn apply(&mut self, line: &str) -> core::result::Result<(), String> {
        match line {
            "HEATER_ON" => self.heater = true,
            "HEATER_OFF" => self.heater = false,
            "PSU_ON" => self.psu = true,
            "PSU_OFF" => self.psu = false,
            _ => match line.split_once(':') {
                Some(("MOTOR", v)) => {
                    self.motor = v.parse().map_err(|_| format!("ERR bad motor value {v}"))?
                }
                Some(("STEP", v)) => {
                    let n: i64 = v.parse().map_err(|_| format!("ERR bad step count {v}"))?;
                    self.steps += n;
                }
                Some(("BEEP", _)) => {}
                _ => return Err(format!("ERR unknown command {line}")),
            },
        }
        let t = self.temp_c.unwrap_or(AMBIENT_C);
        self.temp_c = Some(if self.heater {
            t + 0.5
        } else {
            (t - 0.2).max(AMBIENT_C)
        });
        Ok(())
    }

    fn state_line(&self) -> String {
        let t0 = self.temp_c.unwrap_or(AMBIENT_C);
        format!(
            "STATE HEATER:{} PSU:{} MOTOR:{} STEPS:{} T0:{:.1} T1:{:.1} T2:{:.1} TDS:{:.1}",
            u8::from(self.heater),
            u8::from(self.psu),
            self.motor,
            self.steps,
            t0,
            t0 - 0.2,
            t0 - 0.3,
            t0 - 0.1
        )
    }
}
