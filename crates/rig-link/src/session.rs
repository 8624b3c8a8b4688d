use crate::{
    Backend, CommandWriter, FrameReader, InboundEvent, LinkError, LinkHandle, LinkManager,
    OutboundCommand, PortInfo, Profile, Queue, Result, RigCommand,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace};

/// Consumer-facing handle on the engine: one link, its two worker threads and both queues.
///
/// Dropping the session stops the workers and closes the link.
pub struct Session {
    profile: Profile,
    link: Arc<LinkManager>,
    outbound: Queue<OutboundCommand>,
    inbound: Queue<InboundEvent>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Session {
    /// Create the queues and start the reader and writer threads. No port is opened yet.
    pub fn start(backend: Arc<dyn Backend>, profile: Profile) -> Result<Self> {
        profile.validate()?;
        let link = Arc::new(LinkManager::new(backend, profile.port_settings()));
        let outbound = Queue::new();
        let inbound = Queue::new();
        let stop = Arc::new(AtomicBool::new(false));

        let mut session = Self {
            profile,
            link,
            outbound,
            inbound,
            stop,
            workers: Vec::with_capacity(2),
        };

        let reader =
            FrameReader::new(session.link.clone(), session.inbound.clone(), &session.profile);
        let stop = session.stop.clone();
        let handle = thread::Builder::new()
            .name("rig-reader".into())
            .spawn(move || reader.run(&stop))
            .map_err(|_| LinkError::Spawn("reader"))?;
        session.workers.push(handle);

        let writer = CommandWriter::new(
            session.link.clone(),
            session.outbound.clone(),
            session.inbound.clone(),
            &session.profile,
        );
        let stop = session.stop.clone();
        // On failure the session drops here and stops the reader.
        let handle = thread::Builder::new()
            .name("rig-writer".into())
            .spawn(move || writer.run(&stop))
            .map_err(|_| LinkError::Spawn("writer"))?;
        session.workers.push(handle);

        info!(profile = %session.profile.name, "session started");
        Ok(session)
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn list_ports(&self) -> Result<Vec<PortInfo>> {
        self.link.backend().list()
    }

    /// Open `port`, closing any link that is already open.
    pub fn connect(&self, port: &str) -> Result<LinkHandle> {
        self.link.open(port)
    }

    /// Close the link if one is open. Safe to call any number of times.
    pub fn disconnect(&self) {
        if let Err(e) = self.link.close() {
            debug!(error = %e, "error while closing link");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_open()
    }

    pub fn handshake_received(&self) -> bool {
        self.link.handshake_received()
    }

    pub fn link(&self) -> Option<LinkHandle> {
        self.link.handle()
    }

    /// Queue a command for the writer. Commands reaching the writer while no link is open are
    /// dropped.
    pub fn submit(&self, cmd: OutboundCommand) {
        trace!(command = %cmd.text(), "submit");
        self.outbound.push(cmd);
    }

    /// Queue a typed command, rejecting it if the active profile's firmware lacks it.
    pub fn send(&self, cmd: RigCommand) -> Result<()> {
        if !self.profile.supports(cmd) {
            return Err(LinkError::Unsupported {
                profile: self.profile.name.clone(),
                command: cmd.to_string(),
            });
        }
        self.submit(cmd.into());
        Ok(())
    }

    /// Everything received since the last call, oldest first. Never blocks.
    pub fn poll_events(&self) -> Vec<InboundEvent> {
        self.inbound.drain()
    }

    /// Stop both workers, wait for them, then close the link.
    pub fn shutdown(mut self) {
        self.stop_workers();
    }

    fn stop_workers(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        self.disconnect();
        info!("session stopped");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::{MockBackend, MockWire};
    use std::time::{Duration, Instant};

    fn fast_profile() -> Profile {
        let mut p = Profile::rig();
        p.timing.idle_poll_ms = 1;
        p.timing.closed_poll_ms = 5;
        p.timing.command_wait_ms = 10;
        p.timing.error_backoff_ms = 5;
        p
    }

    fn start() -> (Session, MockWire) {
        let backend = MockBackend::new();
        let wire = backend.add_port("mock0", "Mock rig");
        let session = Session::start(Arc::new(backend), fast_profile()).unwrap();
        (session, wire)
    }

    /// Poll until `done` holds for the collected events or two seconds pass.
    fn collect_until(
        session: &Session,
        done: impl Fn(&[InboundEvent]) -> bool,
    ) -> Vec<InboundEvent> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut events = Vec::new();
        while Instant::now() < deadline {
            events.extend(session.poll_events());
            if done(&events) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        events
    }

    fn wait_for_lines(wire: &MockWire, done: impl Fn(&[String]) -> bool) -> Vec<String> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline && !done(&wire.written_lines()) {
            thread::sleep(Duration::from_millis(5));
        }
        wire.written_lines()
    }

    #[test]
    fn handshake_and_state_flow_to_consumer() {
        let (session, wire) = start();
        assert!(session.poll_events().is_empty());
        let handle = session.connect("mock0").unwrap();
        assert!(handle.open);
        assert!(!session.handshake_received());

        wire.inject(b"READY\nSTATE HEATER:0 PSU:1 MOTOR:128 T0:25.1\n");
        let events = collect_until(&session, |e| e.len() >= 2);
        assert_eq!(events[0], InboundEvent::Status("READY".into()));
        match &events[1] {
            InboundEvent::StateUpdate(s) => {
                assert_eq!(s.get_or_unknown("MOTOR"), "128");
                assert_eq!(s.get_or_unknown("T2"), crate::UNKNOWN);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(session.handshake_received());
        assert_eq!(session.link().map(|l| l.handshake), Some(true));
    }

    #[test]
    fn commands_reach_the_wire_in_order() {
        let (session, wire) = start();
        session.connect("mock0").unwrap();
        session.send(RigCommand::Heater(true)).unwrap();
        session.send(RigCommand::Psu(true)).unwrap();
        session.send(RigCommand::Beep(120)).unwrap();
        session.submit(OutboundCommand::Raw("HEATER_OFF".into()));
        let lines = wait_for_lines(&wire, |l| l.len() >= 4);
        assert_eq!(lines, vec!["HEATER_ON", "PSU_ON", "BEEP:120", "HEATER_OFF"]);
    }

    #[test]
    fn motor_burst_never_exceeds_submissions_and_ends_on_last_value() {
        let (session, wire) = start();
        session.connect("mock0").unwrap();
        for v in 0..=255u8 {
            session.submit(OutboundCommand::Motor(v));
        }
        session.send(RigCommand::Heater(false)).unwrap();
        let lines = wait_for_lines(&wire, |l| l.last().map(String::as_str) == Some("HEATER_OFF"));
        assert_eq!(lines.last().map(String::as_str), Some("HEATER_OFF"));
        assert!(lines.len() >= 2);
        let motor: Vec<_> = lines.iter().filter(|l| l.starts_with("MOTOR:")).collect();
        assert!(!motor.is_empty() && motor.len() <= 256);
        assert_eq!(lines[lines.len() - 2], "MOTOR:255");
    }

    #[test]
    fn unsupported_command_is_rejected() {
        let (session, wire) = start();
        session.connect("mock0").unwrap();
        let err = session.send(RigCommand::Step(100)).unwrap_err();
        assert!(matches!(err, LinkError::Unsupported { .. }));
        thread::sleep(Duration::from_millis(50));
        assert!(wire.written().is_empty());
    }

    #[test]
    fn submissions_while_disconnected_write_nothing() {
        let (session, wire) = start();
        session.submit(OutboundCommand::Raw("HEATER_ON".into()));
        session.submit(OutboundCommand::Motor(200));
        session.send(RigCommand::Psu(true)).unwrap();
        thread::sleep(Duration::from_millis(100));
        session.connect("mock0").unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(wire.written().is_empty());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (session, wire) = start();
        session.disconnect();
        session.connect("mock0").unwrap();
        session.disconnect();
        session.disconnect();
        assert!(!session.is_connected());
        assert!(session.link().is_none());
        assert_eq!(wire.close_count(), 1);
    }

    #[test]
    fn connect_failure_is_reported_and_recoverable() {
        let (session, wire) = start();
        wire.set_busy(true);
        let err = session.connect("mock0").unwrap_err();
        assert!(err.is_open_failure());
        assert!(!session.is_connected());
        wire.set_busy(false);
        assert!(session.connect("mock0").is_ok());
    }

    #[test]
    fn read_fault_does_not_drop_link() {
        let (session, wire) = start();
        session.connect("mock0").unwrap();
        wire.fail_reads(1);
        let events = collect_until(&session, |e| !e.is_empty());
        assert!(matches!(&events[0], InboundEvent::Log(m) if m.contains("read error")));
        wire.inject(b"READY\n");
        let events = collect_until(&session, |e| !e.is_empty());
        assert_eq!(events, vec![InboundEvent::Status("READY".into())]);
        assert!(session.is_connected());
    }

    #[test]
    fn shutdown_closes_link_promptly() {
        let (session, wire) = start();
        session.connect("mock0").unwrap();
        let start = Instant::now();
        session.shutdown();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(wire.close_count(), 1);
        assert!(!wire.is_in_use());
    }

    #[test]
    fn simulated_rig_round_trip() {
        let session = Session::start(Arc::new(MockBackend::simulated()), fast_profile()).unwrap();
        assert_eq!(session.list_ports().unwrap()[0].name, "mock0");
        session.connect("mock0").unwrap();
        let events = collect_until(&session, |e| !e.is_empty());
        assert_eq!(events[0], InboundEvent::Status("READY".into()));

        session.send(RigCommand::Heater(true)).unwrap();
        let events = collect_until(&session, |e| !e.is_empty());
        match &events[0] {
            InboundEvent::StateUpdate(s) => {
                assert_eq!(s.get("HEATER"), Some("1"));
                assert!(s.parse::<f64>("T0").is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
