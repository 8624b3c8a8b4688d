use crate::{
    encode_command, InboundEvent, LinkError, LinkManager, OutboundCommand, Profile, Queue, Timing,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace, warn};

/// Collapse a run of motor updates starting at `first`.
///
/// A non-motor `first` is returned alone. Otherwise `next` is drained until it yields `None`:
/// later motor values replace the pending one, and any other command flushes the pending motor
/// value ahead of itself. Whatever motor value is still pending at the end goes last.
pub fn coalesce(
    first: OutboundCommand,
    mut next: impl FnMut() -> Option<OutboundCommand>,
) -> Vec<OutboundCommand> {
    let mut pending = match first {
        OutboundCommand::Motor(pwm) => Some(pwm),
        other => return vec![other],
    };
    let mut out = Vec::new();
    while let Some(cmd) = next() {
        match cmd {
            OutboundCommand::Motor(pwm) => pending = Some(pwm),
            other => {
                if let Some(pwm) = pending.take() {
                    out.push(OutboundCommand::Motor(pwm));
                }
                out.push(other);
            }
        }
    }
    if let Some(pwm) = pending {
        out.push(OutboundCommand::Motor(pwm));
    }
    out
}

/// Background loop moving [`OutboundCommand`]s from the queue onto the wire.
pub struct CommandWriter {
    link: Arc<LinkManager>,
    commands: Queue<OutboundCommand>,
    events: Queue<InboundEvent>,
    timing: Timing,
}

impl CommandWriter {
    pub fn new(
        link: Arc<LinkManager>,
        commands: Queue<OutboundCommand>,
        events: Queue<InboundEvent>,
        profile: &Profile,
    ) -> Self {
        Self {
            link,
            commands,
            events,
            timing: profile.timing,
        }
    }

    /// Run until `stop` is set. Write failures are reported as `Log` events.
    pub fn run(mut self, stop: &AtomicBool) {
        debug!("writer started");
        while !stop.load(Ordering::SeqCst) {
            self.poll_once();
        }
        debug!("writer stopped");
    }

    /// Wait for one command and write it, together with anything it coalesces with.
    /// Returns `false` when the wait timed out.
    pub fn poll_once(&mut self) -> bool {
        let Some(first) = self.commands.take_timeout(self.timing.command_wait()) else {
            return false;
        };
        if !self.link.is_open() {
            trace!(command = %first.text(), "no link, dropping command");
            return true;
        }
        let commands = &self.commands;
        let batch = coalesce(first, || commands.try_take());
        self.write_batch(&batch);
        true
    }

    /// Write each command in turn. A failed write is reported and the rest still go out; only a
    /// closed link ends the batch early.
    fn write_batch(&self, batch: &[OutboundCommand]) {
        for (i, cmd) in batch.iter().enumerate() {
            let line = encode_command(cmd);
            match self.link.write(&line) {
                Ok(true) => debug!(line = %cmd.text(), "sent"),
                Ok(false) => {
                    trace!(dropped = batch.len() - i, "link closed mid-batch");
                    return;
                }
                Err(e) => self.report(cmd, &e),
            }
        }
    }

    fn report(&self, cmd: &OutboundCommand, err: &LinkError) {
        let msg = match err {
            LinkError::Timeout => format!("serial write timeout sending {}", cmd.text()),
            other => format!("serial write error sending {}: {other}", cmd.text()),
        };
        warn!("{msg}");
        self.events.push(InboundEvent::Log(msg));
        if matches!(err, LinkError::Timeout) {
            thread::sleep(self.timing.error_backoff());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn raw(s: &str) -> OutboundCommand {
        OutboundCommand::Raw(s.to_string())
    }

    fn run_all(input: Vec<OutboundCommand>) -> Vec<OutboundCommand> {
        let mut q: VecDeque<_> = input.into();
        let mut out = Vec::new();
        while let Some(first) = q.pop_front() {
            out.extend(coalesce(first, || q.pop_front()));
        }
        out
    }

    #[test]
    fn motor_burst_collapses_to_last_value() {
        let input: Vec<_> = (0..=200u8).map(OutboundCommand::Motor).collect();
        assert_eq!(run_all(input), vec![OutboundCommand::Motor(200)]);
    }

    #[test]
    fn raw_first_is_sent_alone() {
        let mut rest = vec![OutboundCommand::Motor(1)].into_iter();
        assert_eq!(coalesce(raw("PSU_ON"), || rest.next()), vec![raw("PSU_ON")]);
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn pending_motor_flushes_before_raw() {
        let input = vec![
            OutboundCommand::Motor(1),
            raw("HEATER_ON"),
            OutboundCommand::Motor(2),
            OutboundCommand::Motor(3),
            raw("PSU_ON"),
            raw("BEEP:100"),
            OutboundCommand::Motor(4),
        ];
        assert_eq!(
            run_all(input),
            vec![
                OutboundCommand::Motor(1),
                raw("HEATER_ON"),
                OutboundCommand::Motor(3),
                raw("PSU_ON"),
                raw("BEEP:100"),
                OutboundCommand::Motor(4),
            ]
        );
    }

    #[test]
    fn interleavings_keep_raw_order_and_last_motor_per_gap() {
        // Deterministic pseudo-random interleavings.
        let mut seed: u32 = 0x2545_F491;
        for _ in 0..200 {
            let mut input = Vec::new();
            let len = 1 + (seed % 40) as usize;
            for i in 0..len {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                if (seed >> 16) % 3 == 0 {
                    input.push(raw(&format!("STEP:{i}")));
                } else {
                    input.push(OutboundCommand::Motor((seed >> 8) as u8));
                }
            }

            // Each gap between raw commands contributes its last motor value, then the raw.
            let mut expected = Vec::new();
            let mut last_motor = None;
            for cmd in &input {
                match cmd {
                    OutboundCommand::Motor(v) => last_motor = Some(*v),
                    r => {
                        expected.extend(last_motor.take().map(OutboundCommand::Motor));
                        expected.push(r.clone());
                    }
                }
            }
            expected.extend(last_motor.map(OutboundCommand::Motor));

            assert_eq!(run_all(input), expected);
        }
    }

    #[cfg(feature = "mock")]
    mod wire {
        use super::*;
        use crate::{MockBackend, MockWire};

        fn setup() -> (
            Arc<LinkManager>,
            MockWire,
            Queue<OutboundCommand>,
            Queue<InboundEvent>,
            CommandWriter,
        ) {
            let mut profile = Profile::rig();
            profile.timing.command_wait_ms = 5;
            profile.timing.error_backoff_ms = 1;
            let backend = MockBackend::new();
            let wire = backend.add_port("mock0", "Mock rig");
            let link = Arc::new(LinkManager::new(Arc::new(backend), profile.port_settings()));
            let commands = Queue::new();
            let events = Queue::new();
            let writer =
                CommandWriter::new(link.clone(), commands.clone(), events.clone(), &profile);
            (link, wire, commands, events, writer)
        }

        #[test]
        fn writes_coalesced_lines() -> anyhow::Result<()> {
            let (link, wire, commands, _events, mut writer) = setup();
            link.open("mock0")?;
            for v in [10u8, 20, 30] {
                commands.push(OutboundCommand::Motor(v));
            }
            commands.push(raw("HEATER_ON"));
            commands.push(OutboundCommand::Motor(40));
            commands.push(OutboundCommand::Motor(50));
            assert!(writer.poll_once());
            assert!(!writer.poll_once());
            assert_eq!(wire.written_lines(), vec!["MOTOR:30", "HEATER_ON", "MOTOR:50"]);
            Ok(())
        }

        #[test]
        fn drops_commands_while_disconnected() -> anyhow::Result<()> {
            let (link, wire, commands, events, mut writer) = setup();
            commands.push(raw("HEATER_ON"));
            commands.push(OutboundCommand::Motor(99));
            commands.push(raw("STEP:5"));
            while writer.poll_once() {}
            assert!(commands.is_empty());

            link.open("mock0")?;
            assert!(!writer.poll_once());
            assert!(wire.written().is_empty());
            assert!(events.is_empty());
            Ok(())
        }

        #[test]
        fn write_timeout_is_reported_and_loop_continues() -> anyhow::Result<()> {
            let (link, wire, commands, events, mut writer) = setup();
            link.open("mock0")?;
            wire.fail_writes(1, true);
            commands.push(OutboundCommand::Motor(5));
            commands.push(raw("PSU_ON"));
            assert!(writer.poll_once());
            match events.drain().as_slice() {
                [InboundEvent::Log(m)] => assert!(m.contains("timeout sending MOTOR:5")),
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(wire.written_lines(), vec!["PSU_ON"]);

            commands.push(raw("PSU_OFF"));
            assert!(writer.poll_once());
            assert_eq!(wire.written_lines(), vec!["PSU_ON", "PSU_OFF"]);
            assert!(link.is_open());
            Ok(())
        }

        #[test]
        fn failed_motor_write_keeps_later_commands_in_batch() -> anyhow::Result<()> {
            let (link, wire, commands, events, mut writer) = setup();
            link.open("mock0")?;
            wire.fail_writes(1, false);
            commands.push(OutboundCommand::Motor(5));
            commands.push(raw("HEATER_OFF"));
            while writer.poll_once() {}
            assert_eq!(wire.written_lines(), vec!["HEATER_OFF"]);
            match events.drain().as_slice() {
                [InboundEvent::Log(m)] => {
                    assert!(m.contains("write error sending MOTOR:5"));
                    assert!(!m.contains("discarded"));
                }
                other => panic!("unexpected {other:?}"),
            }
            Ok(())
        }

        #[test]
        fn other_write_errors_are_reported() -> anyhow::Result<()> {
            let (link, wire, commands, events, mut writer) = setup();
            link.open("mock0")?;
            wire.fail_writes(1, false);
            commands.push(raw("BEEP:50"));
            assert!(writer.poll_once());
            match events.drain().as_slice() {
                [InboundEvent::Log(m)] => assert!(m.contains("write error sending BEEP:50")),
                other => panic!("unexpected {other:?}"),
            }
            Ok(())
        }
    }
}
