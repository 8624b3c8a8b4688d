use crate::{LinkError, PortSettings, Result, RigCommand};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Commands beyond heater and motor that a firmware build understands.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSet {
    pub psu: bool,
    pub stepper: bool,
    pub beep: bool,
}

impl Default for CommandSet {
    fn default() -> Self {
        Self {
            psu: true,
            stepper: false,
            beep: true,
        }
    }
}

/// Loop intervals, in milliseconds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Reader sleep when the link is open but no bytes are waiting.
    pub idle_poll_ms: u64,
    /// Reader sleep while no link is open.
    pub closed_poll_ms: u64,
    /// Pause after a read error or write timeout.
    pub error_backoff_ms: u64,
    /// Writer wait on the outbound queue before re-checking the stop flag.
    pub command_wait_ms: u64,
    /// Consumer drain interval.
    pub event_tick_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            idle_poll_ms: 10,
            closed_poll_ms: 50,
            error_backoff_ms: 200,
            command_wait_ms: 100,
            event_tick_ms: 50,
        }
    }
}

impl Timing {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
    pub fn closed_poll(&self) -> Duration {
        Duration::from_millis(self.closed_poll_ms)
    }
    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
    pub fn command_wait(&self) -> Duration {
        Duration::from_millis(self.command_wait_ms)
    }
    pub fn event_tick(&self) -> Duration {
        Duration::from_millis(self.event_tick_ms)
    }
}

/// Connection and protocol parameters for one firmware variant.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub name: String,
    pub baud_rate: u32,
    pub io_timeout_ms: u64,
    pub commands: CommandSet,
    /// Map `TEMP(C): <v>` lines to a `T0` snapshot.
    pub legacy_temperature: bool,
    /// Longest line the reader buffers before discarding it.
    pub max_line_len: usize,
    pub timing: Timing,
}

impl Default for Profile {
    fn default() -> Self {
        Self::rig()
    }
}

impl Profile {
    /// Multi-sensor firmware: READY handshake, STATE telemetry, PSU and beeper.
    pub fn rig() -> Self {
        Self {
            name: "rig".to_string(),
            baud_rate: 115_200,
            io_timeout_ms: 200,
            commands: CommandSet::default(),
            legacy_temperature: false,
            max_line_len: 1024,
            timing: Timing::default(),
        }
    }

    /// Single-thermocouple firmware with stepper support, reporting `TEMP(C):` lines.
    pub fn classic() -> Self {
        Self {
            name: "classic".to_string(),
            baud_rate: 9_600,
            commands: CommandSet {
                psu: false,
                stepper: true,
                beep: false,
            },
            legacy_temperature: true,
            ..Self::rig()
        }
    }

    pub fn builtin() -> Vec<Profile> {
        vec![Self::rig(), Self::classic()]
    }

    pub fn by_name(name: &str) -> Option<Self> {
        Self::builtin()
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Read a JSON profile; absent fields take the `rig` values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| LinkError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_json(&raw).map_err(|e| match e {
            LinkError::Config(msg) => LinkError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let profile: Profile =
            serde_json::from_str(raw).map_err(|e| LinkError::Config(e.to_string()))?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(LinkError::Config("baud_rate must be non-zero".into()));
        }
        if self.max_line_len == 0 {
            return Err(LinkError::Config("max_line_len must be non-zero".into()));
        }
        Ok(())
    }

    pub fn supports(&self, cmd: RigCommand) -> bool {
        match cmd {
            RigCommand::Heater(_) | RigCommand::Motor(_) => true,
            RigCommand::Psu(_) => self.commands.psu,
            RigCommand::Step(_) => self.commands.stepper,
            RigCommand::Beep(_) => self.commands.beep,
        }
    }

    pub fn port_settings(&self) -> PortSettings {
        PortSettings {
            baud_rate: self.baud_rate,
            timeout: Duration::from_millis(self.io_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_profiles_differ_in_baud_and_commands() {
        let rig = Profile::rig();
        let classic = Profile::classic();
        assert_eq!(rig.baud_rate, 115_200);
        assert_eq!(classic.baud_rate, 9_600);
        assert!(rig.supports(RigCommand::Psu(true)));
        assert!(!rig.supports(RigCommand::Step(10)));
        assert!(classic.supports(RigCommand::Step(10)));
        assert!(!classic.supports(RigCommand::Beep(100)));
        assert!(classic.supports(RigCommand::Motor(0)));
        assert_eq!(Profile::by_name("CLASSIC"), Some(classic));
        assert_eq!(Profile::by_name("nope"), None);
    }

    #[test]
    fn partial_json_defaults_from_rig() {
        let raw = r#"{"name":"bench","baud_rate":57600,"timing":{"idle_poll_ms":5}}"#;
        let p = Profile::from_json(raw).unwrap();
        assert_eq!(p.name, "bench");
        assert_eq!(p.baud_rate, 57_600);
        assert_eq!(p.io_timeout_ms, 200);
        assert_eq!(p.timing.idle_poll_ms, 5);
        assert_eq!(p.timing.command_wait_ms, 100);
        assert_eq!(p.commands, CommandSet::default());
    }

    #[test]
    fn invalid_json_is_config_error() {
        assert!(matches!(
            Profile::from_json("{\"baud_rate\":0}"),
            Err(LinkError::Config(_))
        ));
        assert!(matches!(
            Profile::from_json("not json"),
            Err(LinkError::Config(_))
        ));
    }
}
