use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Placeholder shown for snapshot keys the device did not report.
pub const UNKNOWN: &str = "N/A";

/// A serial device found during discovery.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

/// What the writer thread transmits. Only `Motor` values are coalescible.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OutboundCommand {
    Raw(String),
    Motor(u8),
}

impl OutboundCommand {
    pub fn is_motor(&self) -> bool {
        matches!(self, OutboundCommand::Motor(_))
    }

    /// Wire text without the line terminator.
    pub fn text(&self) -> String {
        match self {
            OutboundCommand::Raw(s) => s.clone(),
            OutboundCommand::Motor(pwm) => format!("MOTOR:{pwm}"),
        }
    }
}

/// Typed rig command. Converts into the [`OutboundCommand`] the writer sends.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RigCommand {
    Heater(bool),
    Psu(bool),
    Motor(u8),
    Step(i32),
    Beep(u32),
}

impl RigCommand {
    pub fn name(self) -> &'static str {
        match self {
            RigCommand::Heater(_) => "heater",
            RigCommand::Psu(_) => "psu",
            RigCommand::Motor(_) => "motor",
            RigCommand::Step(_) => "step",
            RigCommand::Beep(_) => "beep",
        }
    }
}

impl fmt::Display for RigCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RigCommand::Heater(true) => f.write_str("HEATER_ON"),
            RigCommand::Heater(false) => f.write_str("HEATER_OFF"),
            RigCommand::Psu(true) => f.write_str("PSU_ON"),
            RigCommand::Psu(false) => f.write_str("PSU_OFF"),
            RigCommand::Motor(pwm) => write!(f, "MOTOR:{pwm}"),
            RigCommand::Step(n) => write!(f, "STEP:{n}"),
            RigCommand::Beep(ms) => write!(f, "BEEP:{ms}"),
        }
    }
}

impl FromStr for RigCommand {
    type Err = String;

    /// Parses the wire form, case-insensitively (`heater_on`, `MOTOR:128`, `step:-200`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim().to_ascii_uppercase();
        match t.as_str() {
            "HEATER_ON" => return Ok(RigCommand::Heater(true)),
            "HEATER_OFF" => return Ok(RigCommand::Heater(false)),
            "PSU_ON" => return Ok(RigCommand::Psu(true)),
            "PSU_OFF" => return Ok(RigCommand::Psu(false)),
            _ => {}
        }
        let (head, arg) = t
            .split_once(':')
            .ok_or_else(|| format!("unrecognized command: {s}"))?;
        let arg = arg.trim();
        match head {
            "MOTOR" => arg
                .parse::<u8>()
                .map(RigCommand::Motor)
                .map_err(|_| format!("motor pwm must be 0-255: {arg}")),
            "STEP" => arg
                .parse::<i32>()
                .map(RigCommand::Step)
                .map_err(|_| format!("invalid step count: {arg}")),
            "BEEP" => arg
                .parse::<u32>()
                .map(RigCommand::Beep)
                .map_err(|_| format!("invalid beep duration: {arg}")),
            _ => Err(format!("unrecognized command: {s}")),
        }
    }
}

impl From<RigCommand> for OutboundCommand {
    fn from(cmd: RigCommand) -> Self {
        match cmd {
            RigCommand::Motor(pwm) => OutboundCommand::Motor(pwm),
            other => OutboundCommand::Raw(other.to_string()),
        }
    }
}

/// One decoded `STATE` line: sensor/actuator key to raw string value.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateSnapshot {
    values: BTreeMap<String, String>,
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Value for `key`, or [`UNKNOWN`] when the device did not report it.
    pub fn get_or_unknown(&self, key: &str) -> &str {
        self.get(key).unwrap_or(UNKNOWN)
    }

    /// Numeric view of a value; `None` when missing or not parseable as `T`.
    pub fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for StateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self.iter() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

/// Events handed to the polling consumer, in arrival order.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    Status(String),
    StateUpdate(StateSnapshot),
    Log(String),
}
