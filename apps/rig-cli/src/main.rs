use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{info, warn};

use rig_link as rig;
use rig_link::{InboundEvent, Profile, RigCommand, Session};

#[derive(Parser, Debug)]
#[command(
    name = "rig",
    version,
    about = "Thermal & motor test rig control",
    disable_help_subcommand = true
)]
struct Cli {
    /// Use the simulated rig instead of hardware serial ports
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    mock: bool,

    /// Built-in profile: rig (115200 baud) or classic (9600 baud)
    #[arg(long, default_value = "rig", global = true)]
    profile: String,

    /// JSON profile file; overrides --profile
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports
    Ports {
        /// Print the list as JSON instead of tab-separated lines
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Print the built-in profiles as JSON
    Profiles,
    /// Connect and print telemetry as it arrives
    Monitor {
        /// Serial port (e.g. /dev/ttyUSB0, COM13)
        #[arg(long)]
        port: String,
        /// Stop after this many seconds (0 runs until killed)
        #[arg(long, default_value_t = 0u64)]
        duration_s: u64,
        /// Append events as JSON lines to this file
        #[arg(long)]
        to: Option<String>,
    },
    /// Connect and send commands, e.g. `HEATER_ON MOTOR:128 STEP:100`
    Send {
        #[arg(long)]
        port: String,
        /// Wait up to this long for the READY handshake before sending (0 to skip)
        #[arg(long, default_value_t = 3000u64)]
        wait_ready_ms: u64,
        /// Commands in wire form
        #[arg(required = true)]
        commands: Vec<String>,
    },
    /// Ramp the motor PWM between two values
    Sweep {
        #[arg(long)]
        port: String,
        #[arg(long, default_value_t = 0u8)]
        from: u8,
        #[arg(long, default_value_t = 255u8)]
        to: u8,
        #[arg(long, default_value_t = 5u8)]
        step: u8,
        /// Delay between updates
        #[arg(long, default_value_t = 10u64)]
        interval_ms: u64,
    },
}

fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Profiles => print_profiles(),
        Commands::Ports { json } => list_ports(&open_session(&cli)?, *json),
        Commands::Monitor {
            port,
            duration_s,
            to,
        } => monitor(&open_session(&cli)?, port, *duration_s, to.as_deref()),
        Commands::Send {
            port,
            wait_ready_ms,
            commands,
        } => send(&open_session(&cli)?, port, *wait_ready_ms, commands),
        Commands::Sweep {
            port,
            from,
            to,
            step,
            interval_ms,
        } => sweep(&open_session(&cli)?, port, *from, *to, *step, *interval_ms),
    }
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn load_profile(cli: &Cli) -> Result<Profile> {
    match &cli.config {
        Some(path) => Ok(Profile::load(path)?),
        None => Profile::by_name(&cli.profile)
            .ok_or_else(|| anyhow::anyhow!("unknown profile: {}", cli.profile)),
    }
}

fn open_session(cli: &Cli) -> Result<Session> {
    let profile = load_profile(cli)?;
    let backend: Arc<dyn rig::Backend> = if cli.mock {
        Arc::new(rig::MockBackend::simulated())
    } else {
        Arc::new(rig::SerialBackend::new())
    };
    Ok(Session::start(backend, profile)?)
}

fn print_profiles() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&Profile::builtin())?);
    Ok(())
}

fn list_ports(session: &Session, json: bool) -> Result<()> {
    let ports = session.list_ports()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }
    for p in ports {
        println!("{}\t{}", p.name, p.description);
    }
    Ok(())
}

fn connect(session: &Session, port: &str) -> Result<()> {
    let link = session
        .connect(port)
        .with_context(|| format!("connecting to {port}"))?;
    info!(port = %link.port, baud = link.baud_rate, "connected");
    Ok(())
}

fn print_event(ev: &InboundEvent) {
    match ev {
        InboundEvent::Status(s) => println!("status: {s}"),
        InboundEvent::StateUpdate(s) => println!(
            "state: T0={} T1={} T2={} TDS={} HEATER={} PSU={} MOTOR={}",
            s.get_or_unknown("T0"),
            s.get_or_unknown("T1"),
            s.get_or_unknown("T2"),
            s.get_or_unknown("TDS"),
            s.get_or_unknown("HEATER"),
            s.get_or_unknown("PSU"),
            s.get_or_unknown("MOTOR"),
        ),
        InboundEvent::Log(s) => println!("log: {s}"),
    }
}

/// Drain and print pending events once; the consumer side of one UI tick.
fn drain_events(session: &Session) -> Vec<InboundEvent> {
    let events = session.poll_events();
    for ev in &events {
        print_event(ev);
    }
    events
}

#[derive(Serialize)]
struct EventLogHeader<'a> {
    format: &'a str,
    version: u32,
    port: &'a str,
    profile: &'a str,
    baud_rate: u32,
}

#[derive(Serialize)]
struct EventLogRecord<'a> {
    ts: String,
    event: &'a InboundEvent,
}

fn event_log_record(ev: &InboundEvent) -> String {
    let ts = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();
    serde_json::to_string(&EventLogRecord { ts, event: ev }).unwrap_or_else(|_| "{}".to_string())
}

fn monitor(session: &Session, port: &str, duration_s: u64, to: Option<&str>) -> Result<()> {
    let mut writer = match to {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening {path}"))?;
            let mut w = BufWriter::new(file);
            let profile = session.profile();
            let header = EventLogHeader {
                format: "riglog",
                version: 1,
                port,
                profile: &profile.name,
                baud_rate: profile.baud_rate,
            };
            writeln!(w, "{}", serde_json::to_string(&header)?)?;
            Some(w)
        }
        None => None,
    };

    connect(session, port)?;
    let tick = session.profile().timing.event_tick();
    let deadline = (duration_s > 0).then(|| Instant::now() + Duration::from_secs(duration_s));
    loop {
        let events = drain_events(session);
        if let Some(w) = writer.as_mut() {
            for ev in &events {
                writeln!(w, "{}", event_log_record(ev))?;
            }
            w.flush()?;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        thread::sleep(tick);
    }
    session.disconnect();
    Ok(())
}

fn wait_ready(session: &Session, timeout: Duration) -> bool {
    let tick = session.profile().timing.event_tick();
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        drain_events(session);
        if session.handshake_received() {
            return true;
        }
        thread::sleep(tick);
    }
    false
}

fn send(session: &Session, port: &str, wait_ready_ms: u64, commands: &[String]) -> Result<()> {
    let parsed = commands
        .iter()
        .map(|c| c.parse::<RigCommand>().map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()?;

    connect(session, port)?;
    if wait_ready_ms > 0 && !wait_ready(session, Duration::from_millis(wait_ready_ms)) {
        warn!(port, "no READY from device; sending anyway");
    }
    for cmd in parsed {
        session.send(cmd)?;
        println!("sent: {cmd}");
    }
    settle(session);
    session.disconnect();
    Ok(())
}

fn sweep(
    session: &Session,
    port: &str,
    from: u8,
    to: u8,
    step: u8,
    interval_ms: u64,
) -> Result<()> {
    anyhow::ensure!(step > 0, "step must be non-zero");
    connect(session, port)?;
    let interval = Duration::from_millis(interval_ms);
    let tick = session.profile().timing.event_tick();
    let mut last_drain = Instant::now();
    let mut value = from;
    let mut submitted = 0u32;
    loop {
        session.send(RigCommand::Motor(value))?;
        submitted += 1;
        if last_drain.elapsed() >= tick {
            drain_events(session);
            last_drain = Instant::now();
        }
        if value == to {
            break;
        }
        value = if from <= to {
            value.saturating_add(step).min(to)
        } else {
            value.saturating_sub(step).max(to)
        };
        thread::sleep(interval);
    }
    println!("submitted {submitted} motor updates, final {to}");
    settle(session);
    session.disconnect();
    Ok(())
}

/// Give the writer time to flush and print whatever the device answered.
fn settle(session: &Session) {
    let timing = session.profile().timing;
    let wait = Duration::from_millis(timing.command_wait_ms + timing.error_backoff_ms);
    let deadline = Instant::now() + wait;
    while Instant::now() < deadline {
        drain_events(session);
        thread::sleep(timing.event_tick());
    }
    drain_events(session);
}
