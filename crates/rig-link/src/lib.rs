//! rig-link: serial link engine for the thermal/motor test rig
//!
//! A [`Session`] owns one serial link, a background reader that frames and classifies incoming
//! lines, and a background writer that coalesces motor PWM updates. Consumers submit commands
//! and drain [`InboundEvent`]s on their own tick. The default build enables a `mock` backend so
//! the engine can run without hardware; the `serial` feature adds the real port backend.

mod types;
pub use types::{InboundEvent, OutboundCommand, PortInfo, RigCommand, StateSnapshot, UNKNOWN};

mod error;
pub use error::{LinkError, Result};

mod traits;
pub use traits::{Backend, Port, PortSettings};

mod config;
pub use config::{CommandSet, Profile, Timing};

mod snapshot;
pub use snapshot::parse_state;

mod protocol;
pub use protocol::{classify_line, encode_command, LineFramer};

mod queue;
pub use queue::Queue;

mod link;
pub use link::{LinkHandle, LinkManager};

mod reader;
pub use reader::FrameReader;

mod writer;
pub use writer::{coalesce, CommandWriter};

mod session;
pub use session::Session;

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockBackend, MockWire};

#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::SerialBackend;
