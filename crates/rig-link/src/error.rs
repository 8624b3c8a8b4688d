use std::io;
use thiserror::Error;

pub type Result<T, E = LinkError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("port unavailable: {0}")]
    PortUnavailable(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("timeout")]
    Timeout,
    #[error("command {command} not supported by profile {profile}")]
    Unsupported { profile: String, command: String },
    #[error("invalid config: {0}")]
    Config(String),
    #[error("failed to spawn {0} thread")]
    Spawn(&'static str),
}

impl LinkError {
    /// True for the failures `open` can report; the link stays disconnected after these.
    pub fn is_open_failure(&self) -> bool {
        matches!(
            self,
            LinkError::PortUnavailable(_)
                | LinkError::PermissionDenied(_)
                | LinkError::DeviceNotFound(_)
        )
    }
}

impl From<io::Error> for LinkError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => LinkError::Timeout,
            _ => LinkError::Io(e.to_string()),
        }
    }
}
