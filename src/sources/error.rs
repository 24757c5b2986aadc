use thiserror::Error;

/// Failures inside an adapter. They never reach the synchronizer: the
/// adapter logs them and posts `SourceLost` or nothing at all.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0} is not available")]
    Unavailable(String),

    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Command {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("JACK error: {0}")]
    Jack(#[from] jack::Error),

    #[error("D-Bus error: {0}")]
    Bus(#[from] zbus::Error),
}

impl SourceError {
    /// True when the backend is simply absent rather than misbehaving.
    pub fn is_absent(&self) -> bool {
        match self {
            SourceError::Unavailable(_) => true,
            SourceError::Spawn { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type SourceResult<T> = Result<T, SourceError>;
