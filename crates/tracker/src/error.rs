use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the progress recorder and its instrumentation
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The log directory could not be prepared; the task never starts
    #[error("failed to prepare progress log at {}: {source}", path.display())]
    Setup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn heartbeat thread: {0}")]
    Heartbeat(#[source] std::io::Error),

    #[error("progress recorder has not been started")]
    NotStarted,

    #[error("progress recorder was already started")]
    AlreadyStarted,

    /// Any call after `stop` is a misuse of the recorder
    #[error("progress recorder has already been stopped")]
    Stopped,

    #[error("stage {stage} is out of range (max {max})")]
    InvalidStage { stage: u32, max: u32 },
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;
