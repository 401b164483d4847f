//! Error types for weir
//!
//! Only *recoverable* conditions travel through this enum: configuration
//! and topology mistakes surface at startup, worker/channel failures
//! surface to whoever injected the work. Invariant violations inside the
//! engine (double destroy, payload on a dead line, state slot type
//! mismatch) are programming defects and abort at the point of detection
//! instead of unwinding through half-consistent stages.

use thiserror::Error;

/// Main error type for weir
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Unknown stage kind: {0}")]
    UnknownStage(String),

    #[error("Worker {0} is not running")]
    WorkerUnavailable(usize),

    #[error("Engine is shut down")]
    EngineClosed,
}

/// Result type alias for weir
pub type Result<T> = std::result::Result<T, Error>;
