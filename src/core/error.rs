//! Crate-wide error type.
//!
//! Only setup and boundary validation return errors. Once the worker threads
//! are running, faults travel as Status fields instead.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid {what} port {value}: must be in 1..=65535")]
    InvalidPort { what: &'static str, value: i64 },

    #[error("invalid time scaling {0}: must be finite and greater than zero")]
    InvalidScaling(f64),

    #[error("malformed command: {0}")]
    InvalidCommand(String),

    #[error("orchestrator already started")]
    AlreadyStarted,

    #[error("orchestrator is stopped")]
    Stopped,

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, HubError>;
