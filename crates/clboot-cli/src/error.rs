//! CLI error types.

use thiserror::Error;

use clboot::BootError;
use clboot::error::EXIT_USAGE;

/// Exit status for failures outside the bootstrap itself.
pub const EXIT_FAILURE: u8 = 1;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// The bootstrap failed.
    #[error(transparent)]
    Boot(#[from] BootError),
    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Output formatting error.
    #[error("format error: {0}")]
    Format(String),
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit status for this error.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Boot(err) => err.exit_code(),
            Self::InvalidArgument(_) => EXIT_USAGE,
            Self::Format(_) | Self::Io(_) => EXIT_FAILURE,
        }
    }
}
