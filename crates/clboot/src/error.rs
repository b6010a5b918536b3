//! Error types for clboot.

use thiserror::Error;

use crate::device::Operation;
use crate::status::StatusCode;

/// Process exit status for a failed single-module build.
pub const EXIT_BUILD_FAILURE: u8 = 100;

/// Process exit status for a failed multi-module compile or link.
pub const EXIT_COMPILE_FAILURE: u8 = 1;

/// Process exit status for invalid configuration or input.
pub const EXIT_USAGE: u8 = 2;

/// Process exit status for any other device API failure.
///
/// Matches the status a shell reports for an aborted process.
pub const EXIT_DEVICE_FAILURE: u8 = 134;

/// Errors that can occur while bootstrapping a device.
#[derive(Debug, Error)]
pub enum BootError {
    /// A device API call returned a non-success status.
    #[error("{operation} failed: {status}")]
    DeviceApi {
        /// The failing entry point.
        operation: Operation,
        /// Status it returned.
        status: StatusCode,
    },

    /// A source module failed to compile.
    #[error("failed to compile {module}: {status}")]
    Compile {
        /// Module name as given by the caller.
        module: String,
        /// Status returned by the compiler.
        status: StatusCode,
        /// Compiler log, possibly truncated.
        log: String,
    },

    /// Compiled modules failed to link.
    #[error("failed to link program: {status}")]
    Link {
        /// Status returned by the linker.
        status: StatusCode,
        /// Linker log, possibly truncated.
        log: String,
    },

    /// The single-module build failed.
    #[error("failed to build {source_ref}: {status}")]
    Build {
        /// Module name the program was built from.
        source_ref: String,
        /// Status returned by the build.
        status: StatusCode,
        /// Build log, possibly truncated.
        log: String,
    },

    /// `compile_and_link` was called without modules.
    #[error("empty module list: nothing to compile")]
    EmptyModuleList,

    /// A module name cannot be expressed as an include directive.
    #[error("invalid module name: {0:?}")]
    InvalidModuleName(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BootError {
    /// Build a [`BootError::DeviceApi`].
    #[must_use]
    pub const fn device(operation: Operation, status: StatusCode) -> Self {
        Self::DeviceApi { operation, status }
    }

    /// The device status code carried by this error, if any.
    #[must_use]
    pub const fn status(&self) -> Option<StatusCode> {
        match self {
            Self::DeviceApi { status, .. }
            | Self::Compile { status, .. }
            | Self::Link { status, .. }
            | Self::Build { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The build/compile/link log carried by this error, if any.
    #[must_use]
    pub fn log(&self) -> Option<&str> {
        match self {
            Self::Compile { log, .. } | Self::Link { log, .. } | Self::Build { log, .. } => Some(log),
            _ => None,
        }
    }

    /// Process exit status for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Build { .. } => EXIT_BUILD_FAILURE,
            Self::Compile { .. } | Self::Link { .. } => EXIT_COMPILE_FAILURE,
            Self::EmptyModuleList | Self::InvalidModuleName(_) | Self::Config(_) | Self::Io(_) => EXIT_USAGE,
            Self::DeviceApi { .. } => EXIT_DEVICE_FAILURE,
        }
    }
}

/// Result type for bootstrap operations.
pub type Result<T> = std::result::Result<T, BootError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_display_names_operation_and_status() {
        let err = BootError::device(Operation::CreateContext, StatusCode::OUT_OF_HOST_MEMORY);
        assert_eq!(
            err.to_string(),
            "clCreateContext failed: CL_OUT_OF_HOST_MEMORY (-6)"
        );
    }

    #[test]
    fn build_failure_exits_with_100() {
        let err = BootError::Build {
            source_ref: "main.cl".into(),
            status: StatusCode::BUILD_PROGRAM_FAILURE,
            log: "error".into(),
        };
        assert_eq!(err.exit_code(), 100);
        assert_eq!(err.log(), Some("error"));
    }

    #[test]
    fn device_failure_exit_code_is_distinct_from_build() {
        let err = BootError::device(Operation::DeviceIds, StatusCode::DEVICE_NOT_FOUND);
        assert_ne!(err.exit_code(), EXIT_BUILD_FAILURE);
        assert_ne!(err.exit_code(), 0);
        assert_eq!(err.status(), Some(StatusCode::DEVICE_NOT_FOUND));
        assert!(err.log().is_none());
    }

    #[test]
    fn compile_and_link_share_exit_code() {
        let compile = BootError::Compile {
            module: "util.cl".into(),
            status: StatusCode::COMPILE_PROGRAM_FAILURE,
            log: String::new(),
        };
        let link = BootError::Link {
            status: StatusCode::LINK_PROGRAM_FAILURE,
            log: String::new(),
        };
        assert_eq!(compile.exit_code(), EXIT_COMPILE_FAILURE);
        assert_eq!(link.exit_code(), EXIT_COMPILE_FAILURE);
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = BootError::from(io_err);
        assert!(matches!(err, BootError::Io(_)));
        assert_eq!(err.exit_code(), EXIT_USAGE);
    }
}
