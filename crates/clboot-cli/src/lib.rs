//! # clboot-cli
//!
//! Command-line front end for [`clboot`].
//!
//! Provides commands for:
//! - Running the bootstrap chain against kernel sources on disk, on the
//!   in-process [`clboot::SimulatedDevice`] (no real accelerator is used)
//! - Translating device status codes
//! - Writing a sample configuration
//!
//! Failures print the same diagnostics a device runtime user expects
//! (`Error clCreateContext -> CL_OUT_OF_HOST_MEMORY`, `Failed to compile
//! util.cl:` followed by the compiler log) and map to distinct exit
//! statuses; see [`CliError::exit_code`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod commands;
pub mod error;
pub mod output;

pub use cli::{Cli, Commands, ExplainArgs, Format, InitConfigArgs, RunArgs};
pub use error::CliError;
pub use output::OutputFormat;
