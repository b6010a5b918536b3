//! CLI command implementations.
//!
//! Each submodule implements a specific CLI command:
//! - [`run`] - Bootstrap a device, build the program and dispatch once
//! - [`explain`] - Status code translation
//! - [`init_config`] - Sample configuration file

pub mod explain;
pub mod init_config;
pub mod run;

pub use explain::ExplainCommand;
pub use init_config::InitConfigCommand;
pub use run::RunCommand;
