//! Init-config command implementation.

use std::io::Write;

use tracing::info;

use clboot::BootConfig;

use crate::cli::InitConfigArgs;
use crate::error::CliError;
use crate::output::{ConfigWritten, OutputFormat};

/// Init-config command executor.
#[derive(Debug, Default)]
pub struct InitConfigCommand;

impl InitConfigCommand {
    /// Create a new init-config command.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Write [`BootConfig::sample`] to the requested path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists and `--force` was not given, or
    /// if writing fails.
    pub fn execute<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        args: &InitConfigArgs,
    ) -> Result<(), CliError> {
        if args.output.exists() && !args.force {
            return Err(CliError::InvalidArgument(format!(
                "{} already exists (use --force to overwrite)",
                args.output.display()
            )));
        }

        BootConfig::sample().save(&args.output)?;
        info!(path = %args.output.display(), "sample configuration written");

        format.write(
            writer,
            &ConfigWritten {
                path: args.output.clone(),
            },
        )
    }
}
