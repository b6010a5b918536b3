//! clboot binary entrypoint.
//!
//! Exit status: 0 on success, 100 when the single-module build fails, 1 on
//! a compile or link failure, 2 on usage or configuration errors and 134
//! when any other device call fails.

use std::io::{self, Write};
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use clboot_cli::CliError;
use clboot_cli::cli::{Cli, Commands};
use clboot_cli::commands::{ExplainCommand, InitConfigCommand, RunCommand};
use clboot_cli::output::{OutputFormat, write_diagnostic};

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("clboot=info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let format = OutputFormat::new(cli.format);
    let mut stdout = io::stdout().lock();

    match cli.command {
        Commands::Run(args) => RunCommand::new().execute(&mut stdout, &format, &args)?,
        Commands::Explain(args) => ExplainCommand::new().execute(&mut stdout, &format, &args)?,
        Commands::InitConfig(args) => InitConfigCommand::new().execute(&mut stdout, &format, &args)?,
    }

    stdout.flush()?;
    Ok(())
}

/// Device diagnostics go to stdout; everything else is an error line on stderr.
fn report(err: &CliError) {
    if let CliError::Boot(boot) = err {
        let mut stdout = io::stdout().lock();
        if matches!(write_diagnostic(&mut stdout, boot), Ok(true)) {
            let _ = stdout.flush();
            return;
        }
    }
    eprintln!("Error: {err}");
}
