//! Run command implementation.
//!
//! Loads kernel sources, walks the bootstrap chain on the in-process
//! simulated device (no accelerator is contacted) and prints the report.

use std::io::Write;

use tracing::{debug, info};

use clboot::{BootConfig, SimulatedDevice, SourceModules};

use crate::cli::RunArgs;
use crate::error::CliError;
use crate::output::OutputFormat;

/// Run command executor.
#[derive(Debug, Default)]
pub struct RunCommand;

impl RunCommand {
    /// Create a new run command.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Execute the run command.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the sources cannot
    /// be loaded, or any bootstrap step fails.
    pub fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat, args: &RunArgs) -> Result<(), CliError> {
        let config = args.resolve()?;
        self.execute_config(writer, format, &config)
    }

    /// Execute with an already resolved configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the sources cannot be loaded or any bootstrap
    /// step fails.
    pub fn execute_config<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        config: &BootConfig,
    ) -> Result<(), CliError> {
        let sources = SourceModules::from_dir(&config.kernel_dir)?;
        debug!(
            dir = %config.kernel_dir.display(),
            modules = sources.len(),
            "kernel sources loaded"
        );

        let api = SimulatedDevice::new(sources);
        let report = clboot::run(&api, config)?;
        info!(device = %report.device, "dispatch finished");

        format.write(writer, &report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Format;
    use std::path::PathBuf;

    fn kernel_dir(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        for (name, text) in files {
            std::fs::write(dir.path().join(name), text).expect("write source");
        }
        dir
    }

    #[test]
    fn run_single_module_json() {
        let dir = kernel_dir(&[("main.cl", "__kernel void cl_main(__global char* p) { p[0] = 1; }")]);
        let config = BootConfig {
            kernel_dir: dir.path().to_path_buf(),
            ..BootConfig::default()
        };

        let mut out = Vec::new();
        RunCommand::new()
            .execute_config(&mut out, &OutputFormat::new(Format::Json), &config)
            .expect("run");

        let value: serde_json::Value = serde_json::from_slice(&out).expect("json");
        assert_eq!(value["kernel"], "cl_main");
        assert_eq!(value["program"]["kind"], "built");
    }

    #[test]
    fn run_linked_modules_table() {
        let dir = kernel_dir(&[
            ("util.cl", "int twice(int x) { return 2 * x; }"),
            ("main.cl", "__kernel void cl_main(__global char* p) { p[0] = 1; }"),
        ]);
        let config = BootConfig {
            kernel_dir: dir.path().to_path_buf(),
            modules: vec!["util.cl".into(), "main.cl".into()],
            ..BootConfig::default()
        };

        let mut out = Vec::new();
        RunCommand::new()
            .execute_config(&mut out, &OutputFormat::default(), &config)
            .expect("run");

        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("linked from util.cl, main.cl"));
    }

    #[test]
    fn run_missing_kernel_dir_is_usage_error() {
        let config = BootConfig {
            kernel_dir: PathBuf::from("/nonexistent/clboot-kernels"),
            ..BootConfig::default()
        };
        let err = RunCommand::new()
            .execute_config(&mut Vec::new(), &OutputFormat::default(), &config)
            .expect_err("missing dir");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn run_build_failure_exit_status() {
        let dir = kernel_dir(&[("main.cl", "#error broken\n__kernel void cl_main(__global char* p) {}")]);
        let config = BootConfig {
            kernel_dir: dir.path().to_path_buf(),
            ..BootConfig::default()
        };
        let err = RunCommand::new()
            .execute_config(&mut Vec::new(), &OutputFormat::default(), &config)
            .expect_err("build fails");
        assert_eq!(err.exit_code(), 100);
    }
}
