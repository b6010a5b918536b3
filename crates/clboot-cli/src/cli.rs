//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use clboot::{BootConfig, DeviceType};

use crate::error::CliError;

/// clboot - bootstrap a simulated compute device, build kernels, dispatch once.
#[derive(Parser, Debug, Clone)]
#[command(name = "clboot")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Table, global = true)]
    pub format: Format,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum Format {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON output for scripting.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Acquire the simulated device, build the program, dispatch the kernel once and release.
    ///
    /// Runs against the in-process simulated device; no accelerator is contacted.
    Run(RunArgs),

    /// Translate a device status code into its label.
    Explain(ExplainArgs),

    /// Write a sample configuration file.
    InitConfig(InitConfigArgs),
}

/// Arguments for `run`. Flags override values from the configuration file.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Configuration file (JSON).
    #[arg(short, long, env = "CLBOOT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory containing the `.cl` source modules.
    #[arg(short = 'd', long)]
    pub kernel_dir: Option<PathBuf>,

    /// Module to compile and link; repeat to link several, in order.
    #[arg(short, long = "module", value_name = "MODULE")]
    pub modules: Vec<String>,

    /// Module for the single-module build.
    #[arg(long)]
    pub entry_module: Option<String>,

    /// Entry point to launch.
    #[arg(short, long)]
    pub kernel: Option<String>,

    /// Options for the single-module build.
    #[arg(long, allow_hyphen_values = true)]
    pub build_options: Option<String>,

    /// Options for compiling each module.
    #[arg(long, allow_hyphen_values = true)]
    pub compile_options: Option<String>,

    /// Options for linking.
    #[arg(long, allow_hyphen_values = true)]
    pub link_options: Option<String>,

    /// Global work size of the launch.
    #[arg(short, long)]
    pub global_size: Option<usize>,

    /// Device type to select (all, default, cpu, gpu, accelerator).
    #[arg(long)]
    pub device_type: Option<DeviceType>,
}

impl RunArgs {
    /// Build the effective configuration: file (or defaults), then flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or the result is invalid.
    pub fn resolve(&self) -> Result<BootConfig, CliError> {
        let mut config = match &self.config {
            Some(path) => BootConfig::load(path)?,
            None => BootConfig::default(),
        };

        if let Some(dir) = &self.kernel_dir {
            config.kernel_dir.clone_from(dir);
        }
        if !self.modules.is_empty() {
            config.modules.clone_from(&self.modules);
        }
        if let Some(module) = &self.entry_module {
            config.entry_module.clone_from(module);
        }
        if let Some(kernel) = &self.kernel {
            config.kernel_name.clone_from(kernel);
        }
        if let Some(options) = &self.build_options {
            config.build_options.clone_from(options);
        }
        if let Some(options) = &self.compile_options {
            config.compile_options.clone_from(options);
        }
        if let Some(options) = &self.link_options {
            config.link_options.clone_from(options);
        }
        if let Some(size) = self.global_size {
            config.global_work_size = size;
        }
        if let Some(device_type) = self.device_type {
            config.device_type = device_type;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Arguments for `explain`.
#[derive(Args, Debug, Clone)]
pub struct ExplainArgs {
    /// Status code, e.g. -11.
    #[arg(allow_negative_numbers = true, required_unless_present = "all")]
    pub code: Option<i32>,

    /// List every known status code.
    #[arg(long, conflicts_with = "code")]
    pub all: bool,
}

/// Arguments for `init-config`.
#[derive(Args, Debug, Clone)]
pub struct InitConfigArgs {
    /// Where to write the configuration.
    #[arg(short, long, default_value = "clboot.json")]
    pub output: PathBuf,

    /// Overwrite an existing file.
    #[arg(long)]
    pub force: bool,
}
