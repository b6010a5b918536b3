//! Output formatting for CLI commands.
//!
//! Supports table (human-readable) and JSON output formats. Failure
//! diagnostics are plain lines, independent of the format.

use std::io::{self, Write};
use std::path::PathBuf;

use serde::Serialize;

use clboot::{BootError, RunReport, StatusCode};

use crate::cli::Format;
use crate::error::CliError;

/// Output formatter that handles both table and JSON output.
#[derive(Debug, Clone)]
pub struct OutputFormat {
    format: Format,
}

impl OutputFormat {
    /// Create a new output formatter.
    #[must_use]
    pub const fn new(format: Format) -> Self {
        Self { format }
    }

    /// Write a serializable value to the output.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn write<W, T>(&self, writer: &mut W, value: &T) -> Result<(), CliError>
    where
        W: Write,
        T: Serialize + TableDisplay,
    {
        match self.format {
            Format::Json => {
                serde_json::to_writer_pretty(&mut *writer, value)
                    .map_err(|e| CliError::Format(format!("JSON serialization failed: {e}")))?;
                writeln!(writer)?;
            }
            Format::Table => {
                value.write_table(writer)?;
            }
        }
        Ok(())
    }

    /// Write a serializable value to a string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_string<T>(&self, value: &T) -> Result<String, CliError>
    where
        T: Serialize + TableDisplay,
    {
        let mut buf = Vec::new();
        self.write(&mut buf, value)?;
        String::from_utf8(buf).map_err(|e| CliError::Format(format!("UTF-8 error: {e}")))
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::new(Format::Table)
    }
}

/// Trait for types that can be displayed as a table.
pub trait TableDisplay {
    /// Write the value as a human-readable table.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError>;
}

impl TableDisplay for RunReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Run Complete")?;
        writeln!(writer, "══════════════════════════════════")?;
        writeln!(writer, "Platform:      {}", self.platform)?;
        writeln!(writer, "Device:        {}", self.device)?;
        writeln!(writer, "Program:       {}", self.program)?;
        writeln!(writer, "Kernel:        {}", self.kernel)?;
        writeln!(writer, "Global size:   {}", self.global_work_size)?;
        Ok(())
    }
}

/// One status code and its label.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusExplanation {
    /// Raw code.
    pub code: i32,
    /// Stable label.
    pub label: &'static str,
    /// Whether the code is in the known table.
    pub known: bool,
}

impl From<StatusCode> for StatusExplanation {
    fn from(status: StatusCode) -> Self {
        Self {
            code: status.raw(),
            label: status.label(),
            known: status.is_known(),
        }
    }
}

impl TableDisplay for StatusExplanation {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "{:>6}  {}", self.code, self.label)?;
        Ok(())
    }
}

/// Every known status code.
#[derive(Debug, Clone, Serialize)]
pub struct StatusTable {
    /// Codes in table order.
    pub codes: Vec<StatusExplanation>,
}

impl TableDisplay for StatusTable {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "{:>6}  LABEL", "CODE")?;
        for entry in &self.codes {
            entry.write_table(writer)?;
        }
        Ok(())
    }
}

/// Result of writing a configuration file.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigWritten {
    /// Path written.
    pub path: PathBuf,
}

impl TableDisplay for ConfigWritten {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Wrote sample configuration to {}", self.path.display())?;
        Ok(())
    }
}

/// Write the diagnostic lines for a failed bootstrap.
///
/// Returns `false` if `err` carries no device diagnostics, in which case
/// nothing is written.
///
/// # Errors
///
/// Returns an error if writing fails.
pub fn write_diagnostic<W: Write>(writer: &mut W, err: &BootError) -> io::Result<bool> {
    match err {
        BootError::DeviceApi { operation, status } => {
            writeln!(writer, "Error {operation} -> {}", status.label())?;
        }
        BootError::Compile { module, log, .. } => {
            writeln!(writer, "Failed to compile {module}:")?;
            write_log(writer, log)?;
        }
        BootError::Link { log, .. } => {
            writeln!(writer, "Failed to link program:")?;
            write_log(writer, log)?;
        }
        BootError::Build { status, log, .. } => {
            writeln!(writer, "Failed to build {}", status.label())?;
            write_log(writer, log)?;
        }
        _ => return Ok(false),
    }
    Ok(true)
}

fn write_log<W: Write>(writer: &mut W, log: &str) -> io::Result<()> {
    writer.write_all(log.as_bytes())?;
    if !log.ends_with('\n') {
        writeln!(writer)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clboot::{Operation, ProgramOrigin};

    fn render(err: &BootError) -> String {
        let mut buf = Vec::new();
        let written = write_diagnostic(&mut buf, err).expect("write");
        assert!(written);
        String::from_utf8(buf).expect("utf8")
    }

    #[test]
    fn device_api_diagnostic_line() {
        let err = BootError::device(Operation::CreateContext, StatusCode::OUT_OF_HOST_MEMORY);
        assert_eq!(render(&err), "Error clCreateContext -> CL_OUT_OF_HOST_MEMORY\n");
    }

    #[test]
    fn compile_diagnostic_includes_log() {
        let err = BootError::Compile {
            module: "util.cl".into(),
            status: StatusCode::COMPILE_PROGRAM_FAILURE,
            log: "util.cl:3:1: error: oops".into(),
        };
        assert_eq!(render(&err), "Failed to compile util.cl:\nutil.cl:3:1: error: oops\n");
    }

    #[test]
    fn build_diagnostic_names_status() {
        let err = BootError::Build {
            source_ref: "main.cl".into(),
            status: StatusCode::BUILD_PROGRAM_FAILURE,
            log: "line\n".into(),
        };
        assert_eq!(render(&err), "Failed to build CL_BUILD_PROGRAM_FAILURE\nline\n");
    }

    #[test]
    fn link_diagnostic_with_empty_log() {
        let err = BootError::Link {
            status: StatusCode::LINK_PROGRAM_FAILURE,
            log: String::new(),
        };
        assert_eq!(render(&err), "Failed to link program:\n\n");
    }

    #[test]
    fn config_errors_have_no_diagnostic() {
        let mut buf = Vec::new();
        let written = write_diagnostic(&mut buf, &BootError::Config("x".into())).expect("write");
        assert!(!written);
        assert!(buf.is_empty());
    }

    #[test]
    fn run_report_table() {
        let report = RunReport {
            platform: "P".into(),
            device: "D".into(),
            program: ProgramOrigin::Built {
                source_ref: "main.cl".into(),
            },
            kernel: "cl_main".into(),
            global_work_size: 1,
        };
        let out = OutputFormat::default().to_string(&report).expect("table");
        assert!(out.contains("Device:        D"));
        assert!(out.contains("built from main.cl"));
    }

    #[test]
    fn status_explanation_json() {
        let format = OutputFormat::new(Format::Json);
        let out = format
            .to_string(&StatusExplanation::from(StatusCode::new(-11)))
            .expect("json");
        let value: serde_json::Value = serde_json::from_str(&out).expect("parse");
        assert_eq!(value["label"], "CL_BUILD_PROGRAM_FAILURE");
        assert_eq!(value["known"], true);
    }
}
