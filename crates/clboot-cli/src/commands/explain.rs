//! Explain command implementation.

use std::io::Write;

use clboot::StatusCode;
use clboot::status::KNOWN_CODES;

use crate::cli::ExplainArgs;
use crate::error::CliError;
use crate::output::{OutputFormat, StatusExplanation, StatusTable};

/// Explain command executor.
#[derive(Debug, Default)]
pub struct ExplainCommand;

impl ExplainCommand {
    /// Create a new explain command.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Execute the explain command.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails or no code was given.
    pub fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat, args: &ExplainArgs) -> Result<(), CliError> {
        if args.all {
            return format.write(writer, &Self::table());
        }
        let code = args
            .code
            .ok_or_else(|| CliError::InvalidArgument("a status code or --all is required".into()))?;
        format.write(writer, &StatusExplanation::from(StatusCode::new(code)))
    }

    /// Every known code, in table order.
    #[must_use]
    pub fn table() -> StatusTable {
        StatusTable {
            codes: KNOWN_CODES.iter().copied().map(StatusExplanation::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Format;
    use test_case::test_case;

    fn explain(code: i32) -> String {
        let args = ExplainArgs { code: Some(code), all: false };
        let mut out = Vec::new();
        ExplainCommand::new()
            .execute(&mut out, &OutputFormat::default(), &args)
            .expect("explain");
        String::from_utf8(out).expect("utf8")
    }

    #[test_case(0, "CL_SUCCESS" ; "success")]
    #[test_case(-11, "CL_BUILD_PROGRAM_FAILURE" ; "build failure")]
    #[test_case(-1001, "CL_PLATFORM_NOT_FOUND_KHR" ; "platform not found")]
    #[test_case(12345, "CL_UNKNOWN_ERROR" ; "unknown")]
    fn explain_prints_label(code: i32, label: &str) {
        let out = explain(code);
        assert!(out.contains(label), "{out}");
        assert!(out.contains(&code.to_string()));
    }

    #[test]
    fn explain_all_lists_every_known_code() {
        let args = ExplainArgs { code: None, all: true };
        let mut out = Vec::new();
        ExplainCommand::new()
            .execute(&mut out, &OutputFormat::new(Format::Json), &args)
            .expect("explain");
        let value: serde_json::Value = serde_json::from_slice(&out).expect("json");
        let codes = value["codes"].as_array().expect("codes array");
        assert_eq!(codes.len(), KNOWN_CODES.len());
        assert!(codes.iter().all(|c| c["known"] == true));
    }

    #[test]
    fn explain_without_code_is_invalid() {
        let args = ExplainArgs { code: None, all: false };
        let err = ExplainCommand::new()
            .execute(&mut Vec::new(), &OutputFormat::default(), &args)
            .expect_err("no code");
        assert!(matches!(err, CliError::InvalidArgument(_)));
    }
}
