//! Bootstrap configuration.
//!
//! Configuration is a JSON document; every field is optional and falls back to
//! the defaults of a plain single-module run:
//!
//! ```json
//! {
//!   "kernel_dir": ".",
//!   "entry_module": "main.cl",
//!   "build_options": "-cl-std=CL2.0",
//!   "kernel_name": "cl_main"
//! }
//! ```
//!
//! A non-empty `modules` list selects the compile-and-link path instead of the
//! single-module build.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::compiler::include_directive;
use crate::device::DeviceType;
use crate::diagnostics::LOG_CAPACITY;
use crate::error::{BootError, Result};

/// Module built by the single-module path.
pub const DEFAULT_ENTRY_MODULE: &str = "main.cl";

/// Options for the single-module build.
pub const DEFAULT_BUILD_OPTIONS: &str = "-cl-std=CL2.0";

/// Entry point launched after the program is built.
pub const DEFAULT_KERNEL_NAME: &str = "cl_main";

/// Configuration for one bootstrap run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BootConfig {
    /// Directory holding the kernel source modules.
    pub kernel_dir: PathBuf,
    /// Module for the single-module build.
    pub entry_module: String,
    /// Options for the single-module build.
    pub build_options: String,
    /// Modules to compile and link, in order. Empty selects the single-module build.
    pub modules: Vec<String>,
    /// Options for compiling each module.
    pub compile_options: String,
    /// Options for linking.
    pub link_options: String,
    /// Entry point to launch.
    pub kernel_name: String,
    /// One-dimensional global work size of the launch.
    pub global_work_size: usize,
    /// Size in bytes of the buffer bound at argument 0.
    pub arg_buffer_size: usize,
    /// Device type to select.
    pub device_type: DeviceType,
    /// Upper bound on reported build logs, in bytes.
    pub log_capacity: usize,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            kernel_dir: PathBuf::from("."),
            entry_module: DEFAULT_ENTRY_MODULE.to_string(),
            build_options: DEFAULT_BUILD_OPTIONS.to_string(),
            modules: Vec::new(),
            compile_options: String::new(),
            link_options: String::new(),
            kernel_name: DEFAULT_KERNEL_NAME.to_string(),
            global_work_size: 1,
            arg_buffer_size: 1,
            device_type: DeviceType::All,
            log_capacity: LOG_CAPACITY,
        }
    }
}

impl BootConfig {
    /// Load and validate configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BootError::Config(format!("failed to read config file '{}': {e}", path.display()))
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration from a JSON string.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| BootError::Config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| BootError::Config(format!("failed to serialize config: {e}")))
    }

    /// Write the configuration to `path` as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut json = self.to_json()?;
        json.push('\n');
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Starting point for a new configuration file, using the multi-module layout.
    #[must_use]
    pub fn sample() -> Self {
        Self {
            kernel_dir: PathBuf::from("kernels"),
            modules: vec!["mathlib.cl".to_string(), "util.cl".to_string(), "main.cl".to_string()],
            ..Self::default()
        }
    }

    /// Whether the run compiles and links several modules.
    #[must_use]
    pub fn is_multi_module(&self) -> bool {
        !self.modules.is_empty()
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is unusable.
    pub fn validate(&self) -> Result<()> {
        if self.modules.is_empty() {
            include_directive(&self.entry_module)
                .map_err(|_| BootError::Config(format!("invalid entry_module {:?}", self.entry_module)))?;
        }
        for module in &self.modules {
            include_directive(module).map_err(|_| BootError::Config(format!("invalid module name {module:?}")))?;
        }

        if self.kernel_name.is_empty() {
            return Err(BootError::Config("kernel_name cannot be empty".to_string()));
        }

        if !self
            .kernel_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(BootError::Config(format!(
                "kernel_name {:?} is not a valid identifier",
                self.kernel_name
            )));
        }

        if self.global_work_size == 0 {
            return Err(BootError::Config("global_work_size must be greater than 0".to_string()));
        }

        if self.arg_buffer_size == 0 {
            return Err(BootError::Config("arg_buffer_size must be greater than 0".to_string()));
        }

        if self.log_capacity == 0 {
            return Err(BootError::Config("log_capacity must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn defaults_match_single_module_run() {
        let config = BootConfig::default();
        assert_eq!(config.entry_module, "main.cl");
        assert_eq!(config.build_options, "-cl-std=CL2.0");
        assert_eq!(config.kernel_name, "cl_main");
        assert_eq!(config.global_work_size, 1);
        assert_eq!(config.arg_buffer_size, 1);
        assert_eq!(config.device_type, DeviceType::All);
        assert_eq!(config.log_capacity, 2048);
        assert!(!config.is_multi_module());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_partial_config_applies_defaults() {
        let config = BootConfig::from_json(r#"{ "modules": ["a.cl", "b.cl"], "device_type": "gpu" }"#)
            .expect("should parse");
        assert_eq!(config.modules, ["a.cl", "b.cl"]);
        assert_eq!(config.device_type, DeviceType::Gpu);
        assert_eq!(config.kernel_name, "cl_main");
        assert!(config.is_multi_module());
    }

    #[test]
    fn parse_empty_object() {
        let config = BootConfig::from_json("{}").expect("should parse");
        assert_eq!(config, BootConfig::default());
    }

    #[test]
    fn invalid_json_is_config_error() {
        let err = BootConfig::from_json("{ not json").expect_err("should fail");
        assert!(matches!(err, BootError::Config(ref m) if m.starts_with("invalid JSON")));
    }

    #[test]
    fn unknown_device_type_rejected() {
        assert!(BootConfig::from_json(r#"{ "device_type": "fpga" }"#).is_err());
    }

    #[test_case(r#"{ "global_work_size": 0 }"#; "zero global size")]
    #[test_case(r#"{ "arg_buffer_size": 0 }"#; "zero buffer")]
    #[test_case(r#"{ "log_capacity": 0 }"#; "zero log capacity")]
    #[test_case(r#"{ "kernel_name": "" }"#; "empty kernel name")]
    #[test_case(r#"{ "kernel_name": "cl-main" }"#; "kernel name with dash")]
    #[test_case(r#"{ "entry_module": "" }"#; "empty entry module")]
    #[test_case(r#"{ "modules": ["ok.cl", "bad\".cl"] }"#; "quote in module")]
    fn validation_rejects(json: &str) {
        let err = BootConfig::from_json(json).expect_err("should be rejected");
        assert!(matches!(err, BootError::Config(_)), "got {err}");
    }

    #[test]
    fn entry_module_unchecked_when_linking() {
        let config = BootConfig {
            entry_module: String::new(),
            modules: vec!["main.cl".into()],
            ..BootConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clboot.json");
        let config = BootConfig::sample();
        config.save(&path).expect("save");

        let loaded = BootConfig::load(&path).expect("load");
        assert_eq!(loaded, config);
        assert_eq!(loaded.modules, ["mathlib.cl", "util.cl", "main.cl"]);
    }

    #[test]
    fn load_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = BootConfig::load(dir.path().join("missing.json")).expect_err("missing");
        assert!(err.to_string().contains("failed to read config file"));
    }
}
