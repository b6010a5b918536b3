//! Kernel source modules, keyed by the name used in `#include` directives.
//!
//! The lifecycle core only ever handles module *names*. Resolving a name to
//! text is the job of whoever implements the device API; the simulated device
//! reads from a [`SourceModules`] set.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use crate::error::{BootError, Result};

/// File extension picked up by [`SourceModules::from_dir`].
pub const SOURCE_EXTENSION: &str = "cl";

/// A named set of kernel source modules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceModules {
    modules: BTreeMap<String, String>,
}

impl SourceModules {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module, returning the set.
    #[must_use]
    pub fn with_module(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.insert(name, text);
        self
    }

    /// Add or replace a module.
    pub fn insert(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.modules.insert(name.into(), text.into());
    }

    /// Text of the module `name`, if present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.modules.get(name).map(String::as_str)
    }

    /// Whether the module `name` is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Module names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Number of modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Load every `*.cl` file directly inside `dir`, keyed by file name.
    ///
    /// Subdirectories are not searched.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(BootError::Config(format!(
                "kernel directory '{}' does not exist",
                dir.display()
            )));
        }

        let mut modules = Self::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != SOURCE_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let text = std::fs::read_to_string(&path)?;
            debug!(module = name, bytes = text.len(), "loaded kernel source");
            modules.insert(name, text);
        }
        Ok(modules)
    }
}

impl<N: Into<String>, T: Into<String>> FromIterator<(N, T)> for SourceModules {
    fn from_iter<I: IntoIterator<Item = (N, T)>>(iter: I) -> Self {
        let mut modules = Self::new();
        for (name, text) in iter {
            modules.insert(name, text);
        }
        modules
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let modules = SourceModules::new()
            .with_module("main.cl", "__kernel void cl_main(__global char* p) {}")
            .with_module("util.cl", "");
        assert_eq!(modules.len(), 2);
        assert!(modules.contains("util.cl"));
        assert!(modules.get("main.cl").is_some_and(|t| t.contains("cl_main")));
        assert!(modules.get("missing.cl").is_none());
    }

    #[test]
    fn names_are_sorted() {
        let modules: SourceModules = [("b.cl", ""), ("a.cl", ""), ("c.cl", "")].into_iter().collect();
        let names: Vec<&str> = modules.names().collect();
        assert_eq!(names, ["a.cl", "b.cl", "c.cl"]);
    }

    #[test]
    fn from_dir_loads_only_cl_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("main.cl"), "// main").expect("write");
        std::fs::write(dir.path().join("util.cl"), "// util").expect("write");
        std::fs::write(dir.path().join("README.md"), "docs").expect("write");
        std::fs::create_dir(dir.path().join("nested.cl")).expect("mkdir");

        let modules = SourceModules::from_dir(dir.path()).expect("load");
        assert_eq!(modules.len(), 2);
        assert_eq!(modules.get("main.cl"), Some("// main"));
        assert!(!modules.contains("README.md"));
    }

    #[test]
    fn from_dir_missing_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = SourceModules::from_dir(dir.path().join("nope"));
        assert!(matches!(result, Err(BootError::Config(_))));
    }
}
