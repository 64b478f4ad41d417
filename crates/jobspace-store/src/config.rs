//! Project configuration.
//!
//! A read-only key-value provider backed by a `jobspace.rc` file of
//! `key=value` lines. The only setting the storage layer itself depends on
//! is `workspace_dir`, which supports environment-variable expansion and
//! resolves relative to the project root.

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;

use crate::{fsutil, StoreError};

#[derive(Debug, Clone, Default)]
pub struct ProjectConfig {
    values: BTreeMap<String, String>,
}

impl ProjectConfig {
    /// Load the configuration file at `path`. `None` when it does not
    /// exist.
    pub fn load(path: &Path) -> Result<Option<Self>, StoreError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::workspace(path)(err)),
        };
        let mut values = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim().to_owned(), value.trim().to_owned());
            }
        }
        Ok(Some(Self { values }))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub(crate) fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub(crate) fn write(&self, path: &Path) -> Result<(), StoreError> {
        let mut text = String::new();
        for (key, value) in &self.values {
            text.push_str(key);
            text.push('=');
            text.push_str(value);
            text.push('\n');
        }
        fsutil::write_atomic(path, text.as_bytes())
    }
}

/// Expand `$VAR` and `${VAR}` references from the process environment.
/// Unknown variables are left as written.
pub fn expand_env(input: &str) -> String {
    let pattern = Regex::new(r"\$\{([^}]+)\}|\$(\w+)").expect("static pattern");
    pattern
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            std::env::var(name).unwrap_or_else(|_| caps[0].to_owned())
        })
        .into_owned()
}
