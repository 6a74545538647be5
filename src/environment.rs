use std::collections::BTreeMap;
use std::ffi::CString;
use std::path::Path;

use crate::error::{HarnessError, Result};

/// Variable test programs inspect to learn they run under the harness.
pub const HARNESS_SENTINEL: &str = "__RUNNING_INSIDE_ATF_RUN";

/// Value of [`HARNESS_SENTINEL`] understood by the test libraries.
pub const HARNESS_SENTINEL_VALUE: &str = "internal-yes-value";

/// Locale variables stripped from the child environment, on top of any
/// other `LC_*` variable.
const LOCALE_VARIABLES: &[&str] = &[
    "LANG",
    "LC_ALL",
    "LC_COLLATE",
    "LC_CTYPE",
    "LC_MESSAGES",
    "LC_MONETARY",
    "LC_NUMERIC",
    "LC_TIME",
];

/// An environment variable set handed to a test case.
///
/// Uses `set` rather than `insert` to read like the environment operations
/// it stands for. Entries are kept sorted so the child sees a stable order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Captures the harness's own environment. Variables that are not valid
    /// UTF-8 are skipped.
    pub fn inherited() -> Self {
        Self(
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .collect(),
        )
    }

    /// Builds the sanitized environment a test case runs in.
    ///
    /// Starting from `base`: `HOME` points at the work directory, locale
    /// settings are cleared, `TZ` is fixed to UTC and the harness sentinel is
    /// set.
    ///
    /// # Examples
    /// ```
    /// use atf_harness::Environment;
    /// use std::path::Path;
    ///
    /// let mut base = Environment::new();
    /// base.set("LANG", "de_DE.UTF-8");
    /// base.set("PATH", "/usr/bin");
    ///
    /// let env = Environment::for_test_case(base, Path::new("/tmp/work"));
    /// assert_eq!(env.get("HOME").map(String::as_str), Some("/tmp/work"));
    /// assert_eq!(env.get("TZ").map(String::as_str), Some("UTC"));
    /// assert_eq!(env.get("LANG"), None);
    /// ```
    pub fn for_test_case(base: Environment, workdir: &Path) -> Self {
        let mut env = base;
        for name in LOCALE_VARIABLES {
            env.remove(name);
        }
        env.0.retain(|name, _| !name.starts_with("LC_"));
        env.set("HOME", workdir.to_string_lossy());
        env.set("TZ", "UTC");
        env.set(HARNESS_SENTINEL, HARNESS_SENTINEL_VALUE);
        env
    }

    /// Sets an environment variable in this set.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Removes a variable, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Renders the set as `KEY=value` C strings for `execve`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidArgument`] if a name or value contains
    /// an interior NUL byte or a name contains `=`.
    pub fn to_exec_entries(&self) -> Result<Vec<CString>> {
        self.0
            .iter()
            .map(|(key, value)| {
                if key.contains('=') {
                    return Err(HarnessError::InvalidArgument(format!(
                        "environment variable name '{key}' contains '='"
                    )));
                }
                CString::new(format!("{key}={value}")).map_err(|_| {
                    HarnessError::InvalidArgument(format!(
                        "environment variable '{key}' contains a NUL byte"
                    ))
                })
            })
            .collect()
    }
}
