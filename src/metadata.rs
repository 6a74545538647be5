//! Test case metadata, as listed by a test program run with `-l`.
//!
//! ```text
//! Content-Type: application/X-atf-tp; version="1"
//!
//! ident: first
//! descr: Checks the first thing
//! timeout: 30
//!
//! ident: second
//! has.cleanup: true
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

const LISTING_HEADER: &str = "Content-Type: application/X-atf-tp; version=\"1\"";

/// Timeout applied when a test case does not declare one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("cannot run test program: {0}")]
    Exec(String),

    #[error("test program failed to list its test cases ({0})")]
    ListFailed(String),

    #[error("missing or invalid application/X-atf-tp header: got '{0}'")]
    BadHeader(String),

    #[error("line {line}: expected 'name: value', got '{text}'")]
    Syntax { line: usize, text: String },

    #[error("line {line}: test case must start with an 'ident' property")]
    MissingIdent { line: usize },

    #[error("duplicate test case '{0}'")]
    DuplicateIdent(String),

    #[error("test case '{ident}': invalid value '{value}' for '{name}'")]
    InvalidValue {
        ident: String,
        name: String,
        value: String,
    },

    #[error("test program defines no test cases")]
    NoTestCases,
}

/// Properties of one test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCaseMetadata {
    ident: String,
    timeout: Duration,
    has_cleanup: bool,
    properties: BTreeMap<String, String>,
}

impl TestCaseMetadata {
    pub fn new(ident: impl Into<String>) -> Self {
        Self {
            ident: ident.into(),
            timeout: DEFAULT_TIMEOUT,
            has_cleanup: false,
            properties: BTreeMap::new(),
        }
    }

    /// Records a property, validating the ones the runner interprets.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), MetadataError> {
        let invalid = || MetadataError::InvalidValue {
            ident: self.ident.clone(),
            name: name.to_string(),
            value: value.to_string(),
        };
        match name {
            "timeout" => {
                let secs: u64 = value.parse().map_err(|_| invalid())?;
                self.timeout = Duration::from_secs(secs);
            }
            "has.cleanup" => self.has_cleanup = parse_bool(value).ok_or_else(invalid)?,
            "require.user" if !matches!(value, "root" | "unprivileged") => return Err(invalid()),
            _ => {}
        }
        self.properties.insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    /// Zero means the test case runs without a time limit.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn has_cleanup(&self) -> bool {
        self.has_cleanup
    }

    pub fn require_user(&self) -> Option<&str> {
        self.properties.get("require.user").map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" => Some(true),
        "false" | "no" => Some(false),
        _ => None,
    }
}

/// Parses the output of `<program> -l`.
pub fn parse_listing(text: &str) -> Result<Vec<TestCaseMetadata>, MetadataError> {
    let mut lines = text.lines().enumerate();

    match lines.next() {
        Some((_, header)) if header == LISTING_HEADER => {}
        Some((_, other)) => return Err(MetadataError::BadHeader(other.to_string())),
        None => return Err(MetadataError::BadHeader(String::new())),
    }
    match lines.next() {
        Some((_, "")) => {}
        Some((_, other)) => return Err(MetadataError::BadHeader(other.to_string())),
        None => return Err(MetadataError::NoTestCases),
    }

    let mut cases: Vec<TestCaseMetadata> = Vec::new();
    let mut current: Option<TestCaseMetadata> = None;
    for (index, line) in lines {
        let line_no = index + 1;
        if line.is_empty() {
            if let Some(done) = current.take() {
                push_case(&mut cases, done)?;
            }
            continue;
        }

        let (name, value) = split_property(line).ok_or_else(|| MetadataError::Syntax {
            line: line_no,
            text: line.to_string(),
        })?;
        match current.as_mut() {
            None if name == "ident" && !value.is_empty() => {
                current = Some(TestCaseMetadata::new(value));
            }
            None => return Err(MetadataError::MissingIdent { line: line_no }),
            Some(_) if name == "ident" => return Err(MetadataError::MissingIdent { line: line_no }),
            Some(case) => case.set(name, value)?,
        }
    }
    if let Some(done) = current.take() {
        push_case(&mut cases, done)?;
    }

    if cases.is_empty() {
        return Err(MetadataError::NoTestCases);
    }
    Ok(cases)
}

fn split_property(line: &str) -> Option<(&str, &str)> {
    let (name, value) = match line.split_once(": ") {
        Some(pair) => pair,
        None => (line.strip_suffix(':')?, ""),
    };
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    Some((name, value))
}

fn push_case(cases: &mut Vec<TestCaseMetadata>, case: TestCaseMetadata) -> Result<(), MetadataError> {
    if cases.iter().any(|c| c.ident == case.ident) {
        return Err(MetadataError::DuplicateIdent(case.ident));
    }
    cases.push(case);
    Ok(())
}

/// Runs `program -l` and parses its listing.
pub fn list_test_cases(program: &Path) -> Result<Vec<TestCaseMetadata>, MetadataError> {
    debug!(program = %program.display(), "listing test cases");
    let output = Command::new(program)
        .arg("-l")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| MetadataError::Exec(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = match stderr.lines().next() {
            Some(first) => format!("{}: {first}", output.status),
            None => output.status.to_string(),
        };
        return Err(MetadataError::ListFailed(detail));
    }
    parse_listing(&String::from_utf8_lossy(&output.stdout))
}
