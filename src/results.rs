//! The results file a test case writes to report what it believes happened.
//!
//! The file holds a single line, `<state>[(<arg>)][: <reason>]`, such as
//! `passed`, `skipped: requires network` or `expected_exit(3): known bug`.

use std::fmt;
use std::io::ErrorKind;
use std::path::Path;

use thiserror::Error;

/// Marker inserted where a results file unexpectedly continued on a new line.
pub const NEWLINE_MARKER: &str = "<<NEWLINE UNEXPECTED>>";

/// What the test case declared about itself.
///
/// `None` in the integer arguments means any exit code or signal is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclaredResult {
    Passed,
    Failed { reason: String },
    Skipped { reason: String },
    ExpectedDeath { reason: String },
    ExpectedExit { code: Option<i32>, reason: String },
    ExpectedFailure { reason: String },
    ExpectedSignal { signo: Option<i32>, reason: String },
    ExpectedTimeout { reason: String },
}

impl DeclaredResult {
    /// The state keyword as written in the results file.
    pub fn state(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
            Self::ExpectedDeath { .. } => "expected_death",
            Self::ExpectedExit { .. } => "expected_exit",
            Self::ExpectedFailure { .. } => "expected_failure",
            Self::ExpectedSignal { .. } => "expected_signal",
            Self::ExpectedTimeout { .. } => "expected_timeout",
        }
    }

    /// The declared reason; empty for `passed`.
    pub fn reason(&self) -> &str {
        match self {
            Self::Passed => "",
            Self::Failed { reason }
            | Self::Skipped { reason }
            | Self::ExpectedDeath { reason }
            | Self::ExpectedExit { reason, .. }
            | Self::ExpectedFailure { reason }
            | Self::ExpectedSignal { reason, .. }
            | Self::ExpectedTimeout { reason } => reason,
        }
    }

    /// Parses the (already folded) contents of a results file.
    pub fn parse(line: &str) -> Result<Self, ResultFileError> {
        let (head, reason) = match line.find(':') {
            Some(pos) => {
                let rest = &line[pos + 1..];
                let reason = rest.strip_prefix(' ').ok_or_else(|| {
                    ResultFileError::Malformed(format!("missing space after ':' in '{line}'"))
                })?;
                (&line[..pos], Some(reason))
            }
            None => (line, None),
        };

        let (state, arg) = match head.find('(') {
            Some(pos) => {
                let arg = head[pos + 1..].strip_suffix(')').ok_or_else(|| {
                    ResultFileError::Malformed(format!("unterminated argument in '{head}'"))
                })?;
                (&head[..pos], Some(arg))
            }
            None => (head, None),
        };

        let reason = reason.unwrap_or("");
        let result = match state {
            "passed" => {
                if arg.is_some() || !reason.is_empty() {
                    return Err(ResultFileError::Malformed(
                        "'passed' takes no argument and no reason".to_string(),
                    ));
                }
                return Ok(Self::Passed);
            }
            "failed" => Self::Failed {
                reason: reason.to_string(),
            },
            "skipped" => Self::Skipped {
                reason: reason.to_string(),
            },
            "expected_death" => Self::ExpectedDeath {
                reason: reason.to_string(),
            },
            "expected_exit" => Self::ExpectedExit {
                code: parse_any_or_int(state, arg)?,
                reason: reason.to_string(),
            },
            "expected_failure" => Self::ExpectedFailure {
                reason: reason.to_string(),
            },
            "expected_signal" => Self::ExpectedSignal {
                signo: parse_any_or_int(state, arg)?,
                reason: reason.to_string(),
            },
            "expected_timeout" => Self::ExpectedTimeout {
                reason: reason.to_string(),
            },
            other => return Err(ResultFileError::UnknownState(other.to_string())),
        };

        if arg.is_some() && !matches!(result, Self::ExpectedExit { .. } | Self::ExpectedSignal { .. }) {
            return Err(ResultFileError::Malformed(format!("'{state}' takes no argument")));
        }
        if reason.is_empty() {
            return Err(ResultFileError::Malformed(format!("'{state}' requires a reason")));
        }
        Ok(result)
    }
}

impl fmt::Display for DeclaredResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::ExpectedExit { code: Some(code), reason } => {
                write!(f, "expected_exit({code}): {reason}")
            }
            Self::ExpectedSignal {
                signo: Some(signo),
                reason,
            } => write!(f, "expected_signal({signo}): {reason}"),
            other => write!(f, "{}: {}", other.state(), other.reason()),
        }
    }
}

fn parse_any_or_int(state: &str, arg: Option<&str>) -> Result<Option<i32>, ResultFileError> {
    match arg {
        None | Some("") => Ok(None),
        Some(text) => match text.parse::<i32>() {
            Ok(-1) => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(_) => Err(ResultFileError::Malformed(format!(
                "invalid argument '{text}' for '{state}'"
            ))),
        },
    }
}

/// Why a results file could not be turned into a [`DeclaredResult`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResultFileError {
    /// The test case never created the file.
    #[error("results file does not exist")]
    Missing,

    #[error("cannot read results file: {0}")]
    Unreadable(String),

    #[error("results file is empty")]
    Empty,

    /// The file continued past its first line. Carries the folded contents.
    #[error("results file has more than one line: {0}")]
    MultiLine(String),

    #[error("unknown test case state '{0}'")]
    UnknownState(String),

    #[error("invalid results file: {0}")]
    Malformed(String),
}

/// Reads and parses the results file at `path`.
///
/// Extra lines are a protocol violation: they are folded into the first one
/// with [`NEWLINE_MARKER`] and reported as [`ResultFileError::MultiLine`].
pub fn read_result_file(path: &Path) -> Result<DeclaredResult, ResultFileError> {
    let contents = match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(ResultFileError::Missing),
        Err(e) => return Err(ResultFileError::Unreadable(e.to_string())),
    };

    let mut lines = contents.lines();
    let first = match lines.next() {
        Some(line) if !line.is_empty() => line,
        _ => return Err(ResultFileError::Empty),
    };

    let extra: Vec<&str> = lines.collect();
    if !extra.is_empty() {
        let mut folded = first.to_string();
        for line in extra {
            folded.push_str(NEWLINE_MARKER);
            folded.push_str(line);
        }
        return Err(ResultFileError::MultiLine(folded));
    }

    DeclaredResult::parse(first)
}
