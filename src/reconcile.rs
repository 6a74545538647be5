//! Deciding the final outcome of a test case.
//!
//! The test case's own claim (its results file) is checked against what the
//! operating system observed (exit code or terminating signal). Claims that
//! contradict the observed status are turned into failures.

use std::fmt;

use crate::process::ExitStatus;
use crate::results::{DeclaredResult, ResultFileError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestState {
    Passed,
    Failed,
    Skipped,
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// The terminal classification of a test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub state: TestState,
    pub reason: String,
    /// For passes that confirm an `expected_*` declaration, its state name.
    pub expectation: Option<&'static str>,
}

impl Outcome {
    pub fn passed() -> Self {
        Self {
            state: TestState::Passed,
            reason: String::new(),
            expectation: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: TestState::Failed,
            reason: reason.into(),
            expectation: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            state: TestState::Skipped,
            reason: reason.into(),
            expectation: None,
        }
    }

    /// A pass that honors what the test case said it expected.
    pub fn confirmed(declared: &DeclaredResult) -> Self {
        Self {
            state: TestState::Passed,
            reason: declared.reason().to_string(),
            expectation: Some(declared.state()),
        }
    }

    /// The state as reported to result consumers: the confirmed expectation
    /// if there is one, otherwise the plain state.
    pub fn reported_state(&self) -> String {
        match self.expectation {
            Some(expectation) => expectation.to_string(),
            None => self.state.to_string(),
        }
    }
}

fn describe(value: Option<i32>) -> String {
    value.map_or_else(|| "any".to_string(), |v| v.to_string())
}

/// Classifies a finished test case.
///
/// `declared` is the outcome of reading the results file, `status` how the
/// process terminated, and `timeout_reason` is set when the runner had to
/// kill the test case. A timeout overrides everything except a declared
/// `expected_timeout`.
pub fn reconcile(
    declared: &Result<DeclaredResult, ResultFileError>,
    status: ExitStatus,
    timeout_reason: Option<&str>,
) -> Outcome {
    if let Some(timeout_reason) = timeout_reason {
        return match declared {
            Ok(expected @ DeclaredResult::ExpectedTimeout { .. }) => Outcome::confirmed(expected),
            _ => Outcome::failed(timeout_reason),
        };
    }

    match status {
        ExitStatus::Exited(code) => reconcile_exit(declared, code),
        ExitStatus::Signaled { signo, core_dumped } => reconcile_signal(declared, signo, core_dumped),
    }
}

fn reconcile_exit(declared: &Result<DeclaredResult, ResultFileError>, code: i32) -> Outcome {
    let declared = match declared {
        Ok(declared) => declared,
        Err(ResultFileError::Missing) if code == 0 => {
            return Outcome::failed("Test case exited normally but failed to create the results file")
        }
        Err(ResultFileError::Missing) => {
            return Outcome::failed(format!(
                "Test case exited with code {code} but failed to create the results file"
            ))
        }
        Err(e) => {
            return Outcome::failed(format!(
                "Test case exited with code {code} but wrote an invalid results file: {e}"
            ))
        }
    };

    match declared {
        DeclaredResult::Passed if code == 0 => Outcome::passed(),
        DeclaredResult::Passed => Outcome::failed(format!(
            "Test case exited with error code {code} but reported success"
        )),
        DeclaredResult::Failed { .. } if code == 0 => {
            Outcome::failed("Test case exited successfully but reported failure")
        }
        DeclaredResult::Failed { reason } => Outcome::failed(reason.clone()),
        DeclaredResult::Skipped { reason } if code == 0 => Outcome::skipped(reason.clone()),
        DeclaredResult::Skipped { .. } => Outcome::failed(format!(
            "Test case exited with error code {code} but reported skipped"
        )),
        DeclaredResult::ExpectedDeath { .. } | DeclaredResult::ExpectedTimeout { .. } => {
            Outcome::confirmed(declared)
        }
        DeclaredResult::ExpectedExit { code: expected, .. } => {
            if expected.map_or(true, |expected| expected == code) {
                Outcome::confirmed(declared)
            } else {
                Outcome::failed(format!(
                    "Test case was expected to exit with code {} but returned {code}",
                    describe(*expected)
                ))
            }
        }
        // A successful exit is what confirms an expected failure: the test
        // case recorded the failure itself and then exited cleanly.
        DeclaredResult::ExpectedFailure { .. } if code == 0 => Outcome::confirmed(declared),
        DeclaredResult::ExpectedFailure { .. } => Outcome::failed(format!(
            "Test case expected a failure but exited with error code {code}"
        )),
        DeclaredResult::ExpectedSignal { signo, .. } => Outcome::failed(format!(
            "Test case expected to receive signal {} but exited with code {code}",
            describe(*signo)
        )),
    }
}

fn reconcile_signal(
    declared: &Result<DeclaredResult, ResultFileError>,
    signo: i32,
    core_dumped: bool,
) -> Outcome {
    let received = format!(
        "received signal {signo}{}",
        if core_dumped { " (core dumped)" } else { "" }
    );

    let declared = match declared {
        Ok(declared) => declared,
        Err(ResultFileError::Missing) => return Outcome::failed(format!("Test program {received}")),
        Err(e) => {
            return Outcome::failed(format!(
                "Test program {received} and left an invalid results file: {e}"
            ))
        }
    };

    match declared {
        DeclaredResult::ExpectedDeath { .. } | DeclaredResult::ExpectedTimeout { .. } => {
            Outcome::confirmed(declared)
        }
        DeclaredResult::ExpectedSignal { signo: expected, .. } => {
            if expected.map_or(true, |expected| expected == signo) {
                Outcome::confirmed(declared)
            } else {
                Outcome::failed(format!(
                    "Test case expected to receive signal {} but got {signo}",
                    describe(*expected)
                ))
            }
        }
        DeclaredResult::ExpectedExit { code, .. } => Outcome::failed(format!(
            "Test case expected to exit with code {} but {received}",
            describe(*code)
        )),
        _ => Outcome::failed(format!("Test program {received} after reporting its result")),
    }
}
