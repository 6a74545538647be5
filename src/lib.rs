//! Supervised execution of ATF test programs.
//!
//! Each test case runs in its own forked process group with a sanitized
//! environment and a private work directory. Its output is captured line by
//! line, its run time is bounded by a timer that kills the whole group, and
//! the result it reports in its results file is cross-checked against how
//! the process actually terminated.
//!
//! The building blocks can be used on their own: [`run_test_case`] runs a
//! single phase of a test case and [`reconcile()`] classifies the result. The
//! [`Harness`] ties them together for whole test programs and reports
//! through an [`EventSink`] such as [`TpsWriter`].

pub mod environment;
pub mod error;
pub mod events;
pub mod harness;
pub mod metadata;
pub mod mux;
pub mod process;
pub mod reconcile;
pub mod results;
pub mod runner;
pub mod signals;
pub mod timer;
pub mod workdir;

pub use environment::Environment;
pub use error::{HarnessError, Result};
pub use events::{EventSink, TpsWriter};
pub use harness::{Harness, HarnessConfig, RunSummary};
pub use metadata::{list_test_cases, MetadataError, TestCaseMetadata};
pub use process::ExitStatus;
pub use reconcile::{reconcile, Outcome, TestState};
pub use results::{read_result_file, DeclaredResult, ResultFileError};
pub use runner::{run_test_case, CaseExecution, CaseInvocation, ConfigVars, Phase, Stream};
