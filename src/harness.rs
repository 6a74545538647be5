//! Running whole test programs and reporting their test cases.

use std::io;
use std::path::{Path, PathBuf};

use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};
use crate::events::EventSink;
use crate::metadata::{list_test_cases, TestCaseMetadata};
use crate::reconcile::{reconcile, Outcome, TestState};
use crate::results::read_result_file;
use crate::runner::{run_test_case, CaseExecution, CaseInvocation, ConfigVars, Phase, Stream};
use crate::signals::SignalHolder;
use crate::workdir::CaseDirectory;

/// Signals that must not interrupt a test case half way; they are replayed
/// between test cases.
const HELD_SIGNALS: [Signal; 3] = [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM];

/// Runtime configuration of a [`Harness`].
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Directory under which per-test-case directories are created.
    pub workdir_root: PathBuf,
    /// Variables passed to every test program.
    pub vars: ConfigVars,
}

/// Tally of a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Test programs whose test cases could not be listed.
    pub broken: usize,
}

impl RunSummary {
    /// True if nothing failed and every program could be listed.
    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.broken == 0
    }

    fn record(&mut self, outcome: &Outcome) {
        match outcome.state {
            TestState::Passed => self.passed += 1,
            TestState::Failed => self.failed += 1,
            TestState::Skipped => self.skipped += 1,
        }
    }
}

/// Runs test programs one test case at a time.
#[derive(Debug)]
pub struct Harness {
    config: HarnessConfig,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Runs every test case of every program in order, reporting to `sink`.
    ///
    /// Failures of individual test cases, including resource errors while
    /// running them, end up in the summary. Only a failing sink or a failure
    /// to manage the held signals aborts the run.
    pub fn run(&self, programs: &[PathBuf], sink: &mut dyn EventSink) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        for program in programs {
            self.run_program(program, sink, &mut summary)?;
        }
        info!(
            passed = summary.passed,
            failed = summary.failed,
            skipped = summary.skipped,
            broken = summary.broken,
            "run finished"
        );
        Ok(summary)
    }

    fn run_program(&self, program: &Path, sink: &mut dyn EventSink, summary: &mut RunSummary) -> Result<()> {
        let mut holders = HELD_SIGNALS
            .iter()
            .map(|&signal| SignalHolder::hold(signal))
            .collect::<Result<Vec<_>>>()?;

        let cases = match list_test_cases(program) {
            Ok(cases) => cases,
            Err(e) => {
                warn!(program = %program.display(), error = %e, "test program is broken");
                summary.broken += 1;
                sink.start_tp(program, 0).map_err(HarnessError::Sink)?;
                sink.end_tp(Some(&e.to_string())).map_err(HarnessError::Sink)?;
                return Ok(());
            }
        };

        info!(program = %program.display(), cases = cases.len(), "running test program");
        sink.start_tp(program, cases.len()).map_err(HarnessError::Sink)?;
        for case in &cases {
            let outcome = self.run_case(program, case, sink)?;
            summary.record(&outcome);
            for holder in holders.iter_mut() {
                holder.process()?;
            }
        }
        sink.end_tp(None).map_err(HarnessError::Sink)
    }

    /// Runs one test case, body and cleanup, and reports its outcome.
    fn run_case(&self, program: &Path, case: &TestCaseMetadata, sink: &mut dyn EventSink) -> Result<Outcome> {
        sink.start_tc(case.ident()).map_err(HarnessError::Sink)?;

        let mut sink_error = None;
        let outcome = match self.execute_case(program, case, sink, &mut sink_error) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(case = case.ident(), error = %e, "cannot run test case");
                Outcome::failed(e.to_string())
            }
        };
        if let Some(e) = sink_error {
            return Err(HarnessError::Sink(e));
        }

        info!(
            case = case.ident(),
            state = %outcome.reported_state(),
            reason = %outcome.reason,
            "test case finished"
        );
        sink.end_tc(&outcome).map_err(HarnessError::Sink)?;
        Ok(outcome)
    }

    fn execute_case(
        &self,
        program: &Path,
        case: &TestCaseMetadata,
        sink: &mut dyn EventSink,
        sink_error: &mut Option<io::Error>,
    ) -> Result<Outcome> {
        let dir = CaseDirectory::create(&self.config.workdir_root)?;

        let body = self.run_phase(program, case, Phase::Body, &dir, sink, sink_error)?;
        let declared = read_result_file(&dir.results_path(Phase::Body));
        debug!(case = case.ident(), ?declared, status = %body.status, "body finished");
        let mut outcome = reconcile(&declared, body.status, body.timeout_reason.as_deref());

        if case.has_cleanup() {
            let cleanup = self.run_phase(program, case, Phase::Cleanup, &dir, sink, sink_error)?;
            let clean = cleanup.timeout_reason.is_none() && cleanup.status.success();
            if !clean {
                warn!(case = case.ident(), status = %cleanup.status, "cleanup did not terminate successfully");
                if outcome.state != TestState::Failed {
                    outcome = Outcome::failed("Test case cleanup did not terminate successfully");
                }
            }
        }

        if let Err(e) = dir.remove() {
            warn!(case = case.ident(), error = %e, "cannot remove test case directory");
        }
        Ok(outcome)
    }

    fn run_phase(
        &self,
        program: &Path,
        case: &TestCaseMetadata,
        phase: Phase,
        dir: &CaseDirectory,
        sink: &mut dyn EventSink,
        sink_error: &mut Option<io::Error>,
    ) -> Result<CaseExecution> {
        let results_path = dir.results_path(phase);
        let invocation = CaseInvocation {
            executable: program,
            case_name: case.ident(),
            phase,
            metadata: case,
            vars: &self.config.vars,
            results_path: &results_path,
            workdir: dir.work_path(),
        };

        run_test_case(&invocation, |stream, line| {
            if sink_error.is_some() {
                return;
            }
            let written = match stream {
                Stream::Stdout => sink.stdout_line(&line),
                Stream::Stderr => sink.stderr_line(&line),
            };
            if let Err(e) = written {
                *sink_error = Some(e);
            }
        })
    }
}
