use crate::integration::infrastructure::{serial, wait_group_gone, BuiltProgram, TestProgram};
use anyhow::{Context, Result};
use atf_harness::workdir::CaseDirectory;
use atf_harness::{
    list_test_cases, read_result_file, reconcile, run_test_case, CaseExecution, CaseInvocation, ConfigVars,
    ExitStatus, Outcome, Phase, Stream, TestState,
};
use std::fs;
use std::time::{Duration, Instant};
use tracing::debug;

struct PhaseRun {
    execution: CaseExecution,
    lines: Vec<(Stream, String)>,
    outcome: Outcome,
}

/// Runs one phase of `case` in-process and reconciles it
fn run_phase(program: &BuiltProgram, case: &str, phase: Phase, vars: &ConfigVars) -> Result<PhaseRun> {
    let metadata = list_test_cases(program.path())?
        .into_iter()
        .find(|md| md.ident() == case)
        .context("test case not listed")?;
    let dir = CaseDirectory::create(program.workdir_root())?;
    let results_path = dir.results_path(phase);

    let invocation = CaseInvocation {
        executable: program.path(),
        case_name: case,
        phase,
        metadata: &metadata,
        vars,
        results_path: &results_path,
        workdir: dir.work_path(),
    };
    let mut lines = Vec::new();
    let execution = run_test_case(&invocation, |stream, line| lines.push((stream, line)))?;
    let declared = read_result_file(&results_path);
    let outcome = reconcile(&declared, execution.status, execution.timeout_reason.as_deref());
    debug!(case, ?declared, ?outcome, "phase finished");

    Ok(PhaseRun {
        execution,
        lines,
        outcome,
    })
}

fn run_body(program: &BuiltProgram, case: &str) -> Result<PhaseRun> {
    run_phase(program, case, Phase::Body, &ConfigVars::new())
}

/// A passing test case with output on both streams
#[test]
fn test_passing_case_with_output() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let _guard = serial();

    let program = TestProgram::new()?
        .case(
            "talker",
            "echo first; echo second\necho problem >&2\nprintf 'no newline'\necho passed >\"$results\"",
        )
        .build()?;

    let run = run_body(&program, "talker")?;
    assert_eq!(run.execution.status, ExitStatus::Exited(0));
    assert_eq!(run.outcome, Outcome::passed());

    let stdout: Vec<&str> = run
        .lines
        .iter()
        .filter(|(stream, _)| *stream == Stream::Stdout)
        .map(|(_, line)| line.as_str())
        .collect();
    assert_eq!(stdout, vec!["first", "second", "no newline"]);
    assert!(run.lines.contains(&(Stream::Stderr, "problem".to_string())));
    Ok(())
}

/// Declared exit code does not match the actual one
#[test]
fn test_expected_exit_mismatch() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let _guard = serial();

    let program = TestProgram::new()?
        .case("wrong_code", "echo 'expected_exit(5): should exit 5' >\"$results\"\nexit 3")
        .case("right_code", "echo 'expected_exit(5): should exit 5' >\"$results\"\nexit 5")
        .build()?;

    let run = run_body(&program, "wrong_code")?;
    assert_eq!(run.outcome.state, TestState::Failed);
    assert_eq!(
        run.outcome.reason,
        "Test case was expected to exit with code 5 but returned 3"
    );

    let run = run_body(&program, "right_code")?;
    assert_eq!(run.outcome.state, TestState::Passed);
    assert_eq!(run.outcome.expectation, Some("expected_exit"));
    assert_eq!(run.outcome.reason, "should exit 5");
    Ok(())
}

/// A test case that never writes its results file
#[test]
fn test_missing_results_file() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let _guard = serial();

    let program = TestProgram::new()?
        .case("silent", "true")
        .case("crashing", "exit 2")
        .build()?;

    let run = run_body(&program, "silent")?;
    assert_eq!(
        run.outcome,
        Outcome::failed("Test case exited normally but failed to create the results file")
    );

    let run = run_body(&program, "crashing")?;
    assert_eq!(
        run.outcome,
        Outcome::failed("Test case exited with code 2 but failed to create the results file")
    );
    Ok(())
}

/// Death by signal, expected and not
#[test]
fn test_signaled_cases() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let _guard = serial();

    let program = TestProgram::new()?
        .case("killed", "echo passed >\"$results\"\nkill -9 $$")
        .case("expected", "echo 'expected_signal(9): dies' >\"$results\"\nkill -9 $$")
        .case("death", "echo 'expected_death: going away' >\"$results\"\nkill -15 $$")
        .build()?;

    let run = run_body(&program, "killed")?;
    assert_eq!(
        run.execution.status,
        ExitStatus::Signaled {
            signo: 9,
            core_dumped: false
        }
    );
    assert_eq!(
        run.outcome,
        Outcome::failed("Test program received signal 9 after reporting its result")
    );

    let run = run_body(&program, "expected")?;
    assert_eq!(run.outcome.expectation, Some("expected_signal"));

    let run = run_body(&program, "death")?;
    assert_eq!(run.outcome.expectation, Some("expected_death"));
    Ok(())
}

/// A hung test case is killed at its timeout together with its children
#[test]
fn test_timeout_leaves_no_survivors() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let _guard = serial();

    let program = TestProgram::new()?
        .case(
            "hang",
            "echo $$ >\"$var_pidfile\"\n(trap '' TERM; sleep 60) &\nsleep 60\necho passed >\"$results\"",
        )
        .property("timeout", "1")
        .case("patient", "echo 'expected_timeout: hangs forever' >\"$results\"\nsleep 60")
        .property("timeout", "1")
        .build()?;

    let pidfile = program.scratch().join("pid");
    let mut vars = ConfigVars::new();
    vars.insert("pidfile".to_string(), pidfile.display().to_string());

    let started = Instant::now();
    let run = run_phase(&program, "hang", Phase::Body, &vars)?;
    let elapsed = started.elapsed();

    assert_eq!(
        run.execution.timeout_reason.as_deref(),
        Some("Test case timed out after 1 second")
    );
    assert_eq!(run.outcome, Outcome::failed("Test case timed out after 1 second"));
    assert!(elapsed < Duration::from_secs(10), "took {elapsed:?}");

    let pgid: i32 = fs::read_to_string(&pidfile)?.trim().parse()?;
    let survivors = wait_group_gone(pgid, Duration::from_secs(2));
    assert!(survivors.is_empty(), "processes survived: {survivors:?}");

    let run = run_body(&program, "patient")?;
    assert_eq!(run.outcome.state, TestState::Passed);
    assert_eq!(run.outcome.expectation, Some("expected_timeout"));
    Ok(())
}

/// Background processes of a test case that exits normally are killed too
#[test]
fn test_normal_exit_leaves_no_survivors() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let _guard = serial();

    let program = TestProgram::new()?
        .case(
            "leaky",
            "echo $$ >\"$var_pidfile\"\nsleep 30 >/dev/null 2>&1 &\necho passed >\"$results\"",
        )
        .property("timeout", "5")
        .build()?;

    let pidfile = program.scratch().join("pid");
    let mut vars = ConfigVars::new();
    vars.insert("pidfile".to_string(), pidfile.display().to_string());

    let started = Instant::now();
    let run = run_phase(&program, "leaky", Phase::Body, &vars)?;

    assert_eq!(run.execution.status, ExitStatus::Exited(0));
    assert_eq!(run.execution.timeout_reason, None);
    assert_eq!(run.outcome, Outcome::passed());
    assert!(started.elapsed() < Duration::from_secs(5), "waited for the background process");

    let pgid: i32 = fs::read_to_string(&pidfile)?.trim().parse()?;
    let survivors = wait_group_gone(pgid, Duration::from_secs(2));
    assert!(survivors.is_empty(), "processes survived: {survivors:?}");
    Ok(())
}

/// The cleanup phase runs as its own invocation with its own results file
#[test]
fn test_cleanup_phase_arguments() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let _guard = serial();

    let program = TestProgram::new()?
        .case("tidy", "echo passed >\"$results\"")
        .cleanup("echo \"cleanup for $tc\"\necho \"results at $results\"")
        .build()?;

    let run = run_phase(&program, "tidy", Phase::Cleanup, &ConfigVars::new())?;
    assert_eq!(run.execution.status, ExitStatus::Exited(0));
    let stdout: Vec<&str> = run.lines.iter().map(|(_, line)| line.as_str()).collect();
    assert_eq!(stdout[0], "cleanup for tidy:cleanup");
    assert!(stdout[1].ends_with("/tcr.cleanup"), "{}", stdout[1]);
    Ok(())
}
