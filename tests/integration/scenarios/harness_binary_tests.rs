use crate::integration::infrastructure::{serial, TestProgram};
use anyhow::Result;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::Read;
use std::os::unix::process::ExitStatusExt;
use std::time::{Duration, Instant};
use tracing::info;

/// Full tps report for a program mixing every kind of outcome
#[test]
fn test_tps_report() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let _guard = serial();

    let program = TestProgram::new()?
        .case("pass", "echo hello\necho passed >\"$results\"")
        .case("fail", "echo 'failed: assertion did not hold' >\"$results\"\nexit 1")
        .case("skip", "echo 'skipped: requires a network' >\"$results\"")
        .case("xfail", "echo 'expected_failure: known bug' >\"$results\"")
        .case("chatty", "echo passed >\"$results\"\necho extra >>\"$results\"")
        .case("dirty", "echo passed >\"$results\"")
        .cleanup("exit 1")
        .build()?;

    let output = program.run_harness(&[])?;
    info!(stderr = %output.stderr, "harness finished");

    assert_eq!(output.status.code(), Some(1));
    let mut lines = output.stdout.lines();
    assert_eq!(lines.next(), Some("Content-Type: application/X-atf-tps; version=\"3\""));
    assert_eq!(lines.next(), Some(""));
    assert_eq!(lines.next(), Some("tps-count: 1"));
    assert!(output.stdout.contains("tc-so:hello\n"));

    assert_eq!(
        output.tc_ends(),
        vec![
            "pass, passed".to_string(),
            "fail, failed, assertion did not hold".to_string(),
            "skip, skipped, requires a network".to_string(),
            "xfail, expected_failure, known bug".to_string(),
            "chatty, failed, Test case exited with code 0 but wrote an invalid results file: \
             results file has more than one line: passed<<NEWLINE UNEXPECTED>>extra"
                .to_string(),
            "dirty, failed, Test case cleanup did not terminate successfully".to_string(),
        ]
    );
    assert_eq!(output.tp_ends(), vec![program.path().display().to_string()]);
    Ok(())
}

/// Configuration variables and the sanitized environment reach the test case
#[test]
fn test_variables_and_environment() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let _guard = serial();

    let program = TestProgram::new()?
        .case(
            "vars",
            "if [ \"$var_greeting\" = hello ]; then echo passed >\"$results\"; \
             else echo \"failed: got '$var_greeting'\" >\"$results\"; exit 1; fi",
        )
        .case(
            "env",
            "[ \"$(pwd -P)\" = \"$(cd \"$HOME\" && pwd -P)\" ] || { echo 'failed: HOME' >\"$results\"; exit 1; }\n\
             [ \"$TZ\" = UTC ] || { echo 'failed: TZ' >\"$results\"; exit 1; }\n\
             [ -z \"${LANG+set}\" ] || { echo 'failed: LANG' >\"$results\"; exit 1; }\n\
             [ \"$__RUNNING_INSIDE_ATF_RUN\" = internal-yes-value ] || { echo 'failed: sentinel' >\"$results\"; exit 1; }\n\
             echo passed >\"$results\"",
        )
        .build()?;

    let output = program.run_harness(&["-v", "greeting=hello"])?;
    assert!(output.status.success(), "stdout: {}\nstderr: {}", output.stdout, output.stderr);
    assert_eq!(output.tc_ends(), vec!["vars, passed", "env, passed"]);

    let output = program.run_harness(&["--var", "greeting=bye"])?;
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(output.tc_ends()[0], "vars, failed, got 'bye'");
    Ok(())
}

/// A program whose listing cannot be parsed is reported as broken
#[test]
fn test_broken_program() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let _guard = serial();

    let program = TestProgram::new()?
        .case("unreachable", "echo passed >\"$results\"")
        .raw_listing("this is not a listing")
        .build()?;

    let output = program.run_harness(&[])?;
    assert_eq!(output.status.code(), Some(1));
    assert!(output.tc_ends().is_empty());
    let tp_ends = output.tp_ends();
    assert_eq!(tp_ends.len(), 1);
    assert!(
        tp_ends[0].contains("missing or invalid application/X-atf-tp header"),
        "{}",
        tp_ends[0]
    );
    Ok(())
}

/// Interrupting the harness lets the running test case finish first
#[test]
fn test_interrupt_waits_for_running_case() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let _guard = serial();

    let program = TestProgram::new()?
        .case("slow", "touch \"$var_marker\"\nsleep 1\necho passed >\"$results\"")
        .case("never", "echo passed >\"$results\"")
        .build()?;
    let marker = program.scratch().join("started");
    let marker_arg = format!("marker={}", marker.display());

    let mut child = program.spawn_harness(&["-v", &marker_arg])?;
    let deadline = Instant::now() + Duration::from_secs(10);
    while !marker.exists() {
        assert!(Instant::now() < deadline, "test case never started");
        std::thread::sleep(Duration::from_millis(20));
    }
    kill(Pid::from_raw(child.id() as i32), Signal::SIGINT)?;

    let mut stdout = String::new();
    if let Some(mut pipe) = child.stdout.take() {
        pipe.read_to_string(&mut stdout)?;
    }
    let status = child.wait()?;

    assert_eq!(status.signal(), Some(Signal::SIGINT as i32));
    assert!(stdout.contains(", slow, passed\n"), "stdout: {stdout}");
    assert!(!stdout.contains("never"), "stdout: {stdout}");
    Ok(())
}

/// Command line validation happens before anything runs
#[test]
fn test_invalid_command_line() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let _guard = serial();

    let program = TestProgram::new()?.case("tc", "echo passed >\"$results\"").build()?;

    let output = program.run_harness(&["-v", "missing-equals"])?;
    assert_eq!(output.status.code(), Some(2));
    assert!(output.stdout.is_empty());
    Ok(())
}
