//! Running one phase of one test case under supervision.
//!
//! The runner forks the test program, bounds its execution with an
//! [`InterruptibleTimer`], routes its output line by line to the caller, and
//! makes sure nothing from the test case's process group outlives the call.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use libc::c_int;
use nix::sys::signal::{killpg, SigHandler, Signal};
use nix::unistd::{geteuid, Pid, User};
use tracing::{debug, info, warn};

use crate::environment::Environment;
use crate::error::{HarnessError, Result};
use crate::metadata::TestCaseMetadata;
use crate::mux::Multiplexer;
use crate::process::{ChildProcess, Credentials, ExecSpec, ExitStatus};
use crate::signals::SignalProgrammer;
use crate::timer::InterruptibleTimer;

/// Configuration variables forwarded to test programs as `-v name=value`.
pub type ConfigVars = BTreeMap<String, String>;

/// Configuration variable naming the account used for
/// `require.user: unprivileged` test cases when the harness runs as root.
pub const UNPRIVILEGED_USER_VAR: &str = "unprivileged-user";

/// How long a timed-out process group gets between `SIGTERM` and `SIGKILL`.
const TERMINATION_GRACE_SECS: u32 = 1;

/// Set from signal context when the timeout fires; stops the multiplexer.
static CANCEL: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Body,
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Body => write!(f, "body"),
            Self::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// The output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Everything needed to run one phase of a test case.
#[derive(Debug, Clone, Copy)]
pub struct CaseInvocation<'a> {
    pub executable: &'a Path,
    pub case_name: &'a str,
    pub phase: Phase,
    pub metadata: &'a TestCaseMetadata,
    pub vars: &'a ConfigVars,
    pub results_path: &'a Path,
    pub workdir: &'a Path,
}

/// What happened to the child, before interpreting its results file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseExecution {
    /// Set when the timeout fired; explains the limit that was hit.
    pub timeout_reason: Option<String>,
    pub status: ExitStatus,
}

/// Timer callback. Runs inside the `SIGALRM` handler.
fn terminate_group(target: Option<Pid>) {
    CANCEL.store(true, Ordering::SeqCst);
    let Some(pgid) = target else {
        return;
    };
    let _ = killpg(pgid, Signal::SIGTERM);
    // SAFETY: sleep(3) is async-signal-safe.
    unsafe { libc::sleep(TERMINATION_GRACE_SECS) };
    if killpg(pgid, None).is_ok() {
        let _ = killpg(pgid, Signal::SIGKILL);
    }
}

/// No-op `SIGCHLD` handler: its only effect is interrupting the readiness
/// wait so the child's exit is noticed without waiting for the poll interval.
extern "C" fn wake_on_child(_: c_int) {}

/// Runs one phase of a test case to completion.
///
/// Every line the child prints is passed to `on_line` as it is read, tagged
/// with its stream. When this returns, the child has been reaped and its
/// process group has been sent `SIGKILL`.
///
/// # Errors
///
/// Resource failures (user lookup, pipes, fork, timer or signal setup, poll)
/// come back as [`HarnessError`]. They concern this test case only.
pub fn run_test_case<F>(invocation: &CaseInvocation<'_>, mut on_line: F) -> Result<CaseExecution>
where
    F: FnMut(Stream, String),
{
    let spec = prepare_exec(invocation)?;
    let timeout = invocation.metadata.timeout();

    CANCEL.store(false, Ordering::SeqCst);
    let _sigchld = SignalProgrammer::program(Signal::SIGCHLD, SigHandler::Handler(wake_on_child))?;
    let mut child = ChildProcess::spawn(&spec)?;
    info!(
        case = invocation.case_name,
        phase = %invocation.phase,
        pid = %child.pid(),
        ?timeout,
        "running test case"
    );

    let mut timer = if timeout.is_zero() {
        None
    } else {
        Some(InterruptibleTimer::arm(timeout, Some(child.pid()), terminate_group)?)
    };

    let outputs = [child.take_stdout(), child.take_stderr()]
        .into_iter()
        .flatten()
        .collect();
    let mut mux = Multiplexer::new(outputs)?;
    let mut deliver = |index: usize, line: String| {
        let stream = if index == 0 { Stream::Stdout } else { Stream::Stderr };
        on_line(stream, line);
    };
    let muxed = mux.mux(&CANCEL, &mut deliver);
    mux.flush(&mut deliver);
    drop(mux);

    let timed_out = match timer.as_mut() {
        Some(timer) => {
            timer.disarm();
            timer.fired()
        }
        None => false,
    };

    if let Err(e) = child.kill_group(Signal::SIGKILL) {
        warn!(pid = %child.pid(), error = %e, "cannot kill test case process group");
    }
    let status = child.wait()?;
    muxed?;

    let timeout_reason = timed_out.then(|| {
        warn!(case = invocation.case_name, ?timeout, "test case timed out");
        timeout_message(timeout)
    });
    debug!(case = invocation.case_name, phase = %invocation.phase, %status, "test case finished");
    Ok(CaseExecution {
        timeout_reason,
        status,
    })
}

fn timeout_message(timeout: Duration) -> String {
    let secs = timeout.as_secs();
    let unit = if secs == 1 { "second" } else { "seconds" };
    format!("Test case timed out after {secs} {unit}")
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir()
        .map_err(|e| HarnessError::io("cannot resolve relative path", path, e))?;
    Ok(cwd.join(path))
}

/// Builds the exec of the test program: argument vector, sanitized
/// environment and, if needed, the credentials to drop to.
fn prepare_exec(invocation: &CaseInvocation<'_>) -> Result<ExecSpec> {
    // The child changes directory before exec, so every path it receives
    // must already be absolute.
    let executable = absolute(invocation.executable)?;
    let workdir = absolute(invocation.workdir)?;
    let results = absolute(invocation.results_path)?;

    let srcdir = executable.parent().unwrap_or(Path::new("/"));
    let program_name = executable
        .file_name()
        .ok_or_else(|| {
            HarnessError::InvalidArgument(format!("'{}' does not name a program", executable.display()))
        })?
        .to_os_string();

    let mut argv = vec![program_name, prefixed("-r", results.as_os_str()), prefixed("-s", srcdir.as_os_str())];
    argv.extend(
        invocation
            .vars
            .iter()
            .map(|(name, value)| OsString::from(format!("-v{name}={value}"))),
    );
    argv.push(OsString::from(format!("{}:{}", invocation.case_name, invocation.phase)));

    let env = Environment::for_test_case(Environment::inherited(), &workdir);
    let spec = ExecSpec::new(&executable, &argv, &env, &workdir)?;

    Ok(match unprivileged_credentials(invocation.metadata, invocation.vars)? {
        Some(credentials) => spec.with_credentials(credentials),
        None => spec,
    })
}

fn prefixed(flag: &str, value: &std::ffi::OsStr) -> OsString {
    let mut arg = OsString::from(flag);
    arg.push(value);
    arg
}

/// Credentials for `require.user: unprivileged` test cases, needed only when
/// the harness itself runs as root.
fn unprivileged_credentials(metadata: &TestCaseMetadata, vars: &ConfigVars) -> Result<Option<Credentials>> {
    if metadata.require_user() != Some("unprivileged") || !geteuid().is_root() {
        return Ok(None);
    }

    let name = vars.get(UNPRIVILEGED_USER_VAR).ok_or(HarnessError::NoUnprivilegedUser)?;
    let user = User::from_name(name)
        .map_err(|source| HarnessError::UserLookup {
            name: name.clone(),
            source,
        })?
        .ok_or_else(|| HarnessError::UnknownUser(name.clone()))?;
    debug!(user = %name, uid = %user.uid, "test case will drop privileges");
    Ok(Some(Credentials {
        uid: user.uid,
        gid: user.gid,
    }))
}
