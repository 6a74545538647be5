//! Forking a test case and owning the resulting child.
//!
//! Everything the child needs is allocated up front in an [`ExecSpec`], so
//! the code running between `fork` and `exec` only issues raw system calls.

use std::ffi::{CStr, CString, OsStr};
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use libc::c_char;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, pipe, setpgid, ForkResult, Gid, Pid, Uid};
use tracing::{debug, info, warn};

use crate::environment::Environment;
use crate::error::{HarnessError, Result};
use crate::signals;

/// How a reaped child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The child called `exit` with this code.
    Exited(i32),
    /// The child was terminated by signal `signo`.
    Signaled { signo: i32, core_dumped: bool },
}

impl ExitStatus {
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    #[must_use]
    pub const fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Signaled { .. } => None,
        }
    }

    #[must_use]
    pub const fn signal(&self) -> Option<i32> {
        match self {
            Self::Exited(_) => None,
            Self::Signaled { signo, .. } => Some(*signo),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled {
                signo,
                core_dumped: true,
            } => write!(f, "received signal {signo} (core dumped)"),
            Self::Signaled { signo, .. } => write!(f, "received signal {signo}"),
        }
    }
}

/// Identity the child switches to before exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: Uid,
    pub gid: Gid,
}

/// A fully prepared `execve` call plus the directory to run it in.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    workdir: CString,
    credentials: Option<Credentials>,
}

impl ExecSpec {
    /// Prepares the exec of `program` with the given argument vector
    /// (including `argv[0]`), environment and working directory.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidArgument`] if any piece contains a NUL
    /// byte.
    pub fn new<I, S>(program: &Path, argv: I, env: &Environment, workdir: &Path) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let argv = argv
            .into_iter()
            .map(|arg| to_cstring(arg.as_ref(), "argument"))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            program: to_cstring(program.as_os_str(), "program path")?,
            argv,
            envp: env.to_exec_entries()?,
            workdir: to_cstring(workdir.as_os_str(), "work directory")?,
            credentials: None,
        })
    }

    /// Makes the child drop to `credentials` before exec.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials
    }
}

fn to_cstring(value: &OsStr, what: &str) -> Result<CString> {
    CString::new(value.as_bytes()).map_err(|_| {
        HarnessError::InvalidArgument(format!("{what} '{}' contains a NUL byte", value.to_string_lossy()))
    })
}

/// A pipe whose two ends are closed on exec.
fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let (read_end, write_end) = pipe().map_err(HarnessError::Pipe)?;
    for fd in [&read_end, &write_end] {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(HarnessError::Fcntl)?;
    }
    Ok((read_end, write_end))
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// A forked test case, leader of its own process group.
///
/// Dropping a child that was never waited for kills its process group and
/// reaps it, so an early return cannot leak a zombie or a stray process.
pub struct ChildProcess {
    pid: Pid,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
    status: Option<ExitStatus>,
}

impl ChildProcess {
    /// Forks and execs `spec`, capturing stdout and stderr through pipes.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Pipe`] or [`HarnessError::Fork`] when the
    /// child cannot be created. Failures after the fork (privilege drop,
    /// chdir, exec) are reported by the child on its stderr and through a
    /// failing exit status.
    pub fn spawn(spec: &ExecSpec) -> Result<Self> {
        let (stdout_read, stdout_write) = cloexec_pipe()?;
        let (stderr_read, stderr_write) = cloexec_pipe()?;

        let argv = null_terminated(&spec.argv);
        let envp = null_terminated(&spec.envp);
        let exec_failure = format!("Failed to execute {}: ", spec.program.to_string_lossy());

        // SAFETY: the child branch only calls async-signal-safe functions on
        // data prepared above and never returns.
        match unsafe { fork() }.map_err(HarnessError::Fork)? {
            ForkResult::Child => child_main(
                spec,
                stdout_write.as_raw_fd(),
                stderr_write.as_raw_fd(),
                &argv,
                &envp,
                exec_failure.as_bytes(),
            ),
            ForkResult::Parent { child } => {
                drop(stdout_write);
                drop(stderr_write);

                // The child does the same; doing it here too means the group
                // exists before we ever signal it.
                match setpgid(child, child) {
                    Ok(()) | Err(Errno::EACCES) | Err(Errno::ESRCH) => {}
                    Err(e) => debug!(pid = %child, error = %e, "setpgid from parent failed"),
                }

                info!(pid = %child, program = %spec.program.to_string_lossy(), "spawned test case");
                Ok(Self {
                    pid: child,
                    stdout: Some(stdout_read),
                    stderr: Some(stderr_read),
                    status: None,
                })
            }
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn take_stdout(&mut self) -> Option<OwnedFd> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<OwnedFd> {
        self.stderr.take()
    }

    /// Sends `signal` to the child's whole process group. A group that no
    /// longer exists is not an error.
    pub fn kill_group(&self, signal: Signal) -> Result<()> {
        match killpg(self.pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(HarnessError::Signal { signal, source }),
        }
    }

    /// Blocks until the child terminates and returns how it did.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }

        loop {
            let status = match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => ExitStatus::Exited(code),
                Ok(WaitStatus::Signaled(_, signal, core_dumped)) => ExitStatus::Signaled {
                    signo: signal as i32,
                    core_dumped,
                },
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(source) => {
                    return Err(HarnessError::Wait {
                        pid: self.pid.as_raw(),
                        source,
                    })
                }
            };
            debug!(pid = %self.pid, %status, "reaped test case");
            self.status = Some(status);
            return Ok(status);
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.status.is_none() {
            warn!(pid = %self.pid, "dropping unwaited test case, killing its process group");
            let _ = self.kill_group(Signal::SIGKILL);
            let _ = self.wait();
        }
    }
}

/// Body of the forked child. Never returns.
fn child_main(
    spec: &ExecSpec,
    stdout: RawFd,
    stderr: RawFd,
    argv: &[*const c_char],
    envp: &[*const c_char],
    exec_failure: &[u8],
) -> ! {
    // SAFETY: plain system calls on descriptors and C strings owned by the
    // parent's (copied) address space.
    unsafe {
        if libc::dup2(stdout, libc::STDOUT_FILENO) == -1 || libc::dup2(stderr, libc::STDERR_FILENO) == -1 {
            die(b"Failed to redirect output: ");
        }

        libc::close(libc::STDIN_FILENO);
        let null = libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_RDONLY);
        if null == -1 {
            die(b"Failed to open /dev/null: ");
        }
        if null != libc::STDIN_FILENO {
            libc::dup2(null, libc::STDIN_FILENO);
            libc::close(null);
        }

        if let Some(credentials) = spec.credentials {
            let gid = credentials.gid.as_raw();
            if libc::setgroups(1, &gid) == -1
                || libc::setgid(gid) == -1
                || libc::setuid(credentials.uid.as_raw()) == -1
            {
                die(b"Failed to drop privileges: ");
            }
        }

        if libc::setpgid(0, 0) == -1 {
            die(b"Failed to create process group: ");
        }
        signals::reset_all_to_default();
        libc::umask(0o022);

        if libc::chdir(spec.workdir.as_ptr()) == -1 {
            die(b"Failed to enter work directory: ");
        }
    }

    exec_or_exit(&spec.program, argv, envp, exec_failure)
}

/// Replaces the process image, or reports why it could not and exits.
fn exec_or_exit(program: &CStr, argv: &[*const c_char], envp: &[*const c_char], failure: &[u8]) -> ! {
    // SAFETY: argv and envp are NULL-terminated arrays of pointers into
    // CStrings that outlive this call.
    unsafe {
        libc::execve(program.as_ptr(), argv.as_ptr(), envp.as_ptr());
    }
    die(failure)
}

/// Writes `prefix` and the description of `errno` to stderr, then exits
/// without running any of the parent's cleanup.
fn die(prefix: &[u8]) -> ! {
    let errno = Errno::last_raw();
    // SAFETY: write(2), strerror(3) and _exit(2) on valid buffers.
    unsafe {
        let description = CStr::from_ptr(libc::strerror(errno)).to_bytes();
        for chunk in [prefix, description, b"\n"] {
            libc::write(libc::STDERR_FILENO, chunk.as_ptr().cast(), chunk.len());
        }
        libc::_exit(libc::EXIT_FAILURE)
    }
}
