use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use thiserror::Error;

/// Resource errors raised while setting up or supervising a test case.
///
/// These are fatal to the test case being run and to nothing else: the
/// harness catches them per test case and reports the case as failed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HarnessError {
    /// Failed to create the OS timer backing a timeout.
    #[error("failed to arm timeout timer: {0}")]
    Timer(#[source] Errno),

    /// Failed to install or query a signal disposition.
    #[error("failed to program handler for {signal}: {source}")]
    Signal {
        /// The signal being programmed.
        signal: Signal,
        /// The underlying error.
        #[source]
        source: Errno,
    },

    /// Failed to create a pipe for the child's output.
    #[error("failed to create pipe: {0}")]
    Pipe(#[source] Errno),

    /// Failed to adjust descriptor flags.
    #[error("failed to configure descriptor: {0}")]
    Fcntl(#[source] Errno),

    /// Failed to fork the child process.
    #[error("failed to fork: {0}")]
    Fork(#[source] Errno),

    /// Failed to reclaim the child process.
    #[error("failed to wait for pid {pid}: {source}")]
    Wait {
        /// The child being waited for.
        pid: i32,
        /// The underlying error.
        #[source]
        source: Errno,
    },

    /// The readiness wait over the child's output failed.
    #[error("failed to poll child output: {0}")]
    Poll(#[source] Errno),

    /// An argument, path or environment entry could not be passed to exec.
    #[error("invalid argument for test case: {0}")]
    InvalidArgument(String),

    /// The unprivileged user named in the configuration does not exist.
    #[error("cannot find unprivileged user '{0}'")]
    UnknownUser(String),

    /// A test case requires an unprivileged user but none was configured.
    #[error("test case requires an unprivileged user but 'unprivileged-user' is not set")]
    NoUnprivilegedUser,

    /// Looking up a user in the password database failed.
    #[error("failed to look up user '{name}': {source}")]
    UserLookup {
        /// The user being looked up.
        name: String,
        /// The underlying error.
        #[source]
        source: Errno,
    },

    /// A filesystem operation on a harness-owned path failed.
    #[error("{action} {}: {source}", path.display())]
    Io {
        /// What the harness was doing.
        action: &'static str,
        /// The path involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Writing to the results sink failed.
    #[error("failed to write results: {0}")]
    Sink(#[source] std::io::Error),
}

impl HarnessError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
