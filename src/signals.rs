//! Scoped signal dispositions.
//!
//! [`SignalProgrammer`] installs a handler and puts the previous disposition
//! back when dropped. [`SignalHolder`] defers a signal across a protected
//! region: deliveries are only recorded, and replayed against the process
//! once the region ends (or when [`SignalHolder::process`] is called).

use std::sync::atomic::{AtomicBool, Ordering};

use libc::c_int;
use nix::sys::signal::{raise, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{debug, error};

use crate::error::{HarnessError, Result};

/// Highest signal number tracked by the holder flag table.
pub(crate) const LAST_SIGNO: usize = 64;

#[allow(clippy::declare_interior_mutable_const)]
const NOT_HAPPENED: AtomicBool = AtomicBool::new(false);

/// One flag per signal number, set from signal context by [`record_delivery`]
/// and read by the main thread only.
static HAPPENED: [AtomicBool; LAST_SIGNO + 1] = [NOT_HAPPENED; LAST_SIGNO + 1];

extern "C" fn record_delivery(signo: c_int) {
    if let Some(flag) = usize::try_from(signo).ok().and_then(|i| HAPPENED.get(i)) {
        flag.store(true, Ordering::SeqCst);
    }
}

fn happened_flag(signal: Signal) -> &'static AtomicBool {
    &HAPPENED[signal as usize]
}

/// Installs a handler for a signal for as long as the value lives.
pub struct SignalProgrammer {
    signal: Signal,
    previous: Option<SigAction>,
}

impl SignalProgrammer {
    /// Installs `handler` for `signal` with no extra `SA_*` flags.
    ///
    /// Without `SA_RESTART`, blocking calls in progress when the signal
    /// arrives return `EINTR`, which is what callers waiting on a child rely
    /// on.
    pub fn program(signal: Signal, handler: SigHandler) -> Result<Self> {
        Self::program_with_flags(signal, handler, SaFlags::empty())
    }

    /// Installs `handler` for `signal` with the given flags.
    pub fn program_with_flags(signal: Signal, handler: SigHandler, flags: SaFlags) -> Result<Self> {
        let action = SigAction::new(handler, flags, SigSet::empty());
        // SAFETY: every handler installed through this type only touches
        // atomics and async-signal-safe syscalls.
        let previous = unsafe { sigaction(signal, &action) }
            .map_err(|source| HarnessError::Signal { signal, source })?;
        debug!(%signal, "programmed signal handler");
        Ok(Self {
            signal,
            previous: Some(previous),
        })
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Whether the handler is still installed.
    pub fn is_programmed(&self) -> bool {
        self.previous.is_some()
    }

    /// Restores the disposition that was in place before [`program`].
    ///
    /// Calling this more than once is a no-op. Failing to reinstall a
    /// disposition that the kernel handed back to us should never happen;
    /// if it does the process aborts rather than run with a stray handler.
    ///
    /// [`program`]: SignalProgrammer::program
    pub fn unprogram(&mut self) {
        if let Some(previous) = self.previous.take() {
            // SAFETY: `previous` was returned by sigaction for this signal.
            if let Err(e) = unsafe { sigaction(self.signal, &previous) } {
                error!(signal = %self.signal, error = %e, "cannot restore previous signal disposition");
                std::process::abort();
            }
            debug!(signal = %self.signal, "restored signal disposition");
        }
    }
}

impl Drop for SignalProgrammer {
    fn drop(&mut self) {
        self.unprogram();
    }
}

/// Holds back a signal, recording deliveries instead of acting on them.
pub struct SignalHolder {
    signal: Signal,
    programmer: Option<SignalProgrammer>,
}

impl SignalHolder {
    /// Starts holding `signal`. Any earlier recorded delivery is forgotten.
    pub fn hold(signal: Signal) -> Result<Self> {
        happened_flag(signal).store(false, Ordering::SeqCst);
        let programmer = SignalProgrammer::program(signal, SigHandler::Handler(record_delivery))?;
        Ok(Self {
            signal,
            programmer: Some(programmer),
        })
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Whether the signal arrived since the holder was (re)installed.
    pub fn happened(&self) -> bool {
        happened_flag(self.signal).load(Ordering::SeqCst)
    }

    /// Replays a held delivery, if any, then resumes holding.
    ///
    /// The replay happens with the previous disposition in place, so a
    /// default-action signal such as `SIGINT` terminates the process here.
    pub fn process(&mut self) -> Result<()> {
        if !self.happened() {
            return Ok(());
        }

        debug!(signal = %self.signal, "replaying held signal");
        if let Some(mut programmer) = self.programmer.take() {
            programmer.unprogram();
        }
        happened_flag(self.signal).store(false, Ordering::SeqCst);
        raise(self.signal).map_err(|source| HarnessError::Signal {
            signal: self.signal,
            source,
        })?;
        self.programmer = Some(SignalProgrammer::program(
            self.signal,
            SigHandler::Handler(record_delivery),
        )?);
        Ok(())
    }
}

impl Drop for SignalHolder {
    fn drop(&mut self) {
        let happened = self.happened();
        if let Some(mut programmer) = self.programmer.take() {
            programmer.unprogram();
        }
        if happened {
            happened_flag(self.signal).store(false, Ordering::SeqCst);
            debug!(signal = %self.signal, "delivering held signal on release");
            let _ = raise(self.signal);
        }
    }
}

/// Resets every catchable signal to its default disposition.
///
/// Meant for a freshly forked child: it only issues `signal(2)` calls.
///
/// # Safety
///
/// Replaces process-wide signal dispositions; callers must not rely on any
/// handler installed before the call.
pub(crate) unsafe fn reset_all_to_default() {
    for signo in 1..=LAST_SIGNO as c_int {
        if signo == libc::SIGKILL || signo == libc::SIGSTOP {
            continue;
        }
        libc::signal(signo, libc::SIG_DFL);
    }
}
