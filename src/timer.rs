//! One-shot timeout that runs a callback from signal context.
//!
//! Only one timer may be armed per process at a time: the fired flag, the
//! callback and its target live in process-wide atomics because the callback
//! is reached from a `SIGALRM` handler. Nesting timers is not supported and
//! is not detected.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, Ordering};
use std::time::Duration;

use libc::c_int;
use nix::sys::signal::{SigHandler, Signal};
use nix::unistd::Pid;
use tracing::debug;

use crate::error::{HarnessError, Result};
use crate::signals::SignalProgrammer;

/// Callback run when a timer fires. Executes inside a signal handler: it
/// must not allocate, lock, or panic.
pub type FireCallback = fn(Option<Pid>);

static FIRED: AtomicBool = AtomicBool::new(false);
static TARGET: AtomicI32 = AtomicI32::new(0);
static CALLBACK: AtomicPtr<()> = AtomicPtr::new(std::ptr::null_mut());

extern "C" fn on_alarm(_: c_int) {
    if FIRED.swap(true, Ordering::SeqCst) {
        return;
    }
    let callback = CALLBACK.load(Ordering::SeqCst);
    if callback.is_null() {
        return;
    }
    // SAFETY: CALLBACK only ever holds a `FireCallback` stored by `arm`.
    let callback: FireCallback = unsafe { std::mem::transmute::<*mut (), FireCallback>(callback) };
    let target = match TARGET.load(Ordering::SeqCst) {
        0 => None,
        raw => Some(Pid::from_raw(raw)),
    };
    callback(target);
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
mod os {
    use std::time::Duration;

    use nix::errno::Errno;
    use nix::sys::signal::{SigEvent, SigevNotify, Signal};
    use nix::sys::time::TimeSpec;
    use nix::sys::timer::{Expiration, Timer, TimerSetTimeFlags};
    use nix::time::ClockId;

    /// A POSIX timer on the monotonic clock delivering `SIGALRM`. Deleting it
    /// leaves the process's `setitimer` alarm untouched.
    pub(super) struct OsTimer {
        _timer: Timer,
    }

    impl OsTimer {
        pub(super) fn start(duration: Duration) -> Result<Self, Errno> {
            let event = SigEvent::new(SigevNotify::SigevSignal {
                signal: Signal::SIGALRM,
                si_value: 0,
            });
            let mut timer = Timer::new(ClockId::CLOCK_MONOTONIC, event)?;
            timer.set(
                Expiration::OneShot(TimeSpec::from_duration(duration)),
                TimerSetTimeFlags::empty(),
            )?;
            Ok(Self { _timer: timer })
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
mod os {
    use std::time::Duration;

    use nix::errno::Errno;

    /// Fallback on `setitimer(ITIMER_REAL)`; the previous interval is put back
    /// on drop.
    pub(super) struct OsTimer {
        previous: libc::itimerval,
    }

    impl OsTimer {
        pub(super) fn start(duration: Duration) -> Result<Self, Errno> {
            let value = libc::itimerval {
                it_interval: libc::timeval { tv_sec: 0, tv_usec: 0 },
                it_value: libc::timeval {
                    tv_sec: duration.as_secs() as libc::time_t,
                    tv_usec: duration.subsec_micros() as libc::suseconds_t,
                },
            };
            let mut previous = libc::itimerval {
                it_interval: libc::timeval { tv_sec: 0, tv_usec: 0 },
                it_value: libc::timeval { tv_sec: 0, tv_usec: 0 },
            };
            // SAFETY: both pointers reference valid, initialized itimervals.
            let ret = unsafe { libc::setitimer(libc::ITIMER_REAL, &value, &mut previous) };
            Errno::result(ret)?;
            Ok(Self { previous })
        }
    }

    impl Drop for OsTimer {
        fn drop(&mut self) {
            // SAFETY: `previous` came from setitimer.
            unsafe { libc::setitimer(libc::ITIMER_REAL, &self.previous, std::ptr::null_mut()) };
        }
    }
}

/// A timeout armed for a bounded operation.
///
/// Dropping the timer (or calling [`disarm`](InterruptibleTimer::disarm))
/// cancels a pending expiration and restores the `SIGALRM` disposition that
/// was in place before arming, whether or not the timer fired.
pub struct InterruptibleTimer {
    duration: Duration,
    target: Option<Pid>,
    os_timer: Option<os::OsTimer>,
    alarm: SignalProgrammer,
    fired: bool,
}

impl InterruptibleTimer {
    /// Schedules `on_fire` to run once, `duration` from now.
    ///
    /// `target` is handed to the callback; the runner uses it for the
    /// process group to terminate.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Signal`] if the `SIGALRM` handler cannot be
    /// installed and [`HarnessError::Timer`] if the OS timer cannot be
    /// created or armed.
    pub fn arm(duration: Duration, target: Option<Pid>, on_fire: FireCallback) -> Result<Self> {
        FIRED.store(false, Ordering::SeqCst);
        TARGET.store(target.map_or(0, Pid::as_raw), Ordering::SeqCst);
        CALLBACK.store(on_fire as *mut (), Ordering::SeqCst);

        let alarm = SignalProgrammer::program(Signal::SIGALRM, SigHandler::Handler(on_alarm))?;
        let os_timer = os::OsTimer::start(duration).map_err(HarnessError::Timer)?;
        debug!(?duration, ?target, "armed timer");

        Ok(Self {
            duration,
            target,
            os_timer: Some(os_timer),
            alarm,
            fired: false,
        })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn target(&self) -> Option<Pid> {
        self.target
    }

    /// Whether the callback has run.
    pub fn fired(&self) -> bool {
        if self.os_timer.is_some() {
            FIRED.load(Ordering::SeqCst)
        } else {
            self.fired
        }
    }

    /// Cancels the timer and restores the previous alarm state. Idempotent.
    pub fn disarm(&mut self) {
        if let Some(os_timer) = self.os_timer.take() {
            drop(os_timer);
            self.alarm.unprogram();
            self.fired = FIRED.load(Ordering::SeqCst);
            CALLBACK.store(std::ptr::null_mut(), Ordering::SeqCst);
            TARGET.store(0, Ordering::SeqCst);
            debug!(fired = self.fired, "disarmed timer");
        }
    }
}

impl Drop for InterruptibleTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}
