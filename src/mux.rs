//! Line-oriented multiplexing of several readable descriptors.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, trace};

use crate::error::{HarnessError, Result};

/// Default number of bytes read per readiness notification.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Upper bound on a single readiness wait, so cancellation is noticed at
/// least four times per second.
const POLL_INTERVAL_MS: u16 = 250;

struct Source {
    file: File,
    pending: Vec<u8>,
    active: bool,
}

/// Splits the output of several descriptors into lines.
///
/// Each completed line is handed to the caller together with the index of the
/// descriptor it came from, newline stripped and carriage returns dropped.
/// Lines from one descriptor arrive in the order they were written; nothing
/// is promised about the interleaving of different descriptors.
pub struct Multiplexer {
    sources: Vec<Source>,
    chunk_size: usize,
}

impl Multiplexer {
    /// Takes ownership of `fds`, reading [`DEFAULT_CHUNK_SIZE`] bytes at a time.
    pub fn new(fds: Vec<OwnedFd>) -> Result<Self> {
        Self::with_chunk_size(fds, DEFAULT_CHUNK_SIZE)
    }

    /// Takes ownership of `fds`, reading up to `chunk_size` bytes at a time.
    ///
    /// The descriptors are switched to non-blocking mode so that a final
    /// [`flush`](Multiplexer::flush) can never hang on a writer that is still
    /// alive.
    pub fn with_chunk_size(fds: Vec<OwnedFd>, chunk_size: usize) -> Result<Self> {
        let sources = fds
            .into_iter()
            .map(|fd| {
                set_nonblocking(&fd)?;
                Ok(Source {
                    file: File::from(fd),
                    pending: Vec::new(),
                    active: true,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            sources,
            chunk_size: chunk_size.max(1),
        })
    }

    /// Delivers lines until every descriptor hangs up or `cancel` is set.
    ///
    /// Unterminated fragments stay buffered; call [`flush`] afterwards to
    /// collect them and anything still unread.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Poll`] if the readiness wait itself fails for
    /// any reason other than being interrupted by a signal.
    ///
    /// [`flush`]: Multiplexer::flush
    pub fn mux<F>(&mut self, cancel: &AtomicBool, mut on_line: F) -> Result<()>
    where
        F: FnMut(usize, String),
    {
        let chunk_size = self.chunk_size;
        let mut buffer = vec![0u8; chunk_size];

        while !cancel.load(Ordering::SeqCst) {
            let watched: Vec<usize> = (0..self.sources.len())
                .filter(|&i| self.sources[i].active)
                .collect();
            if watched.is_empty() {
                break;
            }

            let events = {
                let mut poll_fds: Vec<PollFd<'_>> = watched
                    .iter()
                    .map(|&i| PollFd::new(self.sources[i].file.as_fd(), PollFlags::POLLIN))
                    .collect();
                match poll(&mut poll_fds, PollTimeout::from(POLL_INTERVAL_MS)) {
                    Ok(0) => continue,
                    Ok(_) => poll_fds
                        .iter()
                        .map(|pfd| pfd.revents().unwrap_or_else(PollFlags::empty))
                        .collect::<Vec<_>>(),
                    Err(Errno::EINTR) => {
                        trace!("readiness wait interrupted");
                        continue;
                    }
                    Err(e) => return Err(HarnessError::Poll(e)),
                }
            };

            for (&index, revents) in watched.iter().zip(events) {
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                let readable = PollFlags::POLLIN | PollFlags::POLLPRI;
                if revents.intersects(readable) {
                    if !read_chunk(index, &mut self.sources[index], &mut buffer, &mut on_line) {
                        self.sources[index].active = false;
                    }
                } else if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL) {
                    debug!(index, "descriptor hung up");
                    self.sources[index].active = false;
                }
            }
        }
        Ok(())
    }

    /// Drains whatever is left on every descriptor and delivers unterminated
    /// fragments as final lines. Read errors are ignored.
    pub fn flush<F>(&mut self, mut on_line: F)
    where
        F: FnMut(usize, String),
    {
        let mut buffer = vec![0u8; self.chunk_size];
        for (index, source) in self.sources.iter_mut().enumerate() {
            while read_chunk(index, source, &mut buffer, &mut on_line) {}
            if !source.pending.is_empty() {
                let line = String::from_utf8_lossy(&source.pending).into_owned();
                source.pending.clear();
                on_line(index, line);
            }
            source.active = false;
        }
    }
}

/// Reads one chunk from `source`, delivering every completed line.
///
/// Returns `false` once nothing more can be read right now: end of stream,
/// no data available, or an error.
fn read_chunk<F>(index: usize, source: &mut Source, buffer: &mut [u8], on_line: &mut F) -> bool
where
    F: FnMut(usize, String),
{
    let count = match source.file.read(buffer) {
        Ok(0) => return false,
        Ok(count) => count,
        Err(e) if e.kind() == ErrorKind::Interrupted => return true,
        Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
        Err(e) => {
            debug!(index, error = %e, "read failed");
            return false;
        }
    };

    for &byte in &buffer[..count] {
        match byte {
            b'\n' => {
                let line = String::from_utf8_lossy(&source.pending).into_owned();
                source.pending.clear();
                on_line(index, line);
            }
            b'\r' => {}
            other => source.pending.push(other),
        }
    }
    true
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(HarnessError::Fcntl)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(HarnessError::Fcntl)?;
    Ok(())
}
