//! Single-threaded event loop.
//!
//! Waits on libusb's descriptors and a signal descriptor at once. Signals are consumed as
//! ordinary readiness, so no code ever runs in signal handler context.

use std::fmt;
use std::io;
use std::mem;
use std::os::raw::{c_int, c_void};
use std::os::unix::io::{AsRawFd, RawFd};
use std::process;
use std::ptr;
use std::time::Duration;

use crate::pool::TransferPool;
use crate::stream::{SignalAction, StreamState};
use crate::transfer::Transport;
use crate::{Error, Result};

/// How long to sleep when libusb has no pending deadline.
pub const FALLBACK_TIMEOUT: Duration = Duration::from_secs(1);

/// A pollable source of termination signals.
pub trait SignalSource: AsRawFd {
    /// Returns the next pending signal number without blocking.
    fn read_signal(&mut self) -> Result<Option<c_int>>;
}

/// Delivers `SIGINT` and `SIGTERM` through a `signalfd`.
///
/// The signals are blocked for the calling thread while the `SignalFd` exists.
pub struct SignalFd {
    fd: RawFd,
    old_mask: libc::sigset_t,
}

impl SignalFd {
    /// Catches the usual termination signals.
    pub fn termination() -> Result<Self> {
        Self::new(&[libc::SIGINT, libc::SIGTERM])
    }

    pub fn new(signals: &[c_int]) -> Result<Self> {
        // SAFETY: the sets are initialized by `sigemptyset`/`pthread_sigmask` before use.
        unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut mask);
            for &signal in signals {
                libc::sigaddset(&mut mask, signal);
            }

            let mut old_mask: libc::sigset_t = mem::zeroed();
            let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &mask, &mut old_mask);
            if rc != 0 {
                return Err(Error::io(io::Error::from_raw_os_error(rc)));
            }

            let fd = libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC);
            if fd < 0 {
                let err = io::Error::last_os_error();
                libc::pthread_sigmask(libc::SIG_SETMASK, &old_mask, ptr::null_mut());
                return Err(Error::io(err));
            }

            Ok(Self { fd, old_mask })
        }
    }
}

impl fmt::Debug for SignalFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalFd").field("fd", &self.fd).finish()
    }
}

impl AsRawFd for SignalFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl SignalSource for SignalFd {
    fn read_signal(&mut self) -> Result<Option<c_int>> {
        // SAFETY: `info` is plain old data and large enough for one record.
        let (n, info) = unsafe {
            let mut info: libc::signalfd_siginfo = mem::zeroed();
            let n = libc::read(
                self.fd,
                &mut info as *mut libc::signalfd_siginfo as *mut c_void,
                mem::size_of::<libc::signalfd_siginfo>(),
            );
            (n, info)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                io::ErrorKind::Interrupted => Ok(None),
                _ => Err(Error::io(err)),
            };
        }
        if n as usize != mem::size_of::<libc::signalfd_siginfo>() {
            return Err(Error::other(format!("short signalfd read ({} bytes)", n)));
        }
        Ok(Some(info.ssi_signo as c_int))
    }
}

impl Drop for SignalFd {
    fn drop(&mut self) {
        // Swallow anything still pending so unblocking doesn't deliver it.
        while let Ok(Some(signal)) = self.read_signal() {
            log::debug!("discarding signal {}", signal);
        }
        // SAFETY: `fd` is owned by us and `old_mask` was filled in by `pthread_sigmask`.
        unsafe {
            libc::close(self.fd);
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.old_mask, ptr::null_mut());
        }
    }
}

/// Rounds up to whole milliseconds, as `poll` expects.
fn poll_timeout(timeout: Duration) -> c_int {
    let mut ms = timeout.as_millis();
    if timeout.subsec_nanos() % 1_000_000 != 0 {
        ms += 1;
    }
    ms.min(c_int::max_value() as u128) as c_int
}

/// Services a transfer pool until it has no outstanding transfers.
#[derive(Debug)]
pub struct EventLoop<'s, S> {
    signals: &'s mut S,
    fallback: Duration,
}

impl<'s, S: SignalSource> EventLoop<'s, S> {
    pub fn new(signals: &'s mut S) -> Self {
        Self {
            signals,
            fallback: FALLBACK_TIMEOUT,
        }
    }

    /// Polls and dispatches completions until `pool` is empty.
    ///
    /// Returns an error only if waiting itself fails. Transfer errors are recorded in `state`.
    pub fn run<T: Transport>(
        &mut self,
        pool: &mut TransferPool<T>,
        state: &mut StreamState<'_>,
    ) -> Result<()> {
        while pool.outstanding() > 0 {
            let timeout = pool
                .transport()
                .next_timeout()?
                .unwrap_or(self.fallback);

            // libusb may add or remove descriptors at any time, so the set is rebuilt every time.
            let mut fds = pool.transport().poll_fds();
            let signal_index = fds.len();
            fds.push(libc::pollfd {
                fd: self.signals.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });

            // SAFETY: `fds` is a valid array of `fds.len()` entries.
            let rc = unsafe {
                libc::poll(
                    fds.as_mut_ptr(),
                    fds.len() as libc::nfds_t,
                    poll_timeout(timeout),
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::io(err));
            }

            // Completions can be signalled through any of libusb's descriptors, or by a timeout.
            pool.transport_mut().handle_events()?;
            pool.process_completions(state);

            if fds[signal_index].revents & libc::POLLIN != 0 {
                while let Some(signal) = self.signals.read_signal()? {
                    self.on_signal(signal, pool, state);
                }
            }
        }
        Ok(())
    }

    fn on_signal<T: Transport>(
        &mut self,
        signal: c_int,
        pool: &mut TransferPool<T>,
        state: &mut StreamState<'_>,
    ) {
        match state.note_signal() {
            SignalAction::Drain => {
                log::info!(
                    "received signal {}, waiting for {} transfers",
                    signal,
                    pool.outstanding()
                );
                pool.abort_all(state);
            }
            SignalAction::ForceExit => {
                log::error!("received too many signals, exiting without cleanup");
                process::exit(1);
            }
        }
    }
}
