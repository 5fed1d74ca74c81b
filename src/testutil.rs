//! In-memory stand-ins for the USB transport and the signal descriptor.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::raw::{c_int, c_void};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use crate::reactor::SignalSource;
use crate::transfer::{Completion, TransferStatus, Transport};
use crate::{Error, Result};

#[derive(Debug)]
pub(crate) struct Submitted {
    pub slot: usize,
    /// Buffer contents at submission time.
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub(crate) struct MockLog {
    pub submitted: Vec<Submitted>,
    pub cancelled: Vec<usize>,
}

struct InFlight {
    slot: usize,
    buffer: *mut u8,
    len: usize,
    cancelled: bool,
}

/// A transport whose transfers finish when `handle_events` is called.
///
/// Transfers complete in submission order with their full length unless an outcome was queued
/// with `script`. Incoming data is `fill_byte`.
pub(crate) struct MockTransport {
    in_flight: VecDeque<InFlight>,
    completions: VecDeque<Completion>,
    outcomes: VecDeque<(TransferStatus, usize)>,
    log: Rc<RefCell<MockLog>>,
    submissions: usize,
    /// Byte written into completed buffers.
    pub fill_byte: u8,
    /// Only cancelled transfers complete.
    pub hold: bool,
    /// Maximum number of transfers completed per `handle_events`.
    pub complete_limit: Option<usize>,
    /// Reject every submission after this many succeeded.
    pub reject_after: Option<usize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            in_flight: VecDeque::new(),
            completions: VecDeque::new(),
            outcomes: VecDeque::new(),
            log: Rc::default(),
            submissions: 0,
            fill_byte: 0,
            hold: false,
            complete_limit: None,
            reject_after: None,
        }
    }

    /// Queues the outcome of the next completed (not cancelled) transfer.
    pub fn script(&mut self, status: TransferStatus, actual_length: usize) {
        self.outcomes.push_back((status, actual_length));
    }

    pub fn log(&self) -> Rc<RefCell<MockLog>> {
        self.log.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn finish(&mut self, transfer: InFlight) {
        let (status, actual_length) = if transfer.cancelled {
            (TransferStatus::Cancelled, 0)
        } else {
            self.outcomes
                .pop_front()
                .unwrap_or((TransferStatus::Completed, transfer.len))
        };
        let actual_length = actual_length.min(transfer.len);
        // SAFETY: the pool keeps the buffer alive until the completion is popped.
        unsafe {
            std::ptr::write_bytes(transfer.buffer, self.fill_byte, actual_length);
        }
        self.completions.push_back(Completion {
            slot: transfer.slot,
            status,
            actual_length,
        });
    }
}

impl Transport for MockTransport {
    unsafe fn submit(&mut self, slot: usize, buffer: &mut [u8]) -> Result<()> {
        if self.reject_after == Some(self.submissions) {
            return Err(Error::usb(rusb::Error::NoDevice));
        }
        assert!(
            self.in_flight.iter().all(|t| t.slot != slot),
            "slot {} submitted twice",
            slot
        );
        self.submissions += 1;
        self.log.borrow_mut().submitted.push(Submitted {
            slot,
            data: buffer.to_vec(),
        });
        self.in_flight.push_back(InFlight {
            slot,
            buffer: buffer.as_mut_ptr(),
            len: buffer.len(),
            cancelled: false,
        });
        Ok(())
    }

    fn cancel(&mut self, slot: usize) {
        if let Some(t) = self.in_flight.iter_mut().find(|t| t.slot == slot) {
            t.cancelled = true;
            self.log.borrow_mut().cancelled.push(slot);
        }
    }

    fn pop_completion(&mut self) -> Option<Completion> {
        self.completions.pop_front()
    }

    fn poll_fds(&self) -> Vec<libc::pollfd> {
        Vec::new()
    }

    fn next_timeout(&self) -> Result<Option<Duration>> {
        Ok(Some(Duration::from_millis(0)))
    }

    fn handle_events(&mut self) -> Result<()> {
        let limit = self.complete_limit.unwrap_or(usize::max_value());
        let mut done = 0;
        let mut waiting = VecDeque::new();
        while let Some(transfer) = self.in_flight.pop_front() {
            if done < limit && (transfer.cancelled || !self.hold) {
                self.finish(transfer);
                done += 1;
            } else {
                waiting.push_back(transfer);
            }
        }
        self.in_flight = waiting;
        Ok(())
    }
}

/// Signals delivered through a pipe: `raise` writes the signal number as one byte.
pub(crate) struct PipeSignals {
    read: RawFd,
    write: RawFd,
}

impl PipeSignals {
    pub fn new() -> Self {
        let mut fds = [0 as c_int; 2];
        // SAFETY: `fds` has room for both ends.
        unsafe {
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
            assert_eq!(libc::fcntl(fds[0], libc::F_SETFL, libc::O_NONBLOCK), 0);
        }
        Self {
            read: fds[0],
            write: fds[1],
        }
    }

    pub fn raise(&mut self, signal: c_int) {
        let byte = signal as u8;
        // SAFETY: writes one byte from a local.
        let n = unsafe { libc::write(self.write, &byte as *const u8 as *const c_void, 1) };
        assert_eq!(n, 1);
    }
}

impl AsRawFd for PipeSignals {
    fn as_raw_fd(&self) -> RawFd {
        self.read
    }
}

impl SignalSource for PipeSignals {
    fn read_signal(&mut self) -> Result<Option<c_int>> {
        let mut byte = 0u8;
        // SAFETY: reads one byte into a local.
        let n = unsafe { libc::read(self.read, &mut byte as *mut u8 as *mut c_void, 1) };
        match n {
            1 => Ok(Some(c_int::from(byte))),
            0 => Ok(None),
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    Ok(None)
                } else {
                    Err(Error::io(err))
                }
            }
        }
    }
}

impl Drop for PipeSignals {
    fn drop(&mut self) {
        // SAFETY: both descriptors are owned.
        unsafe {
            libc::close(self.read);
            libc::close(self.write);
        }
    }
}
