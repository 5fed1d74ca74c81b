//! Asynchronous bulk transfers.
//!
//! [`Transport`] is the capability the transfer pool and the event loop are written against. The
//! real implementation, [`LibusbTransport`], drives libusb's asynchronous API directly: `rusb`
//! only wraps the synchronous calls.
//!
//! [`Transport`]: trait.Transport.html
//! [`LibusbTransport`]: struct.LibusbTransport.html

use std::cell::RefCell;
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::fmt;
use std::marker::PhantomData;
use std::os::raw::{c_int, c_uint, c_void};
use std::ptr::{self, NonNull};
use std::time::{Duration, Instant};

use rusb::ffi::{self, constants::*};
use rusb::UsbContext;

use crate::port::Port;
use crate::{Error, ErrorKind, Result};

/// Outcome of a finished transfer, as reported by libusb.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl TransferStatus {
    fn from_raw(status: c_int) -> Self {
        match status {
            LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
            LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
            LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
            LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
            LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
            LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
            _ => TransferStatus::Error,
        }
    }

    /// Returns whether the data in the buffer can be used.
    ///
    /// A timed out transfer may still have moved some data.
    pub fn is_success(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::TimedOut)
    }
}

/// A finished transfer, identified by its pool slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Completion {
    pub slot: usize,
    pub status: TransferStatus,
    pub actual_length: usize,
}

/// Asynchronous bulk transfers against a single endpoint.
///
/// Completions are never delivered from within `submit` or `cancel`. They are queued by
/// `handle_events` and retrieved with `pop_completion`, so a slot is never resubmitted before
/// its previous completion has been fully processed.
pub trait Transport {
    /// Starts a transfer of `buffer` on behalf of pool slot `slot`.
    ///
    /// # Safety
    ///
    /// `buffer` must stay valid and must not be accessed by the caller until the completion for
    /// `slot` has been returned by `pop_completion`. A slot may only have one transfer in flight.
    unsafe fn submit(&mut self, slot: usize, buffer: &mut [u8]) -> Result<()>;

    /// Requests cancellation of the transfer in flight for `slot`.
    ///
    /// Cancellation completes asynchronously with status `Cancelled` (or with whatever outcome
    /// the transfer reached first).
    fn cancel(&mut self, slot: usize);

    /// Returns the next queued completion.
    fn pop_completion(&mut self) -> Option<Completion>;

    /// Returns the file descriptors the event loop has to wait on.
    ///
    /// The set may change between calls.
    fn poll_fds(&self) -> Vec<libc::pollfd>;

    /// Returns how long the event loop may sleep before `handle_events` must be called, or `None`
    /// if there is no pending deadline.
    fn next_timeout(&self) -> Result<Option<Duration>>;

    /// Processes pending USB events without blocking, queueing completions.
    fn handle_events(&mut self) -> Result<()>;
}

/// Translates a libusb error code.
pub(crate) fn usb_error(code: c_int) -> rusb::Error {
    match code {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

type CompletionQueue = RefCell<VecDeque<Completion>>;

/// Passed to libusb as a transfer's `user_data`.
struct SlotTag {
    slot: usize,
    completions: *const CompletionQueue,
}

extern "system" fn transfer_callback(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: libusb hands back the transfer we filled in `submit`. Its `user_data` points into
    // `LibusbTransport::tags`, which outlives every transfer (see `Drop`). Callbacks only run
    // inside `handle_events`, while no other borrow of the queue exists.
    unsafe {
        let transfer = &*transfer;
        let tag = &*(transfer.user_data as *const SlotTag);
        (*tag.completions).borrow_mut().push_back(Completion {
            slot: tag.slot,
            status: TransferStatus::from_raw(transfer.status),
            actual_length: transfer.actual_length.max(0) as usize,
        });
    }
}

/// libusb-backed bulk transport for a claimed [`Port`].
///
/// One libusb transfer is allocated per slot up front and reused for every submission.
///
/// [`Port`]: struct.Port.html
pub struct LibusbTransport<'p> {
    ctx: *mut ffi::libusb_context,
    handle: *mut ffi::libusb_device_handle,
    endpoint: u8,
    timeout: Duration,
    transfers: Vec<NonNull<ffi::libusb_transfer>>,
    in_flight: Vec<bool>,
    tags: Box<[SlotTag]>,
    completions: Box<CompletionQueue>,
    _port: PhantomData<&'p Port>,
}

impl<'p> LibusbTransport<'p> {
    /// Prepares `capacity` transfers on `port`'s endpoint, each with a per-transfer `timeout`.
    pub(crate) fn new(port: &'p Port, capacity: usize, timeout: Duration) -> Result<Self> {
        log::debug!(
            "LibusbTransport::new(endpoint = 0x{:02x}, capacity = {}, timeout = {:?})",
            port.endpoint(),
            capacity,
            timeout
        );

        let completions: Box<CompletionQueue> =
            Box::new(RefCell::new(VecDeque::with_capacity(capacity)));
        let queue: *const CompletionQueue = &*completions;
        let tags = (0..capacity)
            .map(|slot| SlotTag {
                slot,
                completions: queue,
            })
            .collect();

        let mut this = Self {
            ctx: rusb::GlobalContext::default().as_raw(),
            handle: port.raw_handle(),
            endpoint: port.endpoint(),
            timeout,
            transfers: Vec::with_capacity(capacity),
            in_flight: vec![false; capacity],
            tags,
            completions,
            _port: PhantomData,
        };

        for _ in 0..capacity {
            // SAFETY: plain allocation, freed in `Drop`.
            let transfer = unsafe { ffi::libusb_alloc_transfer(0) };
            match NonNull::new(transfer) {
                Some(transfer) => this.transfers.push(transfer),
                None => {
                    return Err(Error::new(
                        ErrorKind::Alloc,
                        "libusb could not allocate a transfer",
                    ))
                }
            }
        }

        Ok(this)
    }

    fn in_flight_count(&self) -> usize {
        self.in_flight.iter().filter(|f| **f).count()
    }

    fn handle_events_timeout(&mut self, timeout: Duration) -> c_int {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        // SAFETY: `ctx` is the context the device was opened in. Callbacks only touch `tags` and
        // `completions`, which are not borrowed here.
        unsafe { ffi::libusb_handle_events_timeout_completed(self.ctx, &tv, ptr::null_mut()) }
    }
}

impl Transport for LibusbTransport<'_> {
    unsafe fn submit(&mut self, slot: usize, buffer: &mut [u8]) -> Result<()> {
        debug_assert!(!self.in_flight[slot], "slot {} submitted twice", slot);

        let length = c_int::try_from(buffer.len())
            .map_err(|_| Error::usb(rusb::Error::InvalidParam))?;
        let transfer = self.transfers[slot].as_ptr();
        ffi::libusb_fill_bulk_transfer(
            transfer,
            self.handle,
            self.endpoint,
            buffer.as_mut_ptr(),
            length,
            transfer_callback,
            &self.tags[slot] as *const SlotTag as *mut c_void,
            self.timeout.as_millis() as c_uint,
        );

        let rc = ffi::libusb_submit_transfer(transfer);
        if rc != 0 {
            return Err(Error::usb(usb_error(rc)));
        }
        self.in_flight[slot] = true;
        Ok(())
    }

    fn cancel(&mut self, slot: usize) {
        if !self.in_flight[slot] {
            return;
        }
        // SAFETY: the transfer was submitted and has not been reported complete yet.
        let rc = unsafe { ffi::libusb_cancel_transfer(self.transfers[slot].as_ptr()) };
        if rc != 0 && rc != LIBUSB_ERROR_NOT_FOUND {
            log::warn!("cancelling transfer {}: {}", slot, usb_error(rc));
        }
    }

    fn pop_completion(&mut self) -> Option<Completion> {
        let completion = self.completions.borrow_mut().pop_front()?;
        self.in_flight[completion.slot] = false;
        Some(completion)
    }

    fn poll_fds(&self) -> Vec<libc::pollfd> {
        let mut fds = Vec::new();
        // SAFETY: the returned list is NULL-terminated and freed below.
        unsafe {
            let list = ffi::libusb_get_pollfds(self.ctx);
            if list.is_null() {
                return fds;
            }
            let mut entry = list;
            while !(*entry).is_null() {
                let pfd = &**entry;
                fds.push(libc::pollfd {
                    fd: pfd.fd,
                    events: pfd.events,
                    revents: 0,
                });
                entry = entry.add(1);
            }
            ffi::libusb_free_pollfds(list);
        }
        fds
    }

    fn next_timeout(&self) -> Result<Option<Duration>> {
        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        // SAFETY: `tv` is a valid out-pointer.
        let rc = unsafe { ffi::libusb_get_next_timeout(self.ctx, &mut tv) };
        match rc {
            0 => Ok(None),
            1 => Ok(Some(
                Duration::from_secs(tv.tv_sec.max(0) as u64)
                    + Duration::from_micros(tv.tv_usec.max(0) as u64),
            )),
            err => Err(Error::usb(usb_error(err))),
        }
    }

    fn handle_events(&mut self) -> Result<()> {
        let rc = self.handle_events_timeout(Duration::from_secs(0));
        if rc < 0 && rc != LIBUSB_ERROR_INTERRUPTED {
            return Err(Error::usb(usb_error(rc)));
        }
        Ok(())
    }
}

impl Drop for LibusbTransport<'_> {
    fn drop(&mut self) {
        // Transfers still in flight reference `tags` and buffers owned by the caller, so they have
        // to finish before anything is freed.
        for slot in 0..self.transfers.len() {
            self.cancel(slot);
        }
        let deadline = Instant::now() + self.timeout * 2;
        while self.in_flight_count() > 0 && Instant::now() < deadline {
            if self.handle_events_timeout(Duration::from_millis(100)) < 0 {
                break;
            }
            while self.pop_completion().is_some() {}
        }

        let stuck = self.in_flight_count();
        if stuck > 0 {
            log::error!("{} transfers did not finish, leaking them", stuck);
            std::mem::forget(std::mem::take(&mut self.tags));
            std::mem::forget(std::mem::replace(
                &mut self.completions,
                Box::new(RefCell::new(VecDeque::new())),
            ));
        }

        for (slot, transfer) in self.transfers.iter().enumerate() {
            if !self.in_flight[slot] {
                // SAFETY: allocated in `new` and no longer in use.
                unsafe { ffi::libusb_free_transfer(transfer.as_ptr()) };
            }
        }
    }
}

impl fmt::Debug for LibusbTransport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibusbTransport")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("capacity", &self.transfers.len())
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}
