//! Stream controller.
//!
//! [`StreamState`] holds everything a single run needs: direction, block size, byte budget, the
//! abort latch and the external byte stream. [`Stream::run`] creates the transfer pool, fills it
//! and hands it to the event loop until every transfer has been returned.
//!
//! [`StreamState`]: struct.StreamState.html
//! [`Stream::run`]: struct.Stream.html#method.run

use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use crate::adapter::{Sink, Source};
use crate::config::Direction;
use crate::pool::TransferPool;
use crate::reactor::{EventLoop, SignalSource};
use crate::transfer::Transport;
use crate::{Error, Result};

/// Number of transfers kept in flight.
pub const DEFAULT_CAPACITY: usize = 32;

/// Timeout of a single bulk transfer.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_millis(1000);

/// Number of termination signals after which the process exits without draining.
pub const MAX_SIGNALS: u32 = 5;

/// Largest block size a single libusb transfer can carry.
pub const MAX_BLOCK_SIZE: usize = i32::max_value() as usize;

/// Number of bytes the stream may still submit.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Budget {
    Unlimited,
    Limited(u64),
}

impl Budget {
    /// Returns whether no further transfer may be submitted.
    pub fn is_exhausted(&self) -> bool {
        *self == Budget::Limited(0)
    }

    /// Returns the length of the next transfer for buffers of `block_size` bytes.
    pub fn next_length(&self, block_size: usize) -> usize {
        match *self {
            Budget::Unlimited => block_size,
            Budget::Limited(n) => n.min(block_size as u64) as usize,
        }
    }

    fn consume(&mut self, n: usize) {
        if let Budget::Limited(remaining) = self {
            *remaining = remaining.saturating_sub(n as u64);
        }
    }
}

/// What to do about a received termination signal.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SignalAction {
    /// Stop submitting and let outstanding transfers finish.
    Drain,
    /// Give up on the outstanding transfers and exit immediately.
    ForceExit,
}

enum Endpoint<'a> {
    In(Box<dyn Sink + 'a>),
    Out(Box<dyn Source + 'a>),
}

/// State of one stream run, shared by the transfer pool and the event loop.
pub struct StreamState<'a> {
    block_size: usize,
    budget: Budget,
    transferred: u64,
    aborting: bool,
    signal_count: u32,
    error: Option<Error>,
    endpoint: Endpoint<'a>,
}

impl<'a> StreamState<'a> {
    fn new(block_size: usize, budget: Budget, endpoint: Endpoint<'a>) -> Self {
        assert!(block_size > 0, "block size must not be zero");
        Self {
            block_size,
            budget,
            transferred: 0,
            aborting: false,
            signal_count: 0,
            error: None,
            endpoint,
        }
    }

    /// Creates the state for a device-to-host stream writing into `sink`.
    pub fn device_to_host(block_size: usize, budget: Budget, sink: impl Sink + 'a) -> Self {
        Self::new(block_size, budget, Endpoint::In(Box::new(sink)))
    }

    /// Creates the state for a host-to-device stream reading from `source`.
    pub fn host_to_device(block_size: usize, budget: Budget, source: impl Source + 'a) -> Self {
        Self::new(block_size, budget, Endpoint::Out(Box::new(source)))
    }

    pub fn direction(&self) -> Direction {
        match self.endpoint {
            Endpoint::In(_) => Direction::DeviceToHost,
            Endpoint::Out(_) => Direction::HostToDevice,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn budget(&self) -> Budget {
        self.budget
    }

    /// Returns the number of bytes that completed transfers have moved.
    pub fn bytes_transferred(&self) -> u64 {
        self.transferred
    }

    /// Returns whether the abort latch is set.
    pub fn is_aborting(&self) -> bool {
        self.aborting
    }

    /// Returns whether a fatal error was recorded.
    pub fn has_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn signal_count(&self) -> u32 {
        self.signal_count
    }

    /// Counts a termination signal and decides how to react to it.
    pub fn note_signal(&mut self) -> SignalAction {
        self.signal_count += 1;
        if self.signal_count >= MAX_SIGNALS {
            SignalAction::ForceExit
        } else {
            SignalAction::Drain
        }
    }

    pub(crate) fn set_aborting(&mut self) -> bool {
        let was = self.aborting;
        self.aborting = true;
        !was
    }

    /// Records a fatal error. Only the first one is kept and returned by `Stream::run`.
    pub(crate) fn fail(&mut self, error: Error) {
        match &self.error {
            None => {
                log::debug!("stream failed: {}", error);
                self.error = Some(error);
            }
            Some(first) => log::debug!("ignoring {} after {}", error, first),
        }
    }

    pub(crate) fn consume_budget(&mut self, n: usize) {
        self.budget.consume(n);
    }

    pub(crate) fn add_transferred(&mut self, n: usize) {
        self.transferred += n as u64;
    }

    /// Called when the source returned `n < block_size` bytes: the next submission is the last.
    pub(crate) fn end_of_stream(&mut self, n: usize) {
        log::debug!("end of input, last transfer is {} bytes", n);
        self.budget = Budget::Limited(n as u64);
    }

    /// Reads the next outgoing block. Device-to-host streams leave `buf` untouched.
    pub(crate) fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.endpoint {
            Endpoint::Out(source) => source.fill(buf),
            Endpoint::In(_) => Ok(buf.len()),
        }
    }

    /// Forwards incoming data. Host-to-device streams ignore it.
    pub(crate) fn drain(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.endpoint {
            Endpoint::In(sink) => sink.drain(data),
            Endpoint::Out(_) => Ok(()),
        }
    }

    fn finish(&mut self) {
        if let Endpoint::In(sink) = &mut self.endpoint {
            if let Err(e) = sink.finish() {
                self.fail(Error::io(e));
            }
        }
    }

    fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }
}

impl fmt::Debug for StreamState<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamState")
            .field("direction", &self.direction())
            .field("block_size", &self.block_size)
            .field("budget", &self.budget)
            .field("transferred", &self.transferred)
            .field("aborting", &self.aborting)
            .field("signal_count", &self.signal_count)
            .field("error", &self.error)
            .finish()
    }
}

/// Throughput summary of a finished stream.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Stats {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl Stats {
    pub fn mib_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes as f64 / secs / (1024.0 * 1024.0)
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transferred {} bytes in {:.2} seconds ({:.2} MiB/s)",
            self.bytes,
            self.elapsed.as_secs_f64(),
            self.mib_per_sec()
        )
    }
}

/// Runs a stream over a [`Transport`].
///
/// [`Transport`]: trait.Transport.html
#[derive(Debug, Copy, Clone)]
pub struct Stream {
    capacity: usize,
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a stream that keeps up to `capacity` transfers in flight.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "stream needs at least one transfer");
        Self { capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Moves data until the budget is exhausted, the source ends, a transfer fails or a
    /// termination signal is received.
    ///
    /// Returns once every transfer has been returned by the transport. A signal-initiated stop
    /// is not an error.
    pub fn run<T: Transport, S: SignalSource>(
        &self,
        transport: T,
        signals: &mut S,
        state: &mut StreamState<'_>,
    ) -> Result<Stats> {
        if state.block_size() > MAX_BLOCK_SIZE {
            return Err(Error::config(format!(
                "block size {} exceeds the maximum of {} bytes",
                state.block_size(),
                MAX_BLOCK_SIZE
            )));
        }
        log::debug!(
            "starting {:?} stream: {} transfers of {} bytes, budget {:?}",
            state.direction(),
            self.capacity,
            state.block_size(),
            state.budget()
        );

        let start = Instant::now();
        let mut pool = TransferPool::new(transport, self.capacity);
        pool.fill(state);

        if let Err(e) = EventLoop::new(signals).run(&mut pool, state) {
            state.fail(e);
        }
        // Cancels and waits for anything still in flight.
        drop(pool);

        let stats = Stats {
            bytes: state.bytes_transferred(),
            elapsed: start.elapsed(),
        };
        state.finish();
        match state.take_error() {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Reader, Writer, Zeros};
    use crate::testutil::{MockTransport, PipeSignals};
    use crate::transfer::TransferStatus;
    use crate::ErrorKind;

    #[test]
    fn budget_arithmetic() {
        let mut budget = Budget::Limited(1000);
        assert_eq!(budget.next_length(512), 512);
        budget.consume(512);
        assert_eq!(budget.next_length(512), 488);
        budget.consume(488);
        assert!(budget.is_exhausted());
        assert_eq!(budget.next_length(512), 0);

        let mut unlimited = Budget::Unlimited;
        unlimited.consume(1 << 20);
        assert!(!unlimited.is_exhausted());
        assert_eq!(unlimited.next_length(512), 512);
    }

    #[test]
    fn fifth_signal_forces_exit() {
        let mut sink = Vec::new();
        let mut state = StreamState::device_to_host(512, Budget::Unlimited, Writer(&mut sink));
        for _ in 0..4 {
            assert_eq!(state.note_signal(), SignalAction::Drain);
        }
        assert_eq!(state.note_signal(), SignalAction::ForceExit);
        assert_eq!(state.signal_count(), 5);
    }

    #[test]
    fn stats_display() {
        let stats = Stats {
            bytes: 3 * 1024 * 1024,
            elapsed: Duration::from_millis(1500),
        };
        assert_eq!(
            stats.to_string(),
            "Transferred 3145728 bytes in 1.50 seconds (2.00 MiB/s)"
        );
        let instant = Stats {
            bytes: 10,
            elapsed: Duration::from_secs(0),
        };
        assert_eq!(instant.mib_per_sec(), 0.0);
    }

    #[test]
    fn limited_in_stream() {
        let mut sink = Vec::new();
        let mut state =
            StreamState::device_to_host(512, Budget::Limited(4096), Writer(&mut sink));
        let mut transport = MockTransport::new();
        transport.fill_byte = 0x5a;
        let mut signals = PipeSignals::new();

        let stats = Stream::with_capacity(4)
            .run(transport, &mut signals, &mut state)
            .unwrap();
        assert_eq!(stats.bytes, 4096);
        drop(state);
        assert_eq!(sink.len(), 4096);
        assert!(sink.iter().all(|b| *b == 0x5a));
    }

    #[test]
    fn out_stream_budget_matches_source() {
        let data: Vec<u8> = (0..1536u32).map(|i| i as u8).collect();
        let mut state =
            StreamState::host_to_device(512, Budget::Limited(1536), Reader(&data[..]));
        let transport = MockTransport::new();
        let log = transport.log();
        let mut signals = PipeSignals::new();

        let stats = Stream::new()
            .run(transport, &mut signals, &mut state)
            .unwrap();

        assert_eq!(stats.bytes, 1536);
        assert!(state.budget().is_exhausted());
        let log = log.borrow();
        assert_eq!(log.submitted.len(), 3);
        let sent: Vec<u8> = log.submitted.iter().flat_map(|s| s.data.clone()).collect();
        assert_eq!(sent, data);
    }

    #[test]
    fn out_stream_short_source() {
        let data = vec![1u8; 1300];
        let mut state = StreamState::host_to_device(512, Budget::Unlimited, Reader(&data[..]));
        let transport = MockTransport::new();
        let log = transport.log();
        let mut signals = PipeSignals::new();

        let stats = Stream::with_capacity(2)
            .run(transport, &mut signals, &mut state)
            .unwrap();

        assert_eq!(stats.bytes, 1300);
        let lengths: Vec<usize> = log.borrow().submitted.iter().map(|s| s.data.len()).collect();
        assert_eq!(lengths, [512, 512, 276]);
    }

    #[test]
    fn failed_transfer_fails_the_run() {
        let mut sink = Vec::new();
        let mut state = StreamState::device_to_host(512, Budget::Unlimited, Writer(&mut sink));
        let mut transport = MockTransport::new();
        transport.script(TransferStatus::Stall, 0);
        let mut signals = PipeSignals::new();

        let err = Stream::with_capacity(4)
            .run(transport, &mut signals, &mut state)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transfer);
        assert!(state.is_aborting());
    }

    #[test]
    fn fail_keeps_first_error() {
        let mut sink = Vec::new();
        let mut state = StreamState::device_to_host(512, Budget::Unlimited, Writer(&mut sink));
        state.fail(Error::other("first"));
        state.fail(Error::config("second"));
        assert!(state.has_failed());
        let err = state.take_error().unwrap();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert!(err.to_string().contains("first"));
    }

    #[test]
    fn oversized_block_is_rejected() {
        let mut state = StreamState::host_to_device(MAX_BLOCK_SIZE + 2, Budget::Unlimited, Zeros);
        let transport = MockTransport::new();
        let log = transport.log();
        let mut signals = PipeSignals::new();

        let err = Stream::new()
            .run(transport, &mut signals, &mut state)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(log.borrow().submitted.is_empty());
        assert_eq!(state.bytes_transferred(), 0);
    }

    #[test]
    fn signal_drains_without_error() {
        let mut sink = Vec::new();
        let mut state = StreamState::device_to_host(512, Budget::Unlimited, Writer(&mut sink));
        let mut transport = MockTransport::new();
        transport.hold = true;
        let log = transport.log();
        let mut signals = PipeSignals::new();
        signals.raise(libc::SIGINT);

        let stats = Stream::with_capacity(8)
            .run(transport, &mut signals, &mut state)
            .unwrap();
        assert_eq!(stats.bytes, 0);
        assert_eq!(state.signal_count(), 1);
        assert_eq!(log.borrow().cancelled.len(), 8);
    }
}
