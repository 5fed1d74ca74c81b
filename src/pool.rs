//! Transfer pool.
//!
//! The pool owns one buffer per slot. A slot's buffer is either owned by the pool, lent to the
//! transport while its transfer is in flight, or freed once the slot is retired. Retired slots
//! are never reused, so the pool shrinks to zero once submission stops.

use std::fmt;

use crate::config::Direction;
use crate::stream::StreamState;
use crate::transfer::{Completion, Transport};
use crate::{Error, ErrorKind, Result};

/// Current owner of a slot's buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Owner {
    Pool,
    Device,
    Freed,
}

struct Slot {
    buffer: Box<[u8]>,
    length: usize,
    owner: Owner,
}

/// A bounded set of bulk transfers that are resubmitted as they complete.
pub struct TransferPool<T> {
    // Must drop before `slots`: in-flight transfers point into the slot buffers.
    transport: T,
    slots: Vec<Slot>,
    capacity: usize,
    outstanding: usize,
}

impl<T: Transport> TransferPool<T> {
    pub fn new(transport: T, capacity: usize) -> Self {
        Self {
            transport,
            slots: Vec::with_capacity(capacity),
            capacity,
            outstanding: 0,
        }
    }

    /// Returns the number of transfers currently owned by the transport.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns who owns the buffer of `slot`, or `None` if the slot was never created.
    pub fn owner(&self, slot: usize) -> Option<Owner> {
        self.slots.get(slot).map(|s| s.owner)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Submits transfers until the pool is at capacity or submission stops.
    ///
    /// A submission error is recorded in `state` and aborts the pool.
    pub fn fill(&mut self, state: &mut StreamState<'_>) {
        loop {
            match self.submit(state) {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    state.fail(e);
                    self.abort_all(state);
                    break;
                }
            }
        }
    }

    /// Creates a new slot and submits its first transfer.
    ///
    /// Returns the slot index, or `None` if nothing was submitted because the pool is full,
    /// aborting, out of budget, or the source is exhausted. On error nothing is added to the
    /// pool and no budget is consumed.
    pub fn submit(&mut self, state: &mut StreamState<'_>) -> Result<Option<usize>> {
        if self.slots.len() >= self.capacity
            || state.is_aborting()
            || state.budget().is_exhausted()
        {
            return Ok(None);
        }

        let block_size = state.block_size();
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(block_size).map_err(|e| {
            Error::new(
                ErrorKind::Alloc,
                format!("{} byte transfer buffer: {}", block_size, e),
            )
        })?;
        buffer.resize(block_size, 0);
        let mut buffer = buffer.into_boxed_slice();

        let mut length = state.budget().next_length(block_size);
        if state.direction() == Direction::HostToDevice {
            let n = state.fill(&mut buffer[..length]).map_err(Error::io)?;
            if n < length {
                state.end_of_stream(n);
                if n == 0 {
                    return Ok(None);
                }
                length = n;
            }
        }

        let index = self.slots.len();
        self.slots.push(Slot {
            buffer,
            length,
            owner: Owner::Pool,
        });

        // SAFETY: the slot is new and its buffer stays in place until the transport reports the
        // completion; `transport` is dropped before `slots`.
        let submitted = unsafe {
            let slot = &mut self.slots[index];
            self.transport.submit(index, &mut slot.buffer[..length])
        };
        if let Err(e) = submitted {
            self.slots.pop();
            return Err(e);
        }

        log::trace!("submitted transfer {} ({} bytes)", index, length);
        self.slots[index].owner = Owner::Device;
        self.outstanding += 1;
        state.consume_budget(length);
        Ok(Some(index))
    }

    /// Handles one finished transfer: forwards its data, then refills and resubmits it or
    /// retires the slot.
    pub fn on_complete(&mut self, state: &mut StreamState<'_>, completion: Completion) {
        let index = completion.slot;
        {
            let slot = &mut self.slots[index];
            debug_assert_eq!(slot.owner, Owner::Device, "completion for idle slot {}", index);
            slot.owner = Owner::Pool;
        }
        log::trace!("{:?}", completion);

        if state.is_aborting() {
            self.retire(index);
            return;
        }

        let requested = self.slots[index].length;
        if !completion.status.is_success() || completion.actual_length == 0 {
            self.retire(index);
            state.fail(Error::new(
                ErrorKind::Transfer,
                format!(
                    "transfer {} finished with status {:?} after {} of {} bytes",
                    index, completion.status, completion.actual_length, requested
                ),
            ));
            self.abort_all(state);
            return;
        }

        let actual = completion.actual_length.min(requested);
        if state.direction() == Direction::DeviceToHost {
            if let Err(e) = state.drain(&self.slots[index].buffer[..actual]) {
                self.retire(index);
                state.fail(Error::io(e));
                self.abort_all(state);
                return;
            }
        }
        state.add_transferred(actual);
        if actual < requested {
            log::warn!(
                "short transfer {}: {} of {} bytes",
                index,
                actual,
                requested
            );
        }

        if state.budget().is_exhausted() {
            self.retire(index);
            return;
        }

        let mut length = state.budget().next_length(state.block_size());
        if state.direction() == Direction::HostToDevice {
            match state.fill(&mut self.slots[index].buffer[..length]) {
                Ok(n) if n < length => {
                    state.end_of_stream(n);
                    if n == 0 {
                        self.retire(index);
                        return;
                    }
                    length = n;
                }
                Ok(_) => {}
                Err(e) => {
                    self.retire(index);
                    state.fail(Error::io(e));
                    self.abort_all(state);
                    return;
                }
            }
        }

        // SAFETY: the completion returned the buffer to the pool, see `submit`.
        let resubmitted = unsafe {
            let slot = &mut self.slots[index];
            slot.length = length;
            self.transport.submit(index, &mut slot.buffer[..length])
        };
        match resubmitted {
            Ok(()) => {
                self.slots[index].owner = Owner::Device;
                state.consume_budget(length);
            }
            Err(e) => {
                self.retire(index);
                state.fail(e);
                self.abort_all(state);
            }
        }
    }

    /// Dispatches every queued completion. Returns how many were handled.
    pub fn process_completions(&mut self, state: &mut StreamState<'_>) -> usize {
        let mut handled = 0;
        while let Some(completion) = self.transport.pop_completion() {
            self.on_complete(state, completion);
            handled += 1;
        }
        handled
    }

    /// Sets the abort latch and requests cancellation of every outstanding transfer.
    ///
    /// Does not wait: the slots are retired as their completions arrive.
    pub fn abort_all(&mut self, state: &mut StreamState<'_>) {
        if !state.set_aborting() {
            return;
        }
        log::debug!("aborting {} outstanding transfers", self.outstanding);
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.owner == Owner::Device {
                self.transport.cancel(index);
            }
        }
    }

    fn retire(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        debug_assert_eq!(slot.owner, Owner::Pool);
        slot.owner = Owner::Freed;
        slot.buffer = Box::new([]);
        self.outstanding -= 1;
        log::trace!("retired transfer {}, {} outstanding", index, self.outstanding);
    }
}

impl<T: fmt::Debug> fmt::Debug for TransferPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferPool")
            .field("transport", &self.transport)
            .field("capacity", &self.capacity)
            .field("slots", &self.slots.len())
            .field("outstanding", &self.outstanding)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Discard, Reader, Writer, Zeros};
    use crate::stream::Budget;
    use crate::testutil::MockTransport;
    use crate::transfer::TransferStatus;

    fn run_until_idle<T: Transport>(pool: &mut TransferPool<T>, state: &mut StreamState<'_>) {
        while pool.outstanding() > 0 {
            pool.transport_mut().handle_events().unwrap();
            pool.process_completions(state);
        }
    }

    #[test]
    fn keeps_pool_at_capacity() {
        let mut sink = Vec::new();
        let mut state = StreamState::device_to_host(4096, Budget::Unlimited, Writer(&mut sink));
        let mut transport = MockTransport::new();
        transport.fill_byte = 0xa5;
        transport.complete_limit = Some(1);
        let log = transport.log();
        let mut pool = TransferPool::new(transport, 32);

        pool.fill(&mut state);
        assert_eq!(pool.outstanding(), 32);
        assert_eq!(log.borrow().submitted.len(), 32);

        pool.transport_mut().handle_events().unwrap();
        assert_eq!(pool.process_completions(&mut state), 1);

        assert_eq!(state.bytes_transferred(), 4096);
        assert_eq!(pool.outstanding(), 32);
        assert_eq!(pool.owner(0), Some(Owner::Device));
        let log = log.borrow();
        assert_eq!(log.submitted.len(), 33);
        assert_eq!(log.submitted[32].slot, 0);
        drop(log);
        drop(pool);
        drop(state);
        assert_eq!(sink, vec![0xa5; 4096]);
    }

    #[test]
    fn exact_budget_out() {
        let data = vec![7u8; 1536];
        let mut state =
            StreamState::host_to_device(512, Budget::Limited(1536), Reader(&data[..]));
        let transport = MockTransport::new();
        let log = transport.log();
        let mut pool = TransferPool::new(transport, 32);

        pool.fill(&mut state);
        assert_eq!(pool.outstanding(), 3);
        assert!(state.budget().is_exhausted());

        run_until_idle(&mut pool, &mut state);
        assert_eq!(log.borrow().submitted.len(), 3);
        assert_eq!(state.bytes_transferred(), 1536);
        assert!(!state.has_failed());
    }

    #[test]
    fn short_source_ends_stream() {
        let data = vec![3u8; 1000];
        let mut state = StreamState::host_to_device(512, Budget::Unlimited, Reader(&data[..]));
        let transport = MockTransport::new();
        let log = transport.log();
        let mut pool = TransferPool::new(transport, 32);

        pool.fill(&mut state);
        // One full block and one short final block, then the source is exhausted.
        assert_eq!(pool.outstanding(), 2);
        assert_eq!(state.budget(), Budget::Limited(0));

        run_until_idle(&mut pool, &mut state);
        let lengths: Vec<usize> = log.borrow().submitted.iter().map(|s| s.data.len()).collect();
        assert_eq!(lengths, [512, 488]);
        assert_eq!(state.bytes_transferred(), 1000);
        assert!(!state.has_failed());
    }

    #[test]
    fn empty_source_submits_nothing() {
        let mut state = StreamState::host_to_device(512, Budget::Unlimited, Reader(&b""[..]));
        let mut pool = TransferPool::new(MockTransport::new(), 4);

        assert_eq!(pool.submit(&mut state).unwrap(), None);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.owner(0), None);
        assert!(state.budget().is_exhausted());
    }

    #[test]
    fn zeros_source_fills_every_block() {
        let mut state = StreamState::host_to_device(64, Budget::Limited(256), Zeros);
        let transport = MockTransport::new();
        let log = transport.log();
        let mut pool = TransferPool::new(transport, 2);

        pool.fill(&mut state);
        run_until_idle(&mut pool, &mut state);
        let log = log.borrow();
        assert_eq!(log.submitted.len(), 4);
        assert!(log.submitted.iter().all(|s| s.data == [0; 64]));
    }

    #[test]
    fn error_completion_aborts() {
        let mut state = StreamState::device_to_host(512, Budget::Unlimited, Discard);
        let mut transport = MockTransport::new();
        transport.complete_limit = Some(1);
        transport.script(TransferStatus::Error, 0);
        let log = transport.log();
        let mut pool = TransferPool::new(transport, 4);

        pool.fill(&mut state);
        pool.transport_mut().handle_events().unwrap();
        pool.process_completions(&mut state);

        assert!(state.is_aborting());
        assert!(state.has_failed());
        assert_eq!(pool.owner(0), Some(Owner::Freed));
        assert_eq!(pool.outstanding(), 3);
        assert_eq!(log.borrow().cancelled, [1, 2, 3]);

        run_until_idle(&mut pool, &mut state);
        assert_eq!(log.borrow().submitted.len(), 4);
        assert_eq!(state.bytes_transferred(), 0);
    }

    #[test]
    fn short_sink_write_aborts() {
        let mut buf = [0u8; 600];
        let mut state =
            StreamState::device_to_host(512, Budget::Unlimited, Writer(&mut buf[..]));
        let mut transport = MockTransport::new();
        transport.complete_limit = Some(1);
        let log = transport.log();
        let mut pool = TransferPool::new(transport, 3);

        pool.fill(&mut state);
        pool.transport_mut().handle_events().unwrap();
        pool.process_completions(&mut state);
        assert!(!state.has_failed());
        assert_eq!(log.borrow().submitted.len(), 4);

        // Only 88 bytes of the second block fit into the sink.
        pool.transport_mut().handle_events().unwrap();
        pool.process_completions(&mut state);
        assert!(state.has_failed());
        assert!(state.is_aborting());
        assert_eq!(pool.owner(1), Some(Owner::Freed));
        assert_eq!(pool.outstanding(), 2);
        assert_eq!(log.borrow().cancelled.len(), 2);

        run_until_idle(&mut pool, &mut state);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(log.borrow().submitted.len(), 4);
        assert_eq!(state.bytes_transferred(), 512);
    }

    #[test]
    fn zero_length_completion_is_fatal() {
        let mut state = StreamState::device_to_host(512, Budget::Unlimited, Discard);
        let mut transport = MockTransport::new();
        transport.script(TransferStatus::Completed, 0);
        let mut pool = TransferPool::new(transport, 1);

        pool.fill(&mut state);
        run_until_idle(&mut pool, &mut state);
        assert!(state.has_failed());
    }

    #[test]
    fn timed_out_partial_is_data() {
        let mut sink = Vec::new();
        let mut state =
            StreamState::device_to_host(512, Budget::Limited(512), Writer(&mut sink));
        let mut transport = MockTransport::new();
        transport.script(TransferStatus::TimedOut, 100);
        let mut pool = TransferPool::new(transport, 1);

        pool.fill(&mut state);
        run_until_idle(&mut pool, &mut state);
        assert!(!state.has_failed());
        assert_eq!(state.bytes_transferred(), 100);
        drop(pool);
        drop(state);
        assert_eq!(sink.len(), 100);
    }

    #[test]
    fn abort_converges() {
        let mut state = StreamState::device_to_host(512, Budget::Unlimited, Discard);
        let mut transport = MockTransport::new();
        transport.hold = true;
        let log = transport.log();
        let mut pool = TransferPool::new(transport, 5);

        pool.fill(&mut state);
        pool.abort_all(&mut state);
        pool.abort_all(&mut state);
        assert_eq!(log.borrow().cancelled.len(), 5);

        run_until_idle(&mut pool, &mut state);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(log.borrow().submitted.len(), 5);
        assert!(!state.has_failed());
        assert!((0..5).all(|i| pool.owner(i) == Some(Owner::Freed)));
    }

    #[test]
    fn rejected_submission() {
        let mut state = StreamState::device_to_host(512, Budget::Limited(4096), Discard);
        let mut transport = MockTransport::new();
        transport.reject_after = Some(2);
        let mut pool = TransferPool::new(transport, 4);

        pool.fill(&mut state);
        assert!(state.has_failed());
        assert!(state.is_aborting());
        assert_eq!(pool.outstanding(), 2);
        // The rejected transfer consumed no budget.
        assert_eq!(state.budget(), Budget::Limited(3072));

        run_until_idle(&mut pool, &mut state);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn ownership_is_exclusive() {
        let mut state = StreamState::device_to_host(256, Budget::Limited(2048), Discard);
        let mut transport = MockTransport::new();
        transport.complete_limit = Some(1);
        let mut pool = TransferPool::new(transport, 3);

        pool.fill(&mut state);
        while pool.outstanding() > 0 {
            let in_flight = (0..3)
                .filter(|&i| pool.owner(i) == Some(Owner::Device))
                .count();
            assert_eq!(in_flight, pool.outstanding());
            assert_eq!(in_flight, pool.transport().in_flight());
            pool.transport_mut().handle_events().unwrap();
            pool.process_completions(&mut state);
        }
        assert_eq!(state.bytes_transferred(), 2048);
    }
}
