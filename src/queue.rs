//! Queue of completed asynchronous results awaiting a poll.
//!
//! Results are appended in completion order and handed out one at a time
//! when the sandbox sends `request_async_response`. Nothing is ever pushed
//! to the sandbox unsolicited.
//!
//! # Capacity
//!
//! The queue is bounded. Capacity counts both results already queued and
//! asynchronous calls still running: a call takes a [`Reservation`] before
//! its host operation starts, so a sandbox that never polls cannot grow
//! host memory past `capacity` results.
//!
//! A call refused for lack of a slot is not answered on the channel right away:
//! its `EQUEUEFULL` response goes on a separate refusal list, also bounded by
//! `capacity`, which polls drain before the results.
//!
//! ```
//! use sandbox_passthrough::queue::AsyncResultQueue;
//! use bytes::Bytes;
//!
//! let queue = AsyncResultQueue::new(8);
//! let slot = queue.try_reserve(3).unwrap();
//! slot.complete(Bytes::from_static(b"{}"));
//!
//! let entry = queue.pop().unwrap();
//! assert_eq!(entry.call_id, 3);
//! assert!(queue.pop().is_none());
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use crate::error::{PassthroughError, Result};

/// Default maximum of queued plus in-flight asynchronous results.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A completed asynchronous call waiting to be polled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAsyncResult {
    /// Tag the sandbox chose for the call (always > 0).
    pub call_id: u32,
    /// Encoded response envelope.
    pub payload: Bytes,
}

#[derive(Debug, Default)]
struct State {
    entries: VecDeque<PendingAsyncResult>,
    refused: VecDeque<PendingAsyncResult>,
    in_flight: usize,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    capacity: usize,
}

/// Bounded FIFO of asynchronous completions.
///
/// Cheap to clone; clones share the same queue.
#[derive(Debug, Clone)]
pub struct AsyncResultQueue {
    shared: Arc<Shared>,
}

impl AsyncResultQueue {
    /// Create a queue holding at most `capacity` results (queued + in flight).
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                capacity,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // The state stays consistent even if a holder panicked.
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a finished result directly.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` when no slot is free.
    pub fn push(&self, call_id: u32, payload: Bytes) -> Result<()> {
        let mut state = self.state();
        if state.entries.len() + state.in_flight >= self.shared.capacity {
            return Err(PassthroughError::QueueFull(self.shared.capacity));
        }
        state.entries.push_back(PendingAsyncResult { call_id, payload });
        Ok(())
    }

    /// Reserve a slot for a call that is about to start.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` when no slot is free.
    pub fn try_reserve(&self, call_id: u32) -> Result<Reservation> {
        let mut state = self.state();
        if state.entries.len() + state.in_flight >= self.shared.capacity {
            return Err(PassthroughError::QueueFull(self.shared.capacity));
        }
        state.in_flight += 1;
        Ok(Reservation {
            queue: self.clone(),
            call_id,
            done: false,
        })
    }

    /// Hold the refusal response of a call that found no free slot.
    ///
    /// Returns `false`, dropping the response, if the refusal list is full.
    pub fn refuse(&self, call_id: u32, payload: Bytes) -> bool {
        let mut state = self.state();
        if state.refused.len() >= self.shared.capacity {
            return false;
        }
        state.refused.push_back(PendingAsyncResult { call_id, payload });
        true
    }

    /// Remove and return the oldest refusal, else the oldest result, or
    /// `None` if both are empty.
    pub fn pop(&self) -> Option<PendingAsyncResult> {
        let mut state = self.state();
        match state.refused.pop_front() {
            Some(refusal) => Some(refusal),
            None => state.entries.pop_front(),
        }
    }

    /// Number of results and refusals ready to be polled.
    pub fn len(&self) -> usize {
        let state = self.state();
        state.entries.len() + state.refused.len()
    }

    /// Check if nothing is ready to be polled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of reserved calls that have not completed yet.
    pub fn in_flight(&self) -> usize {
        self.state().in_flight
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Slots still free.
    pub fn available_capacity(&self) -> usize {
        let state = self.state();
        self.shared
            .capacity
            .saturating_sub(state.entries.len() + state.in_flight)
    }
}

impl Default for AsyncResultQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// A slot held by an in-flight asynchronous call.
///
/// Completing the reservation queues the result; dropping it without
/// completing releases the slot.
#[derive(Debug)]
pub struct Reservation {
    queue: AsyncResultQueue,
    call_id: u32,
    done: bool,
}

impl Reservation {
    /// Call id the slot was reserved for.
    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    /// Queue the call's result.
    pub fn complete(mut self, payload: Bytes) {
        let mut state = self.queue.state();
        state.in_flight -= 1;
        state.entries.push_back(PendingAsyncResult {
            call_id: self.call_id,
            payload,
        });
        self.done = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.done {
            self.queue.state().in_flight -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(tag: &str) -> Bytes {
        Bytes::copy_from_slice(tag.as_bytes())
    }

    #[test]
    fn test_fifo_in_push_order() {
        let queue = AsyncResultQueue::new(16);
        for id in [3u32, 1, 2] {
            queue.push(id, payload(&id.to_string())).unwrap();
        }

        let popped: Vec<u32> = (0..3).map(|_| queue.pop().unwrap().call_id).collect();
        assert_eq!(popped, vec![3, 1, 2]);

        // Fourth pop on an empty queue is the empty indicator, not an error.
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_entry_delivered_once() {
        let queue = AsyncResultQueue::new(4);
        queue.push(9, payload("x")).unwrap();

        assert_eq!(queue.pop().unwrap().payload, payload("x"));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_push_rejected_when_full() {
        let queue = AsyncResultQueue::new(2);
        queue.push(1, payload("a")).unwrap();
        queue.push(2, payload("b")).unwrap();

        let err = queue.push(3, payload("c")).unwrap_err();
        assert!(matches!(err, PassthroughError::QueueFull(2)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_reservation_counts_against_capacity() {
        let queue = AsyncResultQueue::new(1);
        let slot = queue.try_reserve(5).unwrap();

        assert_eq!(queue.in_flight(), 1);
        assert_eq!(queue.available_capacity(), 0);
        assert!(queue.try_reserve(6).is_err());

        slot.complete(payload("done"));
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap().call_id, 5);
    }

    #[test]
    fn test_dropped_reservation_releases_slot() {
        let queue = AsyncResultQueue::new(1);
        {
            let _slot = queue.try_reserve(5).unwrap();
            assert_eq!(queue.available_capacity(), 0);
        }
        assert_eq!(queue.available_capacity(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_refusals_polled_before_results() {
        let queue = AsyncResultQueue::new(1);
        let slot = queue.try_reserve(1).unwrap();
        assert!(queue.try_reserve(2).is_err());

        assert!(queue.refuse(2, payload("full")));
        assert_eq!(queue.len(), 1);
        // Refusals do not take result slots.
        assert_eq!(queue.in_flight(), 1);

        slot.complete(payload("done"));
        assert_eq!(queue.pop().unwrap().call_id, 2);
        assert_eq!(queue.pop().unwrap().call_id, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_refusal_list_bounded() {
        let queue = AsyncResultQueue::new(2);
        assert!(queue.refuse(1, payload("a")));
        assert!(queue.refuse(2, payload("b")));
        assert!(!queue.refuse(3, payload("c")));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.available_capacity(), 2);
    }

    #[test]
    fn test_completion_order_not_request_order() {
        let queue = AsyncResultQueue::new(4);
        let slow = queue.try_reserve(1).unwrap();
        let fast = queue.try_reserve(2).unwrap();

        fast.complete(payload("fast"));
        slow.complete(payload("slow"));

        assert_eq!(queue.pop().unwrap().call_id, 2);
        assert_eq!(queue.pop().unwrap().call_id, 1);
    }
}
