//! Call context: where a finished call's response goes.
//!
//! - Synchronous calls (`call_id == 0`) answer on the channel immediately.
//! - Asynchronous calls (`call_id > 0`) hold a queue reservation taken at
//!   admission; their response is queued until the sandbox polls.
//!
//! # Example
//!
//! ```
//! use sandbox_passthrough::handler::{CallContext, CallConvention};
//! use sandbox_passthrough::protocol::{Outcome, Response};
//! use sandbox_passthrough::queue::AsyncResultQueue;
//!
//! let queue = AsyncResultQueue::new(4);
//!
//! let sync = CallContext::admit(CallConvention::from_call_id(0).unwrap(), &queue).unwrap();
//! assert!(sync.respond(&Response::ok(Outcome::Unit)).is_some());
//!
//! let queued = CallContext::admit(CallConvention::from_call_id(9).unwrap(), &queue).unwrap();
//! assert!(queued.respond(&Response::ok(Outcome::Unit)).is_none());
//! assert_eq!(queue.pop().unwrap().call_id, 9);
//! ```

use crate::error::{PassthroughError, Result};
use crate::protocol::{Response, MAX_CALL_ID, SYNC_CALL_ID};
use crate::queue::{AsyncResultQueue, Reservation};
use crate::writer::{encode_response, OutboundFrame};

/// Calling convention selected by the frame's call id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConvention {
    /// Answer on the channel right away.
    Sync,
    /// Queue the answer under this tag.
    Async(u32),
}

impl CallConvention {
    /// Classify a call id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCallId` for ids above `i32::MAX`, which the sandbox
    /// sees as negative.
    pub fn from_call_id(call_id: u32) -> Result<Self> {
        match call_id {
            SYNC_CALL_ID => Ok(CallConvention::Sync),
            id if id <= MAX_CALL_ID => Ok(CallConvention::Async(id)),
            id => Err(PassthroughError::InvalidCallId(i64::from(id as i32))),
        }
    }
}

#[derive(Debug)]
enum Route {
    Immediate,
    Queued(Reservation),
}

/// Delivery route of one admitted call.
#[derive(Debug)]
pub struct CallContext {
    route: Route,
}

impl CallContext {
    /// Admit a call, reserving a queue slot for asynchronous ones.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` when an asynchronous call finds no free slot.
    pub fn admit(convention: CallConvention, queue: &AsyncResultQueue) -> Result<Self> {
        let route = match convention {
            CallConvention::Sync => Route::Immediate,
            CallConvention::Async(call_id) => Route::Queued(queue.try_reserve(call_id)?),
        };
        Ok(Self { route })
    }

    /// Call id responses are tagged with.
    pub fn call_id(&self) -> u32 {
        match &self.route {
            Route::Immediate => SYNC_CALL_ID,
            Route::Queued(slot) => slot.call_id(),
        }
    }

    /// Check if the response will be queued.
    pub fn is_async(&self) -> bool {
        matches!(self.route, Route::Queued(_))
    }

    /// Deliver the response.
    ///
    /// Returns the frame to write now for a synchronous call; an
    /// asynchronous call's response is queued and `None` is returned.
    pub fn respond(self, response: &Response) -> Option<OutboundFrame> {
        let payload = encode_response(response);
        match self.route {
            Route::Immediate => Some(OutboundFrame::new(SYNC_CALL_ID, payload)),
            Route::Queued(slot) => {
                slot.complete(payload);
                None
            }
        }
    }
}
