//! Table of live virtual sockets.
//!
//! Ids start after the descriptors the sandbox reserves for stdio and the
//! two channels. A closed id becomes free and the lowest free id is handed
//! out first, so ids stay dense and never collide with a live socket.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{PassthroughError, Result};
use crate::transport::RESERVED_DESCRIPTORS;

use super::socket::VirtualSocket;

/// Id of the first virtual socket.
pub const FIRST_SOCKET_ID: u32 = RESERVED_DESCRIPTORS;

#[derive(Debug, Default)]
struct Slots {
    entries: Vec<Option<Arc<VirtualSocket>>>,
    free: BTreeSet<usize>,
}

/// Arena of virtual sockets indexed by sandbox-visible id.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    slots: Mutex<Slots>,
}

impl ConnectionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate the lowest free id and register a fresh socket under it.
    pub fn open(&self) -> Arc<VirtualSocket> {
        let mut slots = self.slots();
        let index = match slots.free.pop_first() {
            Some(index) => index,
            None => {
                slots.entries.push(None);
                slots.entries.len() - 1
            }
        };
        let socket = Arc::new(VirtualSocket::new(FIRST_SOCKET_ID + index as u32));
        slots.entries[index] = Some(Arc::clone(&socket));
        socket
    }

    /// Look up a live socket.
    ///
    /// # Errors
    ///
    /// Returns `BadDescriptor` for ids that were never issued or are closed.
    pub fn get(&self, id: i64) -> Result<Arc<VirtualSocket>> {
        let index = Self::index_of(id)?;
        self.slots()
            .entries
            .get(index)
            .and_then(Clone::clone)
            .ok_or(PassthroughError::BadDescriptor(id))
    }

    /// Unregister a socket, freeing its id.
    pub fn remove(&self, id: i64) -> Result<Arc<VirtualSocket>> {
        let index = Self::index_of(id)?;
        let mut slots = self.slots();
        let socket = slots
            .entries
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(PassthroughError::BadDescriptor(id))?;
        slots.free.insert(index);
        Ok(socket)
    }

    /// Number of live sockets.
    pub fn len(&self) -> usize {
        let slots = self.slots();
        slots.entries.len() - slots.free.len()
    }

    /// Check if no socket is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn index_of(id: i64) -> Result<usize> {
        id.checked_sub(i64::from(FIRST_SOCKET_ID))
            .and_then(|index| usize::try_from(index).ok())
            .ok_or(PassthroughError::BadDescriptor(id))
    }
}
