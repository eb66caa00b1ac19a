//! Backend port allocation
//!
//! Ports are leased from a fixed range `[start, start + size)`. Each slot holds
//! the id of the app that leased it. Allocation walks the slots from a rotating
//! cursor and gives up after one full pass, so it is bounded by the pool size.

use crate::error::{OrchestratorError, Result};
use parking_lot::Mutex;
use tracing::debug;

struct AllocatorState {
    /// One slot per port in the range, `Some(app_id)` when leased
    slots: Vec<Option<String>>,
    /// Next slot to probe
    cursor: usize,
    leased: usize,
}

/// Hands out unique backend ports
pub struct PortAllocator {
    start: u16,
    state: Mutex<AllocatorState>,
}

impl PortAllocator {
    /// Create an allocator over `[start, start + size)`.
    ///
    /// The range is clamped to the valid port space.
    pub fn new(start: u16, size: u16) -> Self {
        let available = (u16::MAX - start) as usize + 1;
        let size = (size as usize).min(available);
        Self {
            start,
            state: Mutex::new(AllocatorState {
                slots: vec![None; size],
                cursor: 0,
                leased: 0,
            }),
        }
    }

    /// Number of ports in the pool
    pub fn capacity(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Number of ports currently leased
    pub fn leased_count(&self) -> usize {
        self.state.lock().leased
    }

    /// Lease a free port to `app_id`
    pub fn allocate(&self, app_id: &str) -> Result<u16> {
        let mut state = self.state.lock();
        let capacity = state.slots.len();

        for probe in 0..capacity {
            let index = (state.cursor + probe) % capacity;
            if state.slots[index].is_none() {
                state.slots[index] = Some(app_id.to_string());
                state.cursor = (index + 1) % capacity;
                state.leased += 1;
                let port = self.start + index as u16;
                debug!(app_id, port, leased = state.leased, "Port leased");
                return Ok(port);
            }
        }

        Err(OrchestratorError::PortExhausted {
            start: self.start,
            end: self.start as u32 + capacity as u32,
        })
    }

    /// Release a port. Releasing a port that is not leased is a no-op.
    pub fn release(&self, port: u16) {
        let Some(index) = self.index_of(port) else {
            return;
        };
        let mut state = self.state.lock();
        if let Some(app_id) = state.slots[index].take() {
            state.leased -= 1;
            debug!(app_id, port, leased = state.leased, "Port released");
        }
    }

    /// The app id currently holding `port`, if any
    pub fn lessee(&self, port: u16) -> Option<String> {
        let index = self.index_of(port)?;
        self.state.lock().slots[index].clone()
    }

    fn index_of(&self, port: u16) -> Option<usize> {
        let index = port.checked_sub(self.start)? as usize;
        (index < self.capacity()).then_some(index)
    }
}
