//! Bounded allocator for the endpoint slots that place remote video on screen.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

/// A slot index in `[0, capacity)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointSlot(usize);

impl EndpointSlot {
    pub fn index(self) -> usize {
        self.0
    }

    /// Screen position for the slot's video; position 0 is the local preview.
    pub fn display_index(self) -> usize {
        self.0 + 1
    }
}

impl fmt::Display for EndpointSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("all {capacity} endpoint slots are in use")]
    Exhausted { capacity: usize },
    #[error("endpoint slot {0} is not currently held")]
    NotHeld(EndpointSlot),
    #[error("endpoint slot {slot} is outside a pool of {capacity}")]
    OutOfRange { slot: EndpointSlot, capacity: usize },
}

#[derive(Debug, Clone)]
pub struct EndpointPool {
    capacity: usize,
    free: BTreeSet<usize>,
}

impl EndpointPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: (0..capacity).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.free.len()
    }

    pub fn is_held(&self, slot: EndpointSlot) -> bool {
        slot.0 < self.capacity && !self.free.contains(&slot.0)
    }

    /// Hand out the smallest free slot.
    pub fn allocate(&mut self) -> Result<EndpointSlot, PoolError> {
        self.free
            .pop_first()
            .map(EndpointSlot)
            .ok_or(PoolError::Exhausted {
                capacity: self.capacity,
            })
    }

    /// Return a slot obtained from [`allocate`](Self::allocate). Releasing a slot
    /// that is not held is an error so double releases surface.
    pub fn release(&mut self, slot: EndpointSlot) -> Result<(), PoolError> {
        if slot.0 >= self.capacity {
            return Err(PoolError::OutOfRange {
                slot,
                capacity: self.capacity,
            });
        }
        if !self.free.insert(slot.0) {
            return Err(PoolError::NotHeld(slot));
        }
        Ok(())
    }
}
