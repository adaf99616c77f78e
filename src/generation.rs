//! Lock-guarded generation counter used as a cancellation token.
//!
//! A drawing request snapshots the counter when it is created and compares
//! the snapshot against a fresh read at later checkpoints. Any difference
//! means a newer request superseded it and its result must be dropped.

use std::sync::{Mutex, PoisonError};

/// Monotonic counter owned by a single drawing layer.
///
/// Only the three operations below are exposed, so callers can never touch
/// the value without holding the lock.
#[derive(Debug, Default)]
pub struct GenerationCounter {
    value: Mutex<u64>,
}

impl GenerationCounter {
    /// Create a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter and return the value it had before.
    pub fn increment(&self) -> u64 {
        let mut value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = *value;
        *value = previous.wrapping_add(1);
        previous
    }

    /// Decrement the counter and return the value it had before.
    ///
    /// Only meant to undo a matching `increment`.
    pub fn decrement(&self) -> u64 {
        let mut value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = *value;
        *value = previous.wrapping_sub(1);
        previous
    }

    /// Read the current value.
    pub fn read(&self) -> u64 {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
