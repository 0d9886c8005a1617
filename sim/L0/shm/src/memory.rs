//! Shared-memory providers.
//!
//! A provider maps a key to a [`SharedBlock`]. Allocating an existing key
//! attaches to the same block, so a client and a server built on the same
//! provider talk through one region.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hashbrown::HashMap;
use tracing::debug;

use crate::block::SharedMemoryBlock;
use crate::error::{Result, ShmError};

/// Handle to a shared block.
#[derive(Debug, Clone)]
pub struct SharedBlock(Arc<Mutex<SharedMemoryBlock>>);

impl SharedBlock {
    /// Wrap a block.
    #[must_use]
    pub fn new(block: SharedMemoryBlock) -> Self {
        Self(Arc::new(Mutex::new(block)))
    }

    /// Lock the block.
    ///
    /// A peer that panicked while holding the lock leaves plain data behind,
    /// so a poisoned lock is entered anyway.
    pub fn lock(&self) -> MutexGuard<'_, SharedMemoryBlock> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true if both handles refer to the same region.
    #[must_use]
    pub fn same_region(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Allocates and releases shared regions by key.
pub trait SharedMemoryInterface: Send + Sync {
    /// Create or attach to the region for `key`, with rings of `capacity`
    /// slots when created.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::AllocationFailed`] when the region cannot be
    /// provided.
    fn allocate(&self, key: i32, capacity: usize) -> Result<SharedBlock>;

    /// Detach from and free the region for `key`.
    fn release(&self, key: i32);
}

/// Regions living in this process, shared through cloned handles.
#[derive(Debug, Clone, Default)]
pub struct InProcessSharedMemory {
    regions: Arc<Mutex<HashMap<i32, SharedBlock>>>,
}

impl InProcessSharedMemory {
    /// Empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn regions(&self) -> MutexGuard<'_, HashMap<i32, SharedBlock>> {
        self.regions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach to an existing region without creating it.
    #[must_use]
    pub fn attach(&self, key: i32) -> Option<SharedBlock> {
        self.regions().get(&key).cloned()
    }

    /// Returns true if a region exists for `key`.
    #[must_use]
    pub fn contains(&self, key: i32) -> bool {
        self.regions().contains_key(&key)
    }
}

impl SharedMemoryInterface for InProcessSharedMemory {
    fn allocate(&self, key: i32, capacity: usize) -> Result<SharedBlock> {
        if capacity == 0 {
            return Err(ShmError::allocation_failed(key, "zero capacity"));
        }
        let block = self
            .regions()
            .entry(key)
            .or_insert_with(|| {
                debug!(key, capacity, "created shared region");
                SharedBlock::new(SharedMemoryBlock::new(capacity))
            })
            .clone();
        Ok(block)
    }

    fn release(&self, key: i32) {
        if self.regions().remove(&key).is_some() {
            debug!(key, "released shared region");
        }
    }
}
