//! Shared block layout and bounded queues.
//!
//! ```text
//!   client ── try_push ──► [ commands ] ── pop ──► server
//!   client ◄── pop ─────── [ replies  ] ◄─ try_push ── server
//! ```
//!
//! Both rings are bounded. A full command ring is reported to the client as
//! [`ShmError::QueueFull`]; the server stops draining commands while the
//! reply ring is full, so no reply is ever dropped.

use std::collections::VecDeque;

use crate::error::{Result, ShmError};
use crate::protocol::{ServerReply, SharedMemoryCommand};

/// Marks a block initialized by a server.
pub const SHARED_MEMORY_MAGIC_NUMBER: u32 = 64738;

/// Default region key.
pub const SHARED_MEMORY_KEY: i32 = 12347;

/// Capacity of the Q and U arrays.
pub const MAX_DEGREE_OF_FREEDOM: usize = 256;

/// Default ring capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Fixed-capacity FIFO.
#[derive(Debug, Clone)]
pub struct CommandQueue<T> {
    capacity: usize,
    slots: VecDeque<T>,
}

impl<T> CommandQueue<T> {
    /// Creates an empty queue holding at most `capacity` items (at least 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            slots: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Maximum number of items.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns true if no slot is free.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// Append an item.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::QueueFull`] when no slot is free; the item is
    /// dropped and the queue is unchanged.
    pub fn try_push(&mut self, item: T) -> Result<()> {
        if self.is_full() {
            return Err(ShmError::QueueFull {
                capacity: self.capacity,
            });
        }
        self.slots.push_back(item);
        Ok(())
    }

    /// Remove the oldest item.
    pub fn pop(&mut self) -> Option<T> {
        self.slots.pop_front()
    }

    /// Oldest item, if any.
    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        self.slots.front()
    }

    /// Drop every item.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// The region shared by client and server.
#[derive(Debug, Clone)]
pub struct SharedMemoryBlock {
    /// [`SHARED_MEMORY_MAGIC_NUMBER`] once a server has initialized the block.
    pub magic_id: u32,
    /// Client to server ring.
    pub commands: CommandQueue<SharedMemoryCommand>,
    /// Server to client ring.
    pub replies: CommandQueue<ServerReply>,
    /// Commands pushed by the client.
    pub num_client_commands: u64,
    /// Commands consumed by the server.
    pub num_processed_client_commands: u64,
    /// Replies pushed by the server.
    pub num_server_commands: u64,
    /// Replies consumed by the client.
    pub num_processed_server_commands: u64,
    /// Generalized coordinates of the last state reply.
    pub actual_state_q: [f64; MAX_DEGREE_OF_FREEDOM],
    /// Generalized velocities of the last state reply.
    pub actual_state_u: [f64; MAX_DEGREE_OF_FREEDOM],
}

impl SharedMemoryBlock {
    /// Uninitialized block with rings of `capacity` slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            magic_id: 0,
            commands: CommandQueue::new(capacity),
            replies: CommandQueue::new(capacity),
            num_client_commands: 0,
            num_processed_client_commands: 0,
            num_server_commands: 0,
            num_processed_server_commands: 0,
            actual_state_q: [0.0; MAX_DEGREE_OF_FREEDOM],
            actual_state_u: [0.0; MAX_DEGREE_OF_FREEDOM],
        }
    }

    /// Returns true once a server has initialized the block.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.magic_id == SHARED_MEMORY_MAGIC_NUMBER
    }

    /// Reset counters and rings and stamp the magic number.
    pub fn initialize(&mut self) {
        self.commands.clear();
        self.replies.clear();
        self.num_client_commands = 0;
        self.num_processed_client_commands = 0;
        self.num_server_commands = 0;
        self.num_processed_server_commands = 0;
        self.magic_id = SHARED_MEMORY_MAGIC_NUMBER;
    }

    /// Commands pushed but not yet consumed.
    #[must_use]
    pub const fn pending_commands(&self) -> u64 {
        self.num_client_commands
            .saturating_sub(self.num_processed_client_commands)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_backpressure() {
        let mut q = CommandQueue::new(2);
        q.try_push(1).unwrap();
        q.try_push(2).unwrap();
        assert!(q.is_full());
        assert!(matches!(q.try_push(3), Err(ShmError::QueueFull { capacity: 2 })));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(), Some(1));
        q.try_push(3).unwrap();
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut q = CommandQueue::new(0);
        assert_eq!(q.capacity(), 1);
        q.try_push('a').unwrap();
        assert!(q.try_push('b').is_err());
        assert_eq!(q.peek(), Some(&'a'));
    }

    #[test]
    fn test_block_initialize() {
        let mut block = SharedMemoryBlock::new(4);
        assert!(!block.is_initialized());
        block.num_client_commands = 5;
        block.initialize();
        assert!(block.is_initialized());
        assert_eq!(block.magic_id, 64738);
        assert_eq!(block.num_client_commands, 0);
        assert_eq!(block.pending_commands(), 0);
        assert_eq!(block.actual_state_q.len(), MAX_DEGREE_OF_FREEDOM);
    }
}
