//! Physics client: submits commands and polls replies.

use tracing::debug;

use crate::block::{MAX_DEGREE_OF_FREEDOM, SHARED_MEMORY_KEY};
use crate::error::{Result, ShmError};
use crate::memory::{SharedBlock, SharedMemoryInterface};
use crate::protocol::{ClientCommand, ServerReply};

/// Client side of a shared block.
#[derive(Debug, Clone)]
pub struct PhysicsClient {
    block: SharedBlock,
    key: i32,
}

impl PhysicsClient {
    /// Attach to the region a server initialized under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::AllocationFailed`] if the region cannot be
    /// attached, or [`ShmError::NotInitialized`] if no server has stamped it.
    pub fn connect(memory: &dyn SharedMemoryInterface, key: i32, capacity: usize) -> Result<Self> {
        let block = memory.allocate(key, capacity)?;
        if !block.lock().is_initialized() {
            return Err(ShmError::NotInitialized(key));
        }
        debug!(key, "client connected");
        Ok(Self { block, key })
    }

    /// Attach with the default key.
    ///
    /// # Errors
    ///
    /// See [`PhysicsClient::connect`].
    pub fn connect_default(memory: &dyn SharedMemoryInterface) -> Result<Self> {
        Self::connect(memory, SHARED_MEMORY_KEY, crate::block::DEFAULT_QUEUE_CAPACITY)
    }

    /// Region key.
    #[must_use]
    pub const fn key(&self) -> i32 {
        self.key
    }

    /// Queue a command and return its sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::NotInitialized`] once the server has released the
    /// region, or [`ShmError::QueueFull`] when the server is behind.
    pub fn submit(&self, command: ClientCommand) -> Result<u64> {
        let mut guard = self.block.lock();
        if !guard.is_initialized() {
            return Err(ShmError::NotInitialized(self.key));
        }
        let sequence = guard.num_client_commands + 1;
        guard.commands.try_push(command.encode(sequence))?;
        guard.num_client_commands = sequence;
        Ok(sequence)
    }

    /// Take the oldest reply, if any.
    pub fn poll_reply(&self) -> Option<ServerReply> {
        let mut guard = self.block.lock();
        let reply = guard.replies.pop()?;
        guard.num_processed_server_commands += 1;
        Some(reply)
    }

    /// Copy of the Q and U entries described by `reply`.
    #[must_use]
    pub fn actual_state(&self, reply: &ServerReply) -> (Vec<f64>, Vec<f64>) {
        let guard = self.block.lock();
        let nq = reply.num_dof_q.min(MAX_DEGREE_OF_FREEDOM);
        let nu = reply.num_dof_u.min(MAX_DEGREE_OF_FREEDOM);
        (guard.actual_state_q[..nq].to_vec(), guard.actual_state_u[..nu].to_vec())
    }

    /// `(client issued, client processed, server issued, server processed)`.
    #[must_use]
    pub fn counters(&self) -> (u64, u64, u64, u64) {
        let guard = self.block.lock();
        (
            guard.num_client_commands,
            guard.num_processed_client_commands,
            guard.num_server_commands,
            guard.num_processed_server_commands,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::memory::InProcessSharedMemory;

    #[test]
    fn test_connect_requires_server() {
        let memory = InProcessSharedMemory::new();
        assert!(matches!(
            PhysicsClient::connect_default(&memory),
            Err(ShmError::NotInitialized(12347))
        ));
    }

    #[test]
    fn test_submit_backpressure() {
        let memory = InProcessSharedMemory::new();
        memory.allocate(5, 2).unwrap().lock().initialize();
        let client = PhysicsClient::connect(&memory, 5, 2).unwrap();
        assert_eq!(client.submit(ClientCommand::RequestActualState).unwrap(), 1);
        assert_eq!(client.submit(ClientCommand::RequestActualState).unwrap(), 2);
        assert!(matches!(
            client.submit(ClientCommand::Shutdown),
            Err(ShmError::QueueFull { capacity: 2 })
        ));
        assert_eq!(client.counters(), (2, 0, 0, 0));
        assert!(client.poll_reply().is_none());
    }
}
