//! Physics server: drains client commands and answers each one.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::backend::{LoadOptions, PhysicsBackend, pack_actual_state};
use crate::block::SharedMemoryBlock;
use crate::config::ServerConfig;
use crate::memory::{SharedBlock, SharedMemoryInterface};
use crate::protocol::{ClientCommand, DecodeError, ReplyType, ServerReply, SharedMemoryCommand};

/// Serves a [`PhysicsBackend`] over a shared block.
///
/// If the region cannot be allocated the server logs the failure and runs
/// without a control surface; the backend can still be stepped directly.
pub struct PhysicsServer<B> {
    backend: B,
    config: ServerConfig,
    memory: Arc<dyn SharedMemoryInterface>,
    block: Option<SharedBlock>,
    wants_shutdown: bool,
}

impl<B: std::fmt::Debug> std::fmt::Debug for PhysicsServer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicsServer")
            .field("backend", &self.backend)
            .field("config", &self.config)
            .field("connected", &self.block.is_some())
            .field("wants_shutdown", &self.wants_shutdown)
            .finish()
    }
}

impl<B: PhysicsBackend> PhysicsServer<B> {
    /// Start a server: set gravity on the backend, allocate and initialize
    /// the region.
    pub fn new(mut backend: B, config: ServerConfig, memory: Arc<dyn SharedMemoryInterface>) -> Self {
        backend.set_gravity(&config.gravity_vector());
        let block = match memory.allocate(config.key, config.capacity) {
            Ok(block) => {
                let mut guard = block.lock();
                if guard.is_initialized() {
                    warn!(key = config.key, "shared memory is already initialized, is another server running?");
                }
                guard.initialize();
                drop(guard);
                info!(key = config.key, capacity = config.capacity, "shared memory allocated");
                Some(block)
            }
            Err(err) => {
                error!(key = config.key, %err, "shared memory unavailable, remote control disabled");
                None
            }
        };
        Self {
            backend,
            config,
            memory,
            block,
            wants_shutdown: false,
        }
    }

    /// The backend.
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// The backend, mutable.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Settings.
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns true while the region is attached.
    pub const fn is_connected(&self) -> bool {
        self.block.is_some()
    }

    /// Returns true once a shutdown command was processed.
    pub const fn wants_termination(&self) -> bool {
        self.wants_shutdown
    }

    /// Process every pending command, then release the region if a
    /// shutdown was requested. Returns the number of commands processed.
    pub fn step_simulation(&mut self) -> usize {
        let processed = self.process_commands();
        if self.wants_shutdown && self.block.is_some() {
            info!("shutdown requested");
            self.release_shared_memory();
        }
        processed
    }

    /// Drain pending commands in order, one reply each except shutdown.
    ///
    /// Draining pauses while the reply ring is full and stops after a
    /// shutdown command.
    pub fn process_commands(&mut self) -> usize {
        let Some(block) = self.block.clone() else {
            return 0;
        };
        let mut processed = 0;
        while !self.wants_shutdown {
            let command = {
                let mut guard = block.lock();
                if guard.replies.is_full() {
                    debug!("reply queue full, deferring commands");
                    break;
                }
                let Some(command) = guard.commands.pop() else {
                    break;
                };
                guard.num_processed_client_commands += 1;
                command
            };
            processed += 1;
            if let Some(reply) = self.handle(&command, &block) {
                let mut guard = block.lock();
                // A free slot was checked before popping and only this
                // server pushes replies.
                if guard.replies.try_push(reply).is_ok() {
                    guard.num_server_commands += 1;
                }
            }
        }
        processed
    }

    fn handle(&mut self, command: &SharedMemoryCommand, block: &SharedBlock) -> Option<ServerReply> {
        let sequence = command.sequence;
        let decoded = match command.decode() {
            Ok(decoded) => decoded,
            Err(DecodeError::Unsupported(tag)) => {
                error!(tag, "unsupported command encountered");
                return Some(ServerReply::failure(
                    sequence,
                    ReplyType::UnsupportedCommand,
                    format!("unsupported command tag {tag}"),
                ));
            }
            Err(DecodeError::InvalidArgument(kind)) => {
                warn!(?kind, "invalid command arguments");
                return Some(ServerReply::failure(
                    sequence,
                    ReplyType::InvalidArgument,
                    format!("invalid arguments for {kind:?}"),
                ));
            }
        };

        match decoded {
            ClientCommand::LoadModel {
                path,
                use_multi_body,
                use_fixed_base,
            } => {
                debug!(%path, "processing load model");
                let options = LoadOptions {
                    use_multi_body,
                    use_fixed_base,
                };
                Some(match self.backend.load_model(&path, &options) {
                    Ok(()) => ServerReply::new(sequence, ReplyType::ModelLoadingCompleted),
                    Err(err) => {
                        warn!(%path, %err, "model loading failed");
                        ServerReply::failure(sequence, ReplyType::ModelLoadingFailed, err.to_string())
                    }
                })
            }
            ClientCommand::RequestActualState => Some(self.actual_state_reply(sequence, block)),
            ClientCommand::StepForwardSimulation { delta_time } => {
                debug!(delta_time, "step simulation request");
                self.backend.step(delta_time);
                Some(ServerReply::new(sequence, ReplyType::StepForwardSimulationCompleted))
            }
            ClientCommand::Shutdown => {
                self.wants_shutdown = true;
                None
            }
        }
    }

    fn actual_state_reply(&self, sequence: u64, block: &SharedBlock) -> ServerReply {
        let Some(state) = self.backend.actual_state() else {
            warn!("state requested but no articulated body available");
            return ServerReply::failure(sequence, ReplyType::ActualStateUpdateFailed, "no articulated body");
        };
        let mut guard = block.lock();
        let SharedMemoryBlock {
            actual_state_q,
            actual_state_u,
            ..
        } = &mut *guard;
        match pack_actual_state(&state, actual_state_q, actual_state_u) {
            Ok((num_dof_q, num_dof_u)) => ServerReply {
                num_dof_q,
                num_dof_u,
                ..ServerReply::new(sequence, ReplyType::ActualStateUpdateCompleted)
            },
            Err(err) => ServerReply::failure(sequence, ReplyType::ActualStateUpdateFailed, err.to_string()),
        }
    }

    /// Clear the magic number and free the region.
    pub fn release_shared_memory(&mut self) {
        if let Some(block) = self.block.take() {
            block.lock().magic_id = 0;
            self.memory.release(self.config.key);
            info!(key = self.config.key, "shared memory released");
        }
    }
}

impl<B> Drop for PhysicsServer<B> {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            block.lock().magic_id = 0;
            self.memory.release(self.config.key);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::backend::MultiBodyState;
    use crate::block::SHARED_MEMORY_MAGIC_NUMBER;
    use crate::error::{Result, ShmError};
    use crate::memory::InProcessSharedMemory;
    use crate::protocol::CommandPayload;
    use nalgebra::Vector3;

    #[derive(Debug, Default)]
    struct Recorder {
        steps: Vec<f64>,
        gravity: Vector3<f64>,
        state: Option<MultiBodyState>,
    }

    impl PhysicsBackend for Recorder {
        fn load_model(&mut self, path: &str, _options: &LoadOptions) -> Result<()> {
            if path.ends_with(".ok") {
                self.state = Some(MultiBodyState::default());
                Ok(())
            } else {
                Err(ShmError::model_load(format!("cannot read {path}")))
            }
        }

        fn step(&mut self, dt: f64) {
            self.steps.push(dt);
        }

        fn actual_state(&self) -> Option<MultiBodyState> {
            self.state.clone()
        }

        fn set_gravity(&mut self, gravity: &Vector3<f64>) {
            self.gravity = *gravity;
        }
    }

    fn server(capacity: usize) -> (PhysicsServer<Recorder>, SharedBlock) {
        let memory = Arc::new(InProcessSharedMemory::new());
        let config = ServerConfig {
            capacity,
            ..ServerConfig::default()
        };
        let server = PhysicsServer::new(Recorder::default(), config, memory.clone());
        let block = memory.attach(config.key).unwrap();
        (server, block)
    }

    fn push(block: &SharedBlock, command: ClientCommand) {
        let mut guard = block.lock();
        guard.num_client_commands += 1;
        let sequence = guard.num_client_commands;
        guard.commands.try_push(command.encode(sequence)).unwrap();
    }

    #[test]
    fn test_startup_initializes_block() {
        let (server, block) = server(4);
        assert!(server.is_connected());
        assert_eq!(block.lock().magic_id, SHARED_MEMORY_MAGIC_NUMBER);
        assert_eq!(server.backend().gravity, Vector3::new(0.0, -9.8, 0.0));
    }

    #[test]
    fn test_drains_in_order() {
        let (mut server, block) = server(4);
        push(&block, ClientCommand::StepForwardSimulation { delta_time: 0.1 });
        push(&block, ClientCommand::StepForwardSimulation { delta_time: 0.2 });
        push(&block, ClientCommand::RequestActualState);

        assert_eq!(server.step_simulation(), 3);
        assert_eq!(server.backend().steps, vec![0.1, 0.2]);
        let mut guard = block.lock();
        assert_eq!(guard.num_processed_client_commands, 3);
        assert_eq!(guard.num_server_commands, 3);
        let kinds: Vec<_> = std::iter::from_fn(|| guard.replies.pop()).map(|r| (r.sequence, r.kind)).collect();
        assert_eq!(kinds, vec![
            (1, ReplyType::StepForwardSimulationCompleted),
            (2, ReplyType::StepForwardSimulationCompleted),
            (3, ReplyType::ActualStateUpdateFailed),
        ]);
    }

    #[test]
    fn test_full_reply_ring_defers() {
        let (mut server, block) = server(2);
        push(&block, ClientCommand::StepForwardSimulation { delta_time: 0.1 });
        push(&block, ClientCommand::StepForwardSimulation { delta_time: 0.1 });
        assert_eq!(server.process_commands(), 2);
        push(&block, ClientCommand::StepForwardSimulation { delta_time: 0.1 });
        assert_eq!(server.process_commands(), 0);
        assert_eq!(block.lock().commands.len(), 1);

        block.lock().replies.pop();
        assert_eq!(server.process_commands(), 1);
        assert_eq!(block.lock().num_server_commands, 3);
    }

    #[test]
    fn test_model_loading_replies() {
        let (mut server, block) = server(4);
        push(&block, ClientCommand::LoadModel {
            path: "missing.urdf".into(),
            use_multi_body: true,
            use_fixed_base: false,
        });
        push(&block, ClientCommand::LoadModel {
            path: "arm.ok".into(),
            use_multi_body: true,
            use_fixed_base: true,
        });
        push(&block, ClientCommand::RequestActualState);
        server.process_commands();

        let mut guard = block.lock();
        let failed = guard.replies.pop().unwrap();
        assert_eq!(failed.kind, ReplyType::ModelLoadingFailed);
        assert!(failed.message.unwrap().contains("missing.urdf"));
        assert_eq!(guard.replies.pop().unwrap().kind, ReplyType::ModelLoadingCompleted);
        let state = guard.replies.pop().unwrap();
        assert_eq!(state.kind, ReplyType::ActualStateUpdateCompleted);
        assert_eq!((state.num_dof_q, state.num_dof_u), (7, 6));
        assert_eq!(guard.actual_state_q[6], 1.0);
    }

    #[test]
    fn test_unsupported_and_invalid_commands() {
        let (mut server, block) = server(4);
        {
            let mut guard = block.lock();
            guard.num_client_commands += 2;
            guard
                .commands
                .try_push(SharedMemoryCommand {
                    sequence: 1,
                    tag: 42,
                    payload: CommandPayload::None,
                })
                .unwrap();
            guard
                .commands
                .try_push(SharedMemoryCommand {
                    sequence: 2,
                    tag: 3,
                    payload: CommandPayload::None,
                })
                .unwrap();
        }
        assert_eq!(server.process_commands(), 2);
        let mut guard = block.lock();
        assert_eq!(guard.replies.pop().unwrap().kind, ReplyType::UnsupportedCommand);
        assert_eq!(guard.replies.pop().unwrap().kind, ReplyType::InvalidArgument);
        assert!(server.backend().steps.is_empty());
    }

    #[test]
    fn test_shutdown_releases_without_reply() {
        let memory = Arc::new(InProcessSharedMemory::new());
        let mut server = PhysicsServer::new(Recorder::default(), ServerConfig::default(), memory.clone());
        let block = memory.attach(ServerConfig::default().key).unwrap();
        push(&block, ClientCommand::Shutdown);
        push(&block, ClientCommand::StepForwardSimulation { delta_time: 0.1 });

        assert_eq!(server.step_simulation(), 1);
        assert!(server.wants_termination());
        assert!(!server.is_connected());
        assert!(!memory.contains(ServerConfig::default().key));
        let guard = block.lock();
        assert_eq!(guard.num_server_commands, 0);
        assert!(guard.replies.is_empty());
        assert_eq!(guard.magic_id, 0);
        assert_eq!(server.process_commands(), 0);
    }

    #[derive(Debug)]
    struct NoMemory;

    impl SharedMemoryInterface for NoMemory {
        fn allocate(&self, key: i32, _capacity: usize) -> Result<SharedBlock> {
            Err(ShmError::allocation_failed(key, "not supported"))
        }

        fn release(&self, _key: i32) {}
    }

    #[test]
    fn test_allocation_failure_disables_surface() {
        let mut server = PhysicsServer::new(Recorder::default(), ServerConfig::default(), Arc::new(NoMemory));
        assert!(!server.is_connected());
        assert_eq!(server.step_simulation(), 0);
        server.backend_mut().step(0.5);
        assert_eq!(server.backend().steps, vec![0.5]);
    }
}
