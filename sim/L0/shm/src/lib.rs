//! Shared-memory remote control for a physics world.
//!
//! A [`PhysicsServer`] owns a [`PhysicsBackend`] and a shared block. A
//! [`PhysicsClient`] attached to the same block submits commands (load a
//! model, step, request the packed state, shut down) and polls replies.
//!
//! # Protocol
//!
//! ```text
//!   client                       block                        server
//!   submit ──► commands ring ──► num_client_commands++
//!                                process_commands ──► pop, num_processed_client_commands++
//!                                                     backend call
//!              replies ring  ◄── push reply,  num_server_commands++
//!   poll_reply ◄─ num_processed_server_commands++
//! ```
//!
//! Both rings are bounded: a full command ring is [`ShmError::QueueFull`] for
//! the client, and the server defers work while the reply ring is full.
//! Unknown tags and malformed arguments get typed failure replies.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use sim_shm::{
//!     ClientCommand, InProcessSharedMemory, PhysicsClient, PhysicsServer, ReplyType,
//!     ServerConfig, SoftWorldBackend,
//! };
//! use sim_softbody::{SoftWorld, WorldInfo};
//!
//! let memory = Arc::new(InProcessSharedMemory::new());
//! let backend = SoftWorldBackend::new(SoftWorld::new(WorldInfo::default()));
//! let mut server = PhysicsServer::new(backend, ServerConfig::default(), memory.clone());
//! let client = PhysicsClient::connect_default(memory.as_ref()).unwrap();
//!
//! client
//!     .submit(ClientCommand::StepForwardSimulation { delta_time: 1.0 / 60.0 })
//!     .unwrap();
//! server.step_simulation();
//! let reply = client.poll_reply().unwrap();
//! assert_eq!(reply.kind, ReplyType::StepForwardSimulationCompleted);
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]
#![allow(
    clippy::missing_const_for_fn, // Many methods can't be const due to nalgebra
    clippy::doc_markdown,         // Not all technical terms need backticks
    clippy::module_name_repetitions,
)]

pub mod backend;
pub mod block;
pub mod client;
pub mod config;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod server;

pub use backend::{
    LinkState, LoadOptions, ModelLoader, MultiBodyState, PhysicsBackend, SoftWorldBackend, pack_actual_state,
};
pub use block::{
    CommandQueue, DEFAULT_QUEUE_CAPACITY, MAX_DEGREE_OF_FREEDOM, SHARED_MEMORY_KEY, SHARED_MEMORY_MAGIC_NUMBER,
    SharedMemoryBlock,
};
pub use client::PhysicsClient;
pub use config::ServerConfig;
pub use error::{Result, ShmError};
pub use memory::{InProcessSharedMemory, SharedBlock, SharedMemoryInterface};
pub use protocol::{
    ClientCommand, CommandPayload, CommandType, DecodeError, ReplyType, ServerReply, SharedMemoryCommand,
};
pub use server::PhysicsServer;
