//! Integration tests for the soft-body crates.
//!
//! These tests exercise the public API end to end:
//! - Mesh construction, rest lengths and clustering
//! - Full world steps: rest states, spring convergence, ground contact
//! - Contact joint lifetimes across steps
//! - Cutting and refinement of live bodies
//! - The shared-memory protocol driving a soft world

pub mod clustering;
pub mod contact_lifetime;
pub mod remote_control;
pub mod rest_state;
pub mod topology_edits;
