//! Deformable body simulation with position-based constraint solving.
//!
//! A soft body is a particle mesh: nodes connected by links (distance
//! constraints), faces (surface) and tetrahedra (volume). Each step predicts
//! node motion from forces, detects contacts, solves constraints iteratively
//! on positions, and derives velocities from the resulting displacement.
//!
//! # Features
//!
//! - **Materials**: linear, angular and volume stiffness shared by primitives
//! - **Constructors**: tetrahedral and triangle meshes, cubes, cloth patches, ropes
//! - **Clusters**: k-means or per-primitive rigid-ish node groups with their own frames
//! - **Joints**: linear and angular joints between clusters, rigid bodies and the world
//! - **Contacts**: nodes vs rigid signed distance fields, soft vs soft, cluster contacts
//! - **Aerodynamics**: point and face drag/lift models
//! - **Topology**: bending constraints, implicit-surface refinement, cutting
//! - **Queries**: ray tests against faces, nodes and clusters
//!
//! # Layer 0 Crate
//!
//! This is a Layer 0 crate with **zero Bevy dependencies**.
//!
//! # Example
//!
//! ```
//! use nalgebra::Point3;
//! use sim_softbody::{SoftBody, SoftWorld, WorldInfo};
//!
//! let mut world = SoftWorld::new(WorldInfo::default());
//! let cube = SoftBody::cube("cube", Point3::new(0.0, 2.0, 0.0), 1.0, 1.0).unwrap();
//! let id = world.add_body(cube);
//!
//! for _ in 0..10 {
//!     world.step(1.0 / 60.0);
//! }
//! assert!(world.body(id).unwrap().center_of_mass().y < 2.0);
//! ```
//!
//! # Step
//!
//! ```text
//!   predict ─► collide ─► velocity/position solve ─► joints ─► integrate
//! ```
//!
//! Velocities are always `(x - x_prev) / dt` after a step, so a body with no
//! forces and no velocity never moves.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]
#![allow(
    clippy::missing_const_for_fn,       // Many methods can't be const due to nalgebra
    clippy::suboptimal_flops,           // mul_add style changes aren't always clearer
    clippy::option_if_let_else,         // if-let is often more readable than map_or_else
    clippy::too_many_lines,             // Physics functions naturally have many steps
    clippy::doc_markdown,               // Not all technical terms need backticks
    clippy::cast_precision_loss,        // Node counts fit comfortably in f64
    clippy::many_single_char_names,     // Math notation
    clippy::similar_names,
)]

pub mod aero;
pub mod cluster;
pub mod config;
pub mod contact;
pub mod dbvt;
pub mod error;
pub mod integrator;
pub mod joint;
pub mod material;
pub mod mesh;
pub mod pose;
pub mod rigid;
pub mod soft_body;
pub mod solver;
pub mod topology;
pub mod types;
pub mod world;

pub use aero::{AeroModel, AeroParams};
pub use cluster::{Cluster, Impulse};
pub use config::{CollisionFlags, PositionSolver, SoftBodyConfig, SolverPreset, VelocitySolver};
pub use contact::{Anchor, RigidContact, SoftContact, collide_clusters_soft, collide_soft};
pub use dbvt::{Aabb, Dbvt, LeafId};
pub use error::{Result, SoftBodyError};
pub use integrator::integrate_motion;
pub use joint::{AngularControl, AngularMotor, Body, ClusterRef, Joint, JointKind, JointSpecs};
pub use material::{Material, MaterialId};
pub use mesh::{Face, Link, Node, Tetra};
pub use pose::Pose;
pub use rigid::{
    BoxSdf, PlaneSdf, RigidBody, RigidBodyId, RigidBodySet, SignedDistance, SphereSdf,
};
pub use soft_body::{DEFAULT_COLLISION_MARGIN, SoftBody};
pub use solver::{SolverState, StepStats, solve_constraints};
pub use topology::{ImplicitFn, ImplicitPlane, ImplicitSphere};
pub use types::{Feature, Frame, NodeFlags, RayHit, SoftBodyId};
pub use world::{JointOrdering, SoftWorld, WorldInfo, solve_clusters, step_bodies};
