//! Physics backends driven by the server, and actual-state packing.

use std::path::Path;

use nalgebra::{Point3, UnitQuaternion, Vector3};
use tracing::{debug, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use sim_softbody::SoftWorld;

use crate::block::MAX_DEGREE_OF_FREEDOM;
use crate::error::{Result, ShmError};

/// Import flags of a load request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LoadOptions {
    /// Import as one articulated body.
    pub use_multi_body: bool,
    /// Pin the root.
    pub use_fixed_base: bool,
}

/// Per-link generalized coordinates.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LinkState {
    /// Position degrees of freedom.
    pub positions: Vec<f64>,
    /// Velocity degrees of freedom.
    pub velocities: Vec<f64>,
}

/// State of an articulated body: a floating base and its links.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MultiBodyState {
    /// Base position in world space.
    pub base_position: Point3<f64>,
    /// Base orientation in world space.
    pub base_orientation: UnitQuaternion<f64>,
    /// Base linear velocity in world space.
    pub base_linear_velocity: Vector3<f64>,
    /// Base angular velocity in world space.
    pub base_angular_velocity: Vector3<f64>,
    /// Links in link order.
    pub links: Vec<LinkState>,
}

impl Default for MultiBodyState {
    fn default() -> Self {
        Self {
            base_position: Point3::origin(),
            base_orientation: UnitQuaternion::identity(),
            base_linear_velocity: Vector3::zeros(),
            base_angular_velocity: Vector3::zeros(),
            links: Vec::new(),
        }
    }
}

impl MultiBodyState {
    /// `7 + Σ link position DOF`.
    #[must_use]
    pub fn num_dof_q(&self) -> usize {
        7 + self.links.iter().map(|l| l.positions.len()).sum::<usize>()
    }

    /// `6 + Σ link velocity DOF`.
    #[must_use]
    pub fn num_dof_u(&self) -> usize {
        6 + self.links.iter().map(|l| l.velocities.len()).sum::<usize>()
    }
}

/// Pack `state` into `q` and `u`.
///
/// Q holds the base position, the base quaternion as `x, y, z, w`, then each
/// link's position DOF in link order. U holds the base linear and angular
/// velocity, then each link's velocity DOF. The base is always included,
/// fixed or not. Returns the DOF counts written.
///
/// # Errors
///
/// Returns [`ShmError::Backend`] if either vector does not fit its array.
pub fn pack_actual_state(state: &MultiBodyState, q: &mut [f64], u: &mut [f64]) -> Result<(usize, usize)> {
    let num_q = state.num_dof_q();
    let num_u = state.num_dof_u();
    if num_q > q.len() || num_u > u.len() {
        return Err(ShmError::backend(format!(
            "state needs {num_q} Q and {num_u} U entries, capacity is {} and {}",
            q.len(),
            u.len()
        )));
    }

    q[..3].copy_from_slice(state.base_position.coords.as_slice());
    q[3..7].copy_from_slice(state.base_orientation.coords.as_slice());
    u[..3].copy_from_slice(state.base_linear_velocity.as_slice());
    u[3..6].copy_from_slice(state.base_angular_velocity.as_slice());

    let (mut iq, mut iu) = (7, 6);
    for link in &state.links {
        q[iq..iq + link.positions.len()].copy_from_slice(&link.positions);
        iq += link.positions.len();
        u[iu..iu + link.velocities.len()].copy_from_slice(&link.velocities);
        iu += link.velocities.len();
    }
    Ok((num_q, num_u))
}

/// Simulation driven by a [`crate::PhysicsServer`].
pub trait PhysicsBackend {
    /// Import a model.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::ModelLoad`] with a diagnostic on failure.
    fn load_model(&mut self, path: &str, options: &LoadOptions) -> Result<()>;

    /// Advance by `dt` seconds.
    fn step(&mut self, dt: f64);

    /// State of the first articulated body, if there is one.
    fn actual_state(&self) -> Option<MultiBodyState>;

    /// Set world gravity.
    fn set_gravity(&mut self, gravity: &Vector3<f64>);
}

/// Asset importer for [`SoftWorldBackend`].
pub trait ModelLoader: Send + Sync {
    /// Returns true if this loader handles `path`.
    fn accepts(&self, path: &Path) -> bool;

    /// Import `path` into `world`.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::ModelLoad`] if the file cannot be imported.
    fn load(&self, path: &Path, options: &LoadOptions, world: &mut SoftWorld) -> Result<()>;
}

/// Backend stepping a [`SoftWorld`].
///
/// The first soft body is reported as the articulated body: its center of
/// mass and best-fit rotation form the base, and each cluster is a link with
/// three position DOF (center of mass) and three velocity DOF.
pub struct SoftWorldBackend {
    world: SoftWorld,
    loaders: Vec<Box<dyn ModelLoader>>,
}

impl std::fmt::Debug for SoftWorldBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftWorldBackend")
            .field("world", &self.world)
            .field("loaders", &self.loaders.len())
            .finish()
    }
}

impl SoftWorldBackend {
    /// Backend over `world` with no loaders.
    #[must_use]
    pub fn new(world: SoftWorld) -> Self {
        Self {
            world,
            loaders: Vec::new(),
        }
    }

    /// Register a loader; earlier loaders take precedence.
    #[must_use]
    pub fn with_loader(mut self, loader: Box<dyn ModelLoader>) -> Self {
        self.loaders.push(loader);
        self
    }

    /// The simulated world.
    #[must_use]
    pub const fn world(&self) -> &SoftWorld {
        &self.world
    }

    /// The simulated world, mutable.
    pub fn world_mut(&mut self) -> &mut SoftWorld {
        &mut self.world
    }
}

impl PhysicsBackend for SoftWorldBackend {
    fn load_model(&mut self, path: &str, options: &LoadOptions) -> Result<()> {
        let path = Path::new(path);
        let Some(loader) = self.loaders.iter().find(|l| l.accepts(path)) else {
            return Err(ShmError::model_load(format!("no loader accepts {}", path.display())));
        };
        loader.load(path, options, &mut self.world)?;
        debug!(path = %path.display(), "model loaded");
        Ok(())
    }

    fn step(&mut self, dt: f64) {
        self.world.step(dt);
    }

    fn actual_state(&self) -> Option<MultiBodyState> {
        let body = self.world.bodies().first()?;
        let total = body.total_mass();
        let base_linear_velocity = if total > 0.0 {
            body.nodes()
                .iter()
                .filter(|n| !n.is_pinned())
                .map(|n| n.velocity * n.mass())
                .sum::<Vector3<f64>>()
                / total
        } else {
            Vector3::zeros()
        };
        let pose = body.pose();
        let base_orientation = if pose.has_frame {
            UnitQuaternion::from_matrix(&pose.rotation)
        } else {
            UnitQuaternion::identity()
        };
        let links = body
            .clusters()
            .iter()
            .map(|c| LinkState {
                positions: c.com.coords.as_slice().to_vec(),
                velocities: c.linear_velocity.as_slice().to_vec(),
            })
            .collect();
        let state = MultiBodyState {
            base_position: body.center_of_mass(),
            base_orientation,
            base_linear_velocity,
            base_angular_velocity: Vector3::zeros(),
            links,
        };
        if state.num_dof_q() > MAX_DEGREE_OF_FREEDOM {
            warn!(
                dof = state.num_dof_q(),
                "soft body state exceeds the shared state arrays"
            );
        }
        Some(state)
    }

    fn set_gravity(&mut self, gravity: &Vector3<f64>) {
        self.world.info.gravity = *gravity;
    }
}
