//! Minimal rigid-body collaborator.
//!
//! Soft bodies couple two-way with rigid bodies through anchors, node
//! contacts and cluster joints. The full rigid-body engine lives elsewhere;
//! this module carries just the state those couplings read and write: pose,
//! velocities, inverse mass and inertia, friction, and an optional
//! signed-distance collider used for soft-vs-rigid contact generation.

use std::sync::Arc;

use nalgebra::{Isometry3, Matrix3, Point3, Vector3};
use tracing::warn;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::dbvt::Aabb;

/// Handle to a rigid body in a [`RigidBodySet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RigidBodyId(pub usize);

/// Signed distance query in collider-local coordinates.
///
/// Negative inside, positive outside.
pub trait SignedDistance: std::fmt::Debug + Send + Sync {
    /// Signed distance from `p` to the surface.
    fn distance(&self, p: &Point3<f64>) -> f64;

    /// Outward surface normal near `p` (central differences by default).
    fn gradient(&self, p: &Point3<f64>) -> Vector3<f64> {
        const H: f64 = 1e-6;
        let g = Vector3::new(
            self.distance(&(p + Vector3::x() * H)) - self.distance(&(p - Vector3::x() * H)),
            self.distance(&(p + Vector3::y() * H)) - self.distance(&(p - Vector3::y() * H)),
            self.distance(&(p + Vector3::z() * H)) - self.distance(&(p - Vector3::z() * H)),
        );
        g.try_normalize(1e-12).unwrap_or_else(Vector3::z)
    }

    /// Local bounding box, `None` for unbounded shapes.
    fn local_aabb(&self) -> Option<Aabb>;
}

/// Sphere centered at the local origin.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SphereSdf {
    /// Radius.
    pub radius: f64,
}

impl SignedDistance for SphereSdf {
    fn distance(&self, p: &Point3<f64>) -> f64 {
        p.coords.norm() - self.radius
    }

    fn gradient(&self, p: &Point3<f64>) -> Vector3<f64> {
        p.coords.try_normalize(1e-12).unwrap_or_else(Vector3::z)
    }

    fn local_aabb(&self) -> Option<Aabb> {
        Some(Aabb::from_center_radius(Point3::origin(), self.radius))
    }
}

/// Box centered at the local origin.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BoxSdf {
    /// Half extents along each local axis.
    pub half_extents: Vector3<f64>,
}

impl SignedDistance for BoxSdf {
    fn distance(&self, p: &Point3<f64>) -> f64 {
        let q = p.coords.abs() - self.half_extents;
        let outside = q.map(|v| v.max(0.0)).norm();
        let inside = q.x.max(q.y).max(q.z).min(0.0);
        outside + inside
    }

    fn local_aabb(&self) -> Option<Aabb> {
        Some(Aabb::from_center(Point3::origin(), self.half_extents))
    }
}

/// Half-space `normal · p <= offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PlaneSdf {
    /// Unit outward normal.
    pub normal: Vector3<f64>,
    /// Plane offset along the normal.
    pub offset: f64,
}

impl SignedDistance for PlaneSdf {
    fn distance(&self, p: &Point3<f64>) -> f64 {
        self.normal.dot(&p.coords) - self.offset
    }

    fn gradient(&self, _p: &Point3<f64>) -> Vector3<f64> {
        self.normal
    }

    fn local_aabb(&self) -> Option<Aabb> {
        None
    }
}

/// Rigid body state seen by the soft body solver.
#[derive(Debug, Clone)]
pub struct RigidBody {
    /// World pose.
    pub pose: Isometry3<f64>,
    /// Linear velocity.
    pub linear_velocity: Vector3<f64>,
    /// Angular velocity.
    pub angular_velocity: Vector3<f64>,
    /// Inverse mass (0 for static/kinematic bodies).
    pub inv_mass: f64,
    /// Inverse inertia in body coordinates.
    pub inv_inertia_local: Matrix3<f64>,
    /// Coulomb friction coefficient.
    pub friction: f64,
    /// Collision margin.
    pub margin: f64,
    /// Moves under script control rather than dynamics.
    pub kinematic: bool,
    /// Collider queried for soft contacts.
    pub collider: Option<Arc<dyn SignedDistance>>,
}

impl RigidBody {
    /// Immovable body.
    #[must_use]
    pub fn fixed(pose: Isometry3<f64>) -> Self {
        Self {
            pose,
            linear_velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            inv_mass: 0.0,
            inv_inertia_local: Matrix3::zeros(),
            friction: 0.5,
            margin: 0.0,
            kinematic: false,
            collider: None,
        }
    }

    /// Dynamic body with the given mass and principal moments of inertia.
    #[must_use]
    pub fn dynamic(pose: Isometry3<f64>, mass: f64, inertia: Vector3<f64>) -> Self {
        let inv = |v: f64| if v > 0.0 { 1.0 / v } else { 0.0 };
        Self {
            inv_mass: inv(mass),
            inv_inertia_local: Matrix3::from_diagonal(&inertia.map(inv)),
            ..Self::fixed(pose)
        }
    }

    /// Attach a collider.
    #[must_use]
    pub fn with_collider(mut self, collider: Arc<dyn SignedDistance>) -> Self {
        self.collider = Some(collider);
        self
    }

    /// Set the friction coefficient.
    #[must_use]
    pub const fn with_friction(mut self, friction: f64) -> Self {
        self.friction = friction;
        self
    }

    /// Mark the body kinematic.
    #[must_use]
    pub const fn with_kinematic(mut self, kinematic: bool) -> Self {
        self.kinematic = kinematic;
        self
    }

    /// Whether the body never moves in response to impulses.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.inv_mass <= 0.0 && !self.kinematic
    }

    /// Whether the body is static or kinematic, i.e. impulses never move it.
    #[must_use]
    pub fn is_immovable(&self) -> bool {
        self.inv_mass <= 0.0
    }

    /// Inverse inertia in world coordinates.
    #[must_use]
    pub fn inv_inertia_world(&self) -> Matrix3<f64> {
        let r = self.pose.rotation.to_rotation_matrix();
        r.matrix() * self.inv_inertia_local * r.matrix().transpose()
    }

    /// Velocity of the point at `rel_pos` from the body origin.
    #[must_use]
    pub fn velocity_at(&self, rel_pos: &Vector3<f64>) -> Vector3<f64> {
        self.linear_velocity + self.angular_velocity.cross(rel_pos)
    }

    /// Apply an impulse at `rel_pos` from the body origin.
    pub fn apply_impulse(&mut self, impulse: &Vector3<f64>, rel_pos: &Vector3<f64>) {
        if self.inv_mass <= 0.0 {
            return;
        }
        self.linear_velocity += impulse * self.inv_mass;
        self.angular_velocity += self.inv_inertia_world() * rel_pos.cross(impulse);
    }

    /// Apply an angular impulse.
    pub fn apply_torque_impulse(&mut self, impulse: &Vector3<f64>) {
        if self.inv_mass <= 0.0 {
            return;
        }
        self.angular_velocity += self.inv_inertia_world() * impulse;
    }

    /// Signed distance and outward world normal at world point `p`.
    ///
    /// `None` if the body has no collider.
    #[must_use]
    pub fn signed_distance(&self, p: &Point3<f64>) -> Option<(f64, Vector3<f64>)> {
        let collider = self.collider.as_ref()?;
        let local = self.pose.inverse_transform_point(p);
        let d = collider.distance(&local);
        let n = self.pose.rotation * collider.gradient(&local);
        Some((d, n))
    }

    /// World bounding box inflated by the margin; `None` if unbounded.
    #[must_use]
    pub fn world_aabb(&self) -> Option<Aabb> {
        let local = self.collider.as_ref()?.local_aabb()?;
        let corners = (0..8).map(|i| {
            Point3::new(
                if i & 1 == 0 { local.min.x } else { local.max.x },
                if i & 2 == 0 { local.min.y } else { local.max.y },
                if i & 4 == 0 { local.min.z } else { local.max.z },
            )
        });
        let world: Vec<Point3<f64>> = corners.map(|c| self.pose * c).collect();
        Aabb::from_points(&world).map(|a| a.expanded(self.margin))
    }

    /// Semi-implicit Euler step for dynamic bodies.
    pub fn integrate(&mut self, dt: f64, gravity: &Vector3<f64>) {
        if self.inv_mass > 0.0 {
            self.linear_velocity += gravity * dt;
        }
        if self.inv_mass <= 0.0 && !self.kinematic {
            return;
        }
        self.pose.translation.vector += self.linear_velocity * dt;
        let w = self.angular_velocity * dt;
        if let Some(axis) = nalgebra::Unit::try_new(w, 1e-12) {
            let dq = nalgebra::UnitQuaternion::from_axis_angle(&axis, w.norm());
            self.pose.rotation = dq * self.pose.rotation;
        }
    }
}

/// Arena of rigid bodies with stable handles.
#[derive(Debug, Clone, Default)]
pub struct RigidBodySet {
    bodies: Vec<Option<RigidBody>>,
}

impl RigidBodySet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a body.
    pub fn insert(&mut self, body: RigidBody) -> RigidBodyId {
        self.bodies.push(Some(body));
        RigidBodyId(self.bodies.len() - 1)
    }

    /// Remove a body. Handles are never reused.
    pub fn remove(&mut self, id: RigidBodyId) -> Option<RigidBody> {
        let removed = self.bodies.get_mut(id.0).and_then(Option::take);
        if removed.is_none() {
            warn!(id = id.0, "removing unknown rigid body");
        }
        removed
    }

    /// Body by handle.
    #[must_use]
    pub fn get(&self, id: RigidBodyId) -> Option<&RigidBody> {
        self.bodies.get(id.0).and_then(Option::as_ref)
    }

    /// Mutable body by handle.
    pub fn get_mut(&mut self, id: RigidBodyId) -> Option<&mut RigidBody> {
        self.bodies.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Live bodies with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (RigidBodyId, &RigidBody)> {
        self.bodies
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|b| (RigidBodyId(i), b)))
    }

    /// Mutable live bodies.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (RigidBodyId, &mut RigidBody)> {
        self.bodies
            .iter_mut()
            .enumerate()
            .filter_map(|(i, b)| b.as_mut().map(|b| (RigidBodyId(i), b)))
    }

    /// Number of live bodies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bodies.iter().filter(|b| b.is_some()).count()
    }

    /// Whether there are no live bodies.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
