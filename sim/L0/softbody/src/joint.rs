//! Joints between clusters, rigid bodies and the world.
//!
//! A joint connects two [`Body`] endpoints and comes in three flavors:
//!
//! - **Linear**: pins a point of body A to a point of body B.
//! - **Angular**: aligns an axis of body A with an axis of body B; rotation
//!   about the axis is handed to an optional [`AngularControl`].
//! - **Contact**: unilateral non-penetration with friction, produced by
//!   cluster collision detection and kept alive for a bounded number of steps.
//!
//! Every joint follows the same three-phase protocol per step:
//!
//! ```text
//! prepare(dt, iterations)  build mass matrix and drift (bias) term
//! solve(dt, sor)           apply one velocity impulse, repeated `iterations` times
//! terminate(dt)            apply the split-off drift as a position impulse
//! ```
//!
//! Bias terms: `erp` scales how much positional error is fed back per step,
//! `cfm` scales the relative-velocity term, and `split` routes a fraction of
//! the drift correction into a separate position-only impulse so it does not
//! inject energy into velocities.
//!
//! Endpoints are non-owning references. A joint whose cluster or rigid body
//! cannot be resolved flags itself for deletion at `prepare` and is purged
//! before the next step.

use std::sync::Arc;

use nalgebra::{Matrix3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::cluster::{Cluster, Impulse};
use crate::rigid::{RigidBodyId, RigidBodySet};
use crate::soft_body::SoftBody;
use crate::types::{Frame, SoftBodyId};

/// Reference to a cluster of a soft body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClusterRef {
    /// Owning soft body.
    pub body: SoftBodyId,
    /// Cluster index in that body.
    pub index: usize,
}

/// Joint endpoint: exactly one of world, rigid body or cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Body {
    /// The fixed world frame.
    #[default]
    World,
    /// A rigid body.
    Rigid(RigidBodyId),
    /// A soft body cluster.
    Cluster(ClusterRef),
}

/// Bias parameters shared by all joint kinds.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct JointSpecs {
    /// Error reduction parameter.
    pub erp: f64,
    /// Constraint force mixing.
    pub cfm: f64,
    /// Fraction of drift handled as a position impulse.
    pub split: f64,
}

impl Default for JointSpecs {
    fn default() -> Self {
        Self {
            erp: 1.0,
            cfm: 1.0,
            split: 1.0,
        }
    }
}

/// Hook controlling the free rotation of an angular joint (motors, limits).
pub trait AngularControl: std::fmt::Debug + Send + Sync {
    /// Called at the start of [`Joint::prepare`].
    fn prepare(&self, _axis: &Vector3<f64>) {}

    /// Target relative speed about the axis given the current one.
    ///
    /// Returning `current` leaves rotation about the axis free.
    fn speed(&self, _axis: &Vector3<f64>, current: f64) -> f64 {
        current
    }
}

/// Angular control driving the relative spin toward a fixed rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngularMotor {
    /// Target relative angular speed about the joint axis.
    pub target_speed: f64,
}

impl AngularControl for AngularMotor {
    fn speed(&self, _axis: &Vector3<f64>, _current: f64) -> f64 {
        self.target_speed
    }
}

/// Per-kind joint state.
#[derive(Debug, Clone)]
pub enum JointKind {
    /// Point-to-point joint.
    Linear {
        /// Anchor offsets from each body origin, world space.
        rpos: [Vector3<f64>; 2],
    },
    /// Axis alignment joint.
    Angular {
        /// Joint axis of each body, world space.
        axis: [Vector3<f64>; 2],
        /// Rotation control about the axis.
        control: Option<Arc<dyn AngularControl>>,
    },
    /// Frictional contact.
    Contact {
        /// Contact offsets from each body origin, world space.
        rpos: [Vector3<f64>; 2],
        /// Contact normal, pointing from body B to body A.
        normal: Vector3<f64>,
        /// Friction applied to the tangential relative velocity.
        friction: f64,
        /// Number of `prepare` calls so far.
        life: u32,
        /// Lifetime after which the joint is deleted.
        max_life: u32,
        /// Re-detected since the last `prepare`.
        refreshed: bool,
        /// Seen by the current collision pass.
        detected: bool,
    },
}

/// A joint between two bodies.
#[derive(Debug, Clone)]
pub struct Joint {
    /// Endpoints.
    pub bodies: [Body; 2],
    /// Anchor (or axis) in each body's local frame.
    pub refs: [Vector3<f64>; 2],
    /// Error reduction parameter.
    pub erp: f64,
    /// Constraint force mixing.
    pub cfm: f64,
    /// Split factor.
    pub split: f64,
    /// Per-iteration velocity bias.
    pub drift: Vector3<f64>,
    /// Split-off drift impulse applied at terminate.
    pub split_drift: Vector3<f64>,
    /// Effective mass matrix.
    pub mass_matrix: Matrix3<f64>,
    /// Flagged for removal after this step.
    pub delete: bool,
    /// Variant state.
    pub kind: JointKind,
}

/// Skew-symmetric cross-product matrix of `v`.
#[must_use]
pub fn cross_matrix(v: &Vector3<f64>) -> Matrix3<f64> {
    v.cross_matrix()
}

/// Point mass matrix `im I - [r]x iwi [r]x`.
#[must_use]
pub fn mass_matrix(im: f64, iwi: &Matrix3<f64>, r: &Vector3<f64>) -> Matrix3<f64> {
    let cr = cross_matrix(r);
    Matrix3::identity() * im - cr * iwi * cr
}

/// Impulse matrix between a node of inverse mass `ima` and a body point.
///
/// Maps a relative displacement over `dt` to the impulse cancelling it.
#[must_use]
pub fn impulse_matrix_dt(
    dt: f64,
    ima: f64,
    imb: f64,
    iwi: &Matrix3<f64>,
    r: &Vector3<f64>,
) -> Matrix3<f64> {
    let k = Matrix3::identity() * ima + mass_matrix(imb, iwi, r);
    k.try_inverse().unwrap_or_else(Matrix3::zeros) / dt
}

/// Impulse matrix between two body points.
#[must_use]
pub fn impulse_matrix(
    ima: f64,
    iia: &Matrix3<f64>,
    ra: &Vector3<f64>,
    imb: f64,
    iib: &Matrix3<f64>,
    rb: &Vector3<f64>,
) -> Matrix3<f64> {
    (mass_matrix(ima, iia, ra) + mass_matrix(imb, iib, rb))
        .try_inverse()
        .unwrap_or_else(Matrix3::zeros)
}

/// Angular impulse matrix `(iia + iib)⁻¹`.
#[must_use]
pub fn angular_impulse_matrix(iia: &Matrix3<f64>, iib: &Matrix3<f64>) -> Matrix3<f64> {
    (iia + iib).try_inverse().unwrap_or_else(Matrix3::zeros)
}

fn clamp_length(v: Vector3<f64>, max: f64) -> Vector3<f64> {
    let len = v.norm();
    if len > max && len > 0.0 {
        v * (max / len)
    } else {
        v
    }
}

/// Mutable view over every body a joint may touch.
///
/// Clusters are resolved by soft body id within `bodies`. Joints must be
/// detached from their owning body while this view is alive.
pub struct BodyAccess<'a> {
    /// Soft bodies.
    pub bodies: &'a mut [SoftBody],
    /// Rigid bodies.
    pub rigids: &'a mut RigidBodySet,
}

impl<'a> BodyAccess<'a> {
    /// Create a view.
    pub fn new(bodies: &'a mut [SoftBody], rigids: &'a mut RigidBodySet) -> Self {
        Self { bodies, rigids }
    }

    fn cluster(&self, r: ClusterRef) -> Option<&Cluster> {
        self.bodies
            .iter()
            .find(|b| b.id() == r.body)
            .and_then(|b| b.clusters.get(r.index))
    }

    fn cluster_mut(&mut self, r: ClusterRef) -> Option<&mut Cluster> {
        self.bodies
            .iter_mut()
            .find(|b| b.id() == r.body)
            .and_then(|b| b.clusters.get_mut(r.index))
    }

    /// Whether the endpoint refers to something that exists.
    #[must_use]
    pub fn resolves(&self, body: &Body) -> bool {
        match *body {
            Body::World => true,
            Body::Rigid(id) => self.rigids.get(id).is_some(),
            Body::Cluster(r) => self.cluster(r).is_some(),
        }
    }

    /// Inverse mass of the endpoint.
    #[must_use]
    pub fn inv_mass(&self, body: &Body) -> f64 {
        match *body {
            Body::World => 0.0,
            Body::Rigid(id) => self.rigids.get(id).map_or(0.0, |b| b.inv_mass),
            Body::Cluster(r) => self.cluster(r).map_or(0.0, |c| c.inv_mass),
        }
    }

    /// Inverse inertia of the endpoint in world space.
    #[must_use]
    pub fn inv_world_inertia(&self, body: &Body) -> Matrix3<f64> {
        match *body {
            Body::World => Matrix3::zeros(),
            Body::Rigid(id) => self
                .rigids
                .get(id)
                .map_or_else(Matrix3::zeros, |b| b.inv_inertia_world()),
            Body::Cluster(r) => self
                .cluster(r)
                .map_or_else(Matrix3::zeros, |c| c.world_inv_inertia),
        }
    }

    /// Current frame of the endpoint.
    #[must_use]
    pub fn frame(&self, body: &Body) -> Frame {
        match *body {
            Body::World => Frame::identity(),
            Body::Rigid(id) => self
                .rigids
                .get(id)
                .map_or_else(Frame::identity, |b| Frame::from(&b.pose)),
            Body::Cluster(r) => self.cluster(r).map_or_else(Frame::identity, |c| c.frame),
        }
    }

    /// Velocity of the endpoint point at `rpos` from its origin.
    #[must_use]
    pub fn velocity(&self, body: &Body, rpos: &Vector3<f64>) -> Vector3<f64> {
        match *body {
            Body::World => Vector3::zeros(),
            Body::Rigid(id) => self
                .rigids
                .get(id)
                .map_or_else(Vector3::zeros, |b| b.velocity_at(rpos)),
            Body::Cluster(r) => self
                .cluster(r)
                .map_or_else(Vector3::zeros, |c| c.velocity_at(rpos)),
        }
    }

    /// Angular velocity of the endpoint.
    #[must_use]
    pub fn angular_velocity(&self, body: &Body) -> Vector3<f64> {
        match *body {
            Body::World => Vector3::zeros(),
            Body::Rigid(id) => self
                .rigids
                .get(id)
                .map_or_else(Vector3::zeros, |b| b.angular_velocity),
            Body::Cluster(r) => self
                .cluster(r)
                .map_or_else(Vector3::zeros, |c| c.angular_velocity),
        }
    }

    /// Apply an impulse at `rpos`.
    pub fn apply_impulse(&mut self, body: &Body, impulse: &Impulse, rpos: &Vector3<f64>) {
        match *body {
            Body::World => {}
            Body::Rigid(id) => {
                if let Some(b) = self.rigids.get_mut(id) {
                    if impulse.as_velocity {
                        b.apply_impulse(&impulse.velocity, rpos);
                    }
                    if impulse.as_drift {
                        b.apply_impulse(&impulse.drift, rpos);
                    }
                }
            }
            Body::Cluster(r) => {
                if let Some(c) = self.cluster_mut(r) {
                    c.apply_impulse(rpos, impulse);
                }
            }
        }
    }

    /// Apply a drift impulse at `rpos`.
    pub fn apply_drift_impulse(&mut self, body: &Body, impulse: &Vector3<f64>, rpos: &Vector3<f64>) {
        self.apply_impulse(body, &Impulse::drift(*impulse), rpos);
    }

    /// Apply an angular impulse.
    pub fn apply_angular_impulse(&mut self, body: &Body, impulse: &Impulse) {
        match *body {
            Body::World => {}
            Body::Rigid(id) => {
                if let Some(b) = self.rigids.get_mut(id) {
                    if impulse.as_velocity {
                        b.apply_torque_impulse(&impulse.velocity);
                    }
                    if impulse.as_drift {
                        b.apply_torque_impulse(&impulse.drift);
                    }
                }
            }
            Body::Cluster(r) => {
                if let Some(c) = self.cluster_mut(r) {
                    c.apply_angular_impulse(impulse);
                }
            }
        }
    }

    /// Self-collision impulse threshold and scale of a soft body.
    fn self_collision_limits(&self, id: SoftBodyId) -> (f64, f64) {
        self.bodies.iter().find(|b| b.id() == id).map_or((0.0, 1.0), |b| {
            (
                b.config.max_self_collision_impulse,
                b.config.self_collision_impulse_factor,
            )
        })
    }
}

impl Joint {
    fn with_kind(specs: &JointSpecs, bodies: [Body; 2], refs: [Vector3<f64>; 2], kind: JointKind) -> Self {
        Self {
            bodies,
            refs,
            erp: specs.erp,
            cfm: specs.cfm,
            split: specs.split,
            drift: Vector3::zeros(),
            split_drift: Vector3::zeros(),
            mass_matrix: Matrix3::zeros(),
            delete: false,
            kind,
        }
    }

    /// Point joint anchored at world `position`, given the current frames of
    /// both endpoints.
    #[must_use]
    pub fn linear(
        specs: &JointSpecs,
        bodies: [Body; 2],
        frames: [Frame; 2],
        position: &nalgebra::Point3<f64>,
    ) -> Self {
        let refs = [
            frames[0].inverse_transform_point(position),
            frames[1].inverse_transform_point(position),
        ];
        Self::with_kind(specs, bodies, refs, JointKind::Linear {
            rpos: [Vector3::zeros(); 2],
        })
    }

    /// Axis joint along world `axis`, given the current frames of both
    /// endpoints.
    #[must_use]
    pub fn angular(
        specs: &JointSpecs,
        bodies: [Body; 2],
        frames: [Frame; 2],
        axis: &Vector3<f64>,
        control: Option<Arc<dyn AngularControl>>,
    ) -> Self {
        let refs = [
            frames[0].basis.transpose() * axis,
            frames[1].basis.transpose() * axis,
        ];
        Self::with_kind(specs, bodies, refs, JointKind::Angular {
            axis: [Vector3::zeros(); 2],
            control,
        })
    }

    /// Contact joint.
    ///
    /// `rpos` are the contact points relative to each body origin, `depth`
    /// the signed separation minus margin (negative when penetrating).
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn contact(
        bodies: [Body; 2],
        frames: [Frame; 2],
        rpos: [Vector3<f64>; 2],
        normal: Vector3<f64>,
        depth: f64,
        friction: f64,
        max_life: u32,
        mass_matrix: Matrix3<f64>,
    ) -> Self {
        let refs = [
            frames[0].basis.transpose() * rpos[0],
            frames[1].basis.transpose() * rpos[1],
        ];
        let mut joint = Self::with_kind(&JointSpecs::default(), bodies, refs, JointKind::Contact {
            rpos,
            normal,
            friction,
            life: 0,
            max_life,
            refreshed: false,
            detected: true,
        });
        joint.drift = normal * depth;
        joint.mass_matrix = mass_matrix;
        joint
    }

    /// Whether this is a contact joint.
    #[must_use]
    pub fn is_contact(&self) -> bool {
        matches!(self.kind, JointKind::Contact { .. })
    }

    /// Contact life counter, `None` for other kinds.
    #[must_use]
    pub fn life(&self) -> Option<u32> {
        match self.kind {
            JointKind::Contact { life, .. } => Some(life),
            _ => None,
        }
    }

    /// Whether a contact joint was seen by the current collision pass.
    ///
    /// Always `true` for other kinds.
    #[must_use]
    pub fn is_detected(&self) -> bool {
        match self.kind {
            JointKind::Contact { detected, .. } => detected,
            _ => true,
        }
    }

    /// Start a collision pass: contacts must be re-detected to survive it.
    pub fn begin_detection(&mut self) {
        if let JointKind::Contact { detected, .. } = &mut self.kind {
            *detected = false;
        }
    }

    /// Whether both joints connect the same endpoints in the same order.
    #[must_use]
    pub fn same_bodies(&self, other: &Self) -> bool {
        self.bodies == other.bodies
    }

    /// Whether the joint involves cluster `index` of body `id`.
    #[must_use]
    pub fn references_cluster(&self, id: SoftBodyId, index: usize) -> bool {
        self.bodies
            .iter()
            .any(|b| matches!(b, Body::Cluster(r) if r.body == id && r.index == index))
    }

    /// Whether the joint involves any cluster of body `id`.
    #[must_use]
    pub fn references_any_cluster_of(&self, id: SoftBodyId) -> bool {
        self.bodies
            .iter()
            .any(|b| matches!(b, Body::Cluster(r) if r.body == id))
    }

    /// Whether the joint involves rigid body `id`.
    #[must_use]
    pub fn references_rigid(&self, id: RigidBodyId) -> bool {
        self.bodies.contains(&Body::Rigid(id))
    }

    /// Renumber cluster references of body `id` after cluster `removed` was
    /// released.
    pub fn shift_cluster_refs(&mut self, id: SoftBodyId, removed: usize) {
        for b in &mut self.bodies {
            if let Body::Cluster(r) = b {
                if r.body == id && r.index > removed {
                    r.index -= 1;
                }
            }
        }
    }

    /// Replace the geometry of a live contact joint with a fresh detection.
    pub fn refresh_contact(&mut self, other: &Self) {
        if let (
            JointKind::Contact {
                rpos,
                normal,
                friction,
                refreshed,
                detected,
                ..
            },
            JointKind::Contact {
                rpos: new_rpos,
                normal: new_normal,
                friction: new_friction,
                ..
            },
        ) = (&mut self.kind, &other.kind)
        {
            *rpos = *new_rpos;
            *normal = *new_normal;
            *friction = *new_friction;
            *refreshed = true;
            *detected = true;
            self.refs = other.refs;
            self.drift = other.drift;
            self.mass_matrix = other.mass_matrix;
            self.erp = other.erp;
            self.split = other.split;
        }
    }

    /// Build the mass matrix and drift terms for this step.
    pub fn prepare(&mut self, dt: f64, iterations: usize, access: &BodyAccess<'_>) {
        if !self.bodies.iter().all(|b| access.resolves(b)) {
            self.delete = true;
            return;
        }
        let iterations = iterations.max(1) as f64;
        let [b0, b1] = self.bodies;

        match &mut self.kind {
            JointKind::Linear { rpos } => {
                const MAX_DRIFT: f64 = 4.0;
                let f0 = access.frame(&b0);
                let f1 = access.frame(&b1);
                let p0 = f0.transform_point(&self.refs[0]);
                let p1 = f1.transform_point(&self.refs[1]);
                self.drift = clamp_length(p0 - p1, MAX_DRIFT) * (self.erp / dt);
                rpos[0] = p0 - f0.origin;
                rpos[1] = p1 - f1.origin;
                self.mass_matrix = impulse_matrix(
                    access.inv_mass(&b0),
                    &access.inv_world_inertia(&b0),
                    &rpos[0],
                    access.inv_mass(&b1),
                    &access.inv_world_inertia(&b1),
                    &rpos[1],
                );
                self.apply_split(iterations);
            }
            JointKind::Angular { axis, control } => {
                const MAX_DRIFT: f64 = std::f64::consts::PI / 16.0;
                axis[0] = access.frame(&b0).basis * self.refs[0];
                axis[1] = access.frame(&b1).basis * self.refs[1];
                if let Some(control) = control {
                    control.prepare(&axis[0]);
                }
                let dir = axis[1]
                    .cross(&axis[0])
                    .try_normalize(1e-12)
                    .unwrap_or_else(Vector3::zeros);
                let angle = axis[0].dot(&axis[1]).clamp(-1.0, 1.0).acos();
                self.drift = dir * angle.min(MAX_DRIFT) * (self.erp / dt);
                self.mass_matrix = angular_impulse_matrix(
                    &access.inv_world_inertia(&b0),
                    &access.inv_world_inertia(&b1),
                );
                self.apply_split(iterations);
            }
            JointKind::Contact {
                life,
                max_life,
                refreshed,
                ..
            } => {
                let dodrift = *life == 0 || *refreshed;
                *refreshed = false;
                *life += 1;
                if *life > *max_life {
                    self.delete = true;
                }
                if dodrift {
                    self.drift *= self.erp / dt;
                    self.apply_split(iterations);
                } else {
                    self.drift = Vector3::zeros();
                    self.split_drift = Vector3::zeros();
                }
            }
        }
    }

    fn apply_split(&mut self, iterations: f64) {
        if self.split > 0.0 {
            self.split_drift = self.mass_matrix * (self.drift * self.split);
            self.drift *= 1.0 - self.split;
        } else {
            self.split_drift = Vector3::zeros();
        }
        self.drift /= iterations;
    }

    /// Apply one velocity impulse scaled by the over-relaxation factor `sor`.
    ///
    /// Joints flagged for deletion still act during the step that flagged
    /// them; only joints with a missing endpoint are skipped.
    pub fn solve(&mut self, _dt: f64, sor: f64, access: &mut BodyAccess<'_>) {
        if !self.bodies.iter().all(|b| access.resolves(b)) {
            return;
        }
        let [b0, b1] = self.bodies;
        match &self.kind {
            JointKind::Linear { rpos } => {
                let vr = access.velocity(&b0, &rpos[0]) - access.velocity(&b1, &rpos[1]);
                let impulse =
                    Impulse::velocity(self.mass_matrix * (self.drift + vr * self.cfm) * sor);
                access.apply_impulse(&b0, &-impulse, &rpos[0]);
                access.apply_impulse(&b1, &impulse, &rpos[1]);
            }
            JointKind::Angular { axis, control } => {
                let vr = access.angular_velocity(&b0) - access.angular_velocity(&b1);
                let sp = vr.dot(&axis[0]);
                let speed = control.as_ref().map_or(sp, |c| c.speed(&axis[0], sp));
                let vc = vr - axis[0] * speed;
                let impulse =
                    Impulse::velocity(self.mass_matrix * (self.drift + vc * self.cfm) * sor);
                access.apply_angular_impulse(&b0, &-impulse);
                access.apply_angular_impulse(&b1, &impulse);
            }
            JointKind::Contact {
                rpos,
                normal,
                friction,
                ..
            } => {
                let vrel = access.velocity(&b0, &rpos[0]) - access.velocity(&b1, &rpos[1]);
                let rvac = vrel.dot(normal);
                let mut v = self.drift;
                if rvac < 0.0 {
                    let iv = normal * rvac;
                    let fv = vrel - iv;
                    v += iv + fv * *friction;
                }
                let impulse = Impulse::velocity(self.mass_matrix * v * sor);
                if !impulse.velocity.iter().all(|c| c.is_finite()) {
                    return;
                }

                match (b0, b1) {
                    (Body::Cluster(a), Body::Cluster(b)) if a.body == b.body => {
                        let (max_impulse, factor) = access.self_collision_limits(a.body);
                        if impulse.velocity.norm() >= max_impulse {
                            let scaled = impulse * factor;
                            access.apply_impulse(&b0, &-scaled, &rpos[0]);
                            access.apply_impulse(&b1, &scaled, &rpos[1]);
                        }
                    }
                    _ => {
                        access.apply_impulse(&b0, &-impulse, &rpos[0]);
                        access.apply_impulse(&b1, &impulse, &rpos[1]);
                    }
                }
            }
        }
    }

    /// Apply the split-off drift as a position impulse.
    pub fn terminate(&mut self, _dt: f64, access: &mut BodyAccess<'_>) {
        if self.split <= 0.0 || !self.bodies.iter().all(|b| access.resolves(b)) {
            return;
        }
        let [b0, b1] = self.bodies;
        match &self.kind {
            JointKind::Linear { rpos } | JointKind::Contact { rpos, .. } => {
                access.apply_drift_impulse(&b0, &-self.split_drift, &rpos[0]);
                access.apply_drift_impulse(&b1, &self.split_drift, &rpos[1]);
            }
            JointKind::Angular { .. } => {
                access.apply_angular_impulse(&b0, &Impulse::drift(-self.split_drift));
                access.apply_angular_impulse(&b1, &Impulse::drift(self.split_drift));
            }
        }
    }
}
