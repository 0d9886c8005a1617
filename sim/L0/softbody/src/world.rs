//! World stepping: soft bodies, rigid bodies and the cross-body joint solve.
//!
//! A step runs, for all bodies:
//!
//! 1. motion prediction,
//! 2. collision detection (rigid, soft vs soft, clusters, cluster self),
//! 3. the per-body constraint solver,
//! 4. the joint solve across bodies ([`solve_clusters`]),
//! 5. integration, then rigid body integration.
//!
//! Bodies that share no joints and no contacts can be stepped independently
//! with [`step_bodies`], in parallel under the `parallel` feature.

use std::mem;
use std::sync::Arc;

use nalgebra::{Point3, Vector3};
use tracing::{debug, trace};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::CollisionFlags;
use crate::contact::{collide_clusters_soft, collide_soft};
use crate::error::{Result, SoftBodyError};
use crate::integrator::integrate_motion;
use crate::joint::{AngularControl, Body, BodyAccess, ClusterRef, Joint, JointSpecs};
use crate::rigid::{RigidBody, RigidBodyId, RigidBodySet};
use crate::soft_body::SoftBody;
use crate::solver::{StepStats, pair_mut, solve_constraints};
use crate::types::{Frame, SoftBodyId};

/// Environment shared by every body of a world.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WorldInfo {
    /// Gravity acceleration.
    pub gravity: Vector3<f64>,
    /// Largest displacement a force may cause in one step.
    pub max_displacement: f64,
    /// Air density for aerodynamics.
    pub air_density: f64,
}

impl Default for WorldInfo {
    fn default() -> Self {
        Self {
            gravity: Vector3::new(0.0, -10.0, 0.0),
            max_displacement: 1000.0,
            air_density: 1.2,
        }
    }
}

/// Order in which joints of different bodies are visited by the joint solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum JointOrdering {
    /// Every iteration sweeps all joints: body order, then insertion order.
    #[default]
    Global,
    /// Each body's joints run all iterations before the next body's.
    PerBody,
}

/// Solve every joint owned by `bodies` against each other and `rigids`.
///
/// Joints are prepared, iterated `max(cluster_iterations)` times with unit
/// successive over-relaxation and terminated. Joints flagged for deletion
/// during prepare still act this step and are purged afterwards. Returns
/// the number of joints solved.
pub fn solve_clusters(bodies: &mut [SoftBody], rigids: &mut RigidBodySet, ordering: JointOrdering) -> usize {
    let mut joints: Vec<Vec<Joint>> = bodies.iter_mut().map(|b| mem::take(&mut b.joints)).collect();
    let count: usize = joints.iter().map(Vec::len).sum();
    if count > 0 {
        let iterations = bodies
            .iter()
            .map(|b| b.config.cluster_iterations)
            .max()
            .unwrap_or(0);
        let steps: Vec<f64> = bodies.iter().map(|b| b.state.sdt).collect();
        let mut access = BodyAccess::new(bodies, rigids);

        for (list, &dt) in joints.iter_mut().zip(&steps) {
            for joint in list.iter_mut() {
                joint.prepare(dt, iterations, &access);
            }
        }
        match ordering {
            JointOrdering::Global => {
                for _ in 0..iterations {
                    for (list, &dt) in joints.iter_mut().zip(&steps) {
                        for joint in list.iter_mut() {
                            joint.solve(dt, 1.0, &mut access);
                        }
                    }
                }
            }
            JointOrdering::PerBody => {
                for (list, &dt) in joints.iter_mut().zip(&steps) {
                    for _ in 0..iterations {
                        for joint in list.iter_mut() {
                            joint.solve(dt, 1.0, &mut access);
                        }
                    }
                }
            }
        }
        for (list, &dt) in joints.iter_mut().zip(&steps) {
            for joint in list.iter_mut() {
                joint.terminate(dt, &mut access);
            }
        }
        trace!(joints = count, iterations, "solved joints");
    }

    for (body, mut list) in bodies.iter_mut().zip(joints) {
        list.retain(|j| !j.delete);
        // Joints appended while the solve ran stay after the existing ones.
        list.append(&mut body.joints);
        body.joints = list;
    }
    count
}

/// Detect every contact of one step.
fn collide_all(bodies: &mut [SoftBody], rigids: &RigidBodySet) {
    for body in bodies.iter_mut() {
        body.begin_contact_detection();
        let flags = body.config.collisions;
        for (id, rigid) in rigids.iter() {
            if flags.contains(CollisionFlags::SDF_RS) {
                body.collide_rigid(id, rigid);
            }
            if flags.contains(CollisionFlags::CL_RS) {
                body.collide_clusters_rigid(id, rigid);
            }
        }
        if flags.contains(CollisionFlags::CL_SELF) {
            body.collide_clusters_self();
        }
    }
    for i in 0..bodies.len() {
        for j in i + 1..bodies.len() {
            let Some((a, b)) = pair_mut(bodies, i, j) else {
                continue;
            };
            if !a.bounds.overlaps(&b.bounds) {
                continue;
            }
            collide_soft(a, b);
            collide_clusters_soft(a, b);
        }
    }
    for body in bodies.iter_mut() {
        body.end_contact_detection();
    }
}

/// One full step of `bodies` against `rigids`.
fn step_all(
    bodies: &mut [SoftBody],
    rigids: &mut RigidBodySet,
    info: &WorldInfo,
    ordering: JointOrdering,
    dt: f64,
) -> StepStats {
    // 1. Predict
    for body in bodies.iter_mut() {
        body.predict_motion(dt, info);
    }

    // 2. Collide
    collide_all(bodies, rigids);

    // 3. Constraints
    let mut stats = StepStats::default();
    for i in 0..bodies.len() {
        stats.merge(&solve_constraints(bodies, i, rigids));
    }

    // 4. Joints
    stats.joints = solve_clusters(bodies, rigids, ordering);

    // 5. Integrate
    for i in 0..bodies.len() {
        stats.drift_iterations += integrate_motion(bodies, i, rigids);
    }
    stats.kinetic_energy = bodies.iter().map(SoftBody::kinetic_energy).sum();
    stats
}

/// Step independent bodies, each on its own, with no rigid bodies.
///
/// Joints may only refer to the world or to the owning body. Runs in
/// parallel with the `parallel` feature; results are identical either way.
pub fn step_bodies(bodies: &mut [SoftBody], info: &WorldInfo, dt: f64) -> Vec<StepStats> {
    let step_one = |body: &mut SoftBody| {
        let mut rigids = RigidBodySet::new();
        step_all(
            std::slice::from_mut(body),
            &mut rigids,
            info,
            JointOrdering::Global,
            dt,
        )
    };

    #[cfg(feature = "parallel")]
    {
        use rayon::iter::{IntoParallelRefMutIterator, ParallelIterator};
        bodies.par_iter_mut().map(step_one).collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        bodies.iter_mut().map(step_one).collect()
    }
}

impl SoftBody {
    /// Step this body alone against `rigids`.
    pub fn step(&mut self, dt: f64, info: &WorldInfo, rigids: &mut RigidBodySet) -> StepStats {
        step_all(std::slice::from_mut(self), rigids, info, JointOrdering::Global, dt)
    }
}

/// Soft and rigid bodies stepped together.
#[derive(Debug, Default)]
pub struct SoftWorld {
    /// Environment.
    pub info: WorldInfo,
    /// Joint visiting order.
    pub ordering: JointOrdering,
    bodies: Vec<SoftBody>,
    rigids: RigidBodySet,
    time: f64,
    step_count: u64,
}

impl SoftWorld {
    /// Create an empty world.
    #[must_use]
    pub fn new(info: WorldInfo) -> Self {
        Self {
            info,
            ..Self::default()
        }
    }

    /// Simulated time.
    #[must_use]
    pub const fn time(&self) -> f64 {
        self.time
    }

    /// Number of completed steps.
    #[must_use]
    pub const fn step_count(&self) -> u64 {
        self.step_count
    }

    /// Add a soft body.
    pub fn add_body(&mut self, body: SoftBody) -> SoftBodyId {
        let id = body.id();
        debug!(body = %id, name = body.name(), "added soft body");
        self.bodies.push(body);
        id
    }

    /// Remove a soft body and every joint of other bodies referring to it.
    pub fn remove_body(&mut self, id: SoftBodyId) -> Option<SoftBody> {
        let index = self.index_of(id)?;
        let body = self.bodies.remove(index);
        self.purge_cluster_joints(id);
        Some(body)
    }

    /// Drop joints of every other body that point into `id`'s clusters.
    fn purge_cluster_joints(&mut self, id: SoftBodyId) {
        for other in self.bodies.iter_mut().filter(|b| b.id() != id) {
            other.joints.retain(|j| !j.references_any_cluster_of(id));
        }
    }

    fn index_of(&self, id: SoftBodyId) -> Option<usize> {
        self.bodies.iter().position(|b| b.id() == id)
    }

    /// Soft body by id.
    #[must_use]
    pub fn body(&self, id: SoftBodyId) -> Option<&SoftBody> {
        self.bodies.iter().find(|b| b.id() == id)
    }

    /// Mutable soft body by id.
    pub fn body_mut(&mut self, id: SoftBodyId) -> Option<&mut SoftBody> {
        self.bodies.iter_mut().find(|b| b.id() == id)
    }

    /// All soft bodies, in stepping order.
    #[must_use]
    pub fn bodies(&self) -> &[SoftBody] {
        &self.bodies
    }

    /// All soft bodies, mutable.
    pub fn bodies_mut(&mut self) -> &mut [SoftBody] {
        &mut self.bodies
    }

    /// Add a rigid body.
    pub fn add_rigid_body(&mut self, rigid: RigidBody) -> RigidBodyId {
        self.rigids.insert(rigid)
    }

    /// Remove a rigid body with every anchor, joint and collision filter
    /// entry referring to it.
    pub fn remove_rigid_body(&mut self, id: RigidBodyId) -> Option<RigidBody> {
        let rigid = self.rigids.remove(id)?;
        for body in &mut self.bodies {
            body.remove_anchors_of(id);
            body.joints.retain(|j| !j.references_rigid(id));
            body.enable_collision_with(id);
        }
        Some(rigid)
    }

    /// Rigid bodies.
    #[must_use]
    pub const fn rigid_bodies(&self) -> &RigidBodySet {
        &self.rigids
    }

    /// Rigid bodies, mutable.
    pub fn rigid_bodies_mut(&mut self) -> &mut RigidBodySet {
        &mut self.rigids
    }

    /// Release cluster `index` of body `id`, dropping joints of any body
    /// attached to it and renumbering references to later clusters.
    pub fn release_cluster(&mut self, id: SoftBodyId, index: usize) -> bool {
        let Some(owner) = self.index_of(id) else {
            return false;
        };
        if !self.bodies[owner].release_cluster(index) {
            return false;
        }
        for (i, body) in self.bodies.iter_mut().enumerate() {
            if i == owner {
                continue;
            }
            body.joints.retain(|j| !j.references_cluster(id, index));
            for j in &mut body.joints {
                j.shift_cluster_refs(id, index);
            }
        }
        true
    }

    /// Re-partition body `id` into clusters.
    ///
    /// Joints of any body attached to the old clusters are dropped first.
    /// Returns the number of clusters, or `None` for an unknown body.
    pub fn generate_clusters(&mut self, id: SoftBodyId, k: usize) -> Option<usize> {
        let owner = self.index_of(id)?;
        self.purge_cluster_joints(id);
        Some(self.bodies[owner].generate_clusters(k))
    }

    /// Release every cluster of body `id` and the joints of any body
    /// attached to them.
    pub fn release_clusters(&mut self, id: SoftBodyId) -> bool {
        let Some(owner) = self.index_of(id) else {
            return false;
        };
        self.purge_cluster_joints(id);
        self.bodies[owner].release_clusters();
        true
    }

    fn frame_of(&self, body: &Body) -> Result<Frame> {
        match *body {
            Body::World => Ok(Frame::identity()),
            Body::Rigid(id) => self
                .rigids
                .get(id)
                .map(|r| Frame::from(&r.pose))
                .ok_or_else(|| SoftBodyError::invalid_joint(format!("no rigid body {}", id.0))),
            Body::Cluster(r) => self
                .body(r.body)
                .and_then(|b| b.cluster(r.index))
                .map(|c| c.frame)
                .ok_or_else(|| SoftBodyError::invalid_joint(format!("no cluster {} on {}", r.index, r.body))),
        }
    }

    fn push_joint(&mut self, owner: ClusterRef, joint: Joint) -> Result<()> {
        let body = self
            .body_mut(owner.body)
            .ok_or_else(|| SoftBodyError::invalid_joint(format!("no soft body {}", owner.body)))?;
        body.joints.push(joint);
        Ok(())
    }

    /// Pin a point of `cluster` to the same world point of `other`, which
    /// may be a cluster of any body in this world.
    ///
    /// # Errors
    ///
    /// Returns [`SoftBodyError::InvalidJoint`] if an endpoint does not exist.
    pub fn append_linear_joint(
        &mut self,
        specs: &JointSpecs,
        cluster: ClusterRef,
        other: Body,
        position: &Point3<f64>,
    ) -> Result<()> {
        let this = Body::Cluster(cluster);
        let frames = [self.frame_of(&this)?, self.frame_of(&other)?];
        self.push_joint(cluster, Joint::linear(specs, [this, other], frames, position))
    }

    /// Align an axis of `cluster` with the same world axis of `other`.
    ///
    /// # Errors
    ///
    /// Returns [`SoftBodyError::InvalidJoint`] if an endpoint does not exist.
    pub fn append_angular_joint(
        &mut self,
        specs: &JointSpecs,
        cluster: ClusterRef,
        other: Body,
        axis: &Vector3<f64>,
        control: Option<Arc<dyn AngularControl>>,
    ) -> Result<()> {
        let this = Body::Cluster(cluster);
        let frames = [self.frame_of(&this)?, self.frame_of(&other)?];
        self.push_joint(cluster, Joint::angular(specs, [this, other], frames, axis, control))
    }

    /// Advance the world by `dt`.
    pub fn step(&mut self, dt: f64) -> StepStats {
        let stats = step_all(&mut self.bodies, &mut self.rigids, &self.info, self.ordering, dt);
        for (_, rigid) in self.rigids.iter_mut() {
            rigid.integrate(dt, &self.info.gravity);
        }
        self.time += dt;
        self.step_count += 1;
        trace!(
            step = self.step_count,
            rigid_contacts = stats.rigid_contacts,
            soft_contacts = stats.soft_contacts,
            joints = stats.joints,
            "world step"
        );
        stats
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::rigid::PlaneSdf;
    use approx::assert_relative_eq;
    use nalgebra::Isometry3;

    fn ground() -> RigidBody {
        RigidBody::fixed(Isometry3::identity()).with_collider(Arc::new(PlaneSdf {
            normal: Vector3::y(),
            offset: 0.0,
        }))
    }

    #[test]
    fn test_world_info_defaults() {
        let info = WorldInfo::default();
        assert_relative_eq!(info.gravity.y, -10.0);
        assert_relative_eq!(info.max_displacement, 1000.0);
        assert_relative_eq!(info.air_density, 1.2);
    }

    #[test]
    fn test_cube_falls_and_rests_on_ground() {
        let mut world = SoftWorld::new(WorldInfo::default());
        world.add_rigid_body(ground());
        let mut cube = SoftBody::cube("cube", Point3::new(0.0, 1.0, 0.0), 1.0, 1.0).unwrap();
        cube.set_collision_margin(0.02);
        let mut config = cube.config().clone();
        config.position_iterations = 8;
        cube.set_config(config).unwrap();
        let id = world.add_body(cube);

        for _ in 0..200 {
            world.step(0.01);
        }
        let body = world.body(id).unwrap();
        let lowest = body
            .nodes()
            .iter()
            .map(|n| n.position.y)
            .fold(f64::INFINITY, f64::min);
        assert!(lowest > -0.1, "cube sank: {lowest}");
        assert!(body.center_of_mass().y < 0.9, "cube did not fall");
        assert_eq!(world.step_count(), 200);
        assert_relative_eq!(world.time(), 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_pinned_cloth_hangs() {
        let mut world = SoftWorld::new(WorldInfo::default());
        let cloth = SoftBody::patch(
            "cloth",
            [
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 0.0, 1.0),
                Point3::new(1.0, 0.0, 1.0),
            ],
            4,
            4,
            1 | 2,
            1.0,
        )
        .unwrap();
        let id = world.add_body(cloth);
        for _ in 0..50 {
            world.step(0.01);
        }
        let body = world.body(id).unwrap();
        assert_eq!(body.nodes()[0].position, Point3::origin());
        assert_eq!(body.nodes()[3].position, Point3::new(1.0, 0.0, 0.0));
        assert!(body.nodes()[15].position.y < -0.1);
    }

    #[test]
    fn test_world_joint_holds_cluster() {
        let mut world = SoftWorld::new(WorldInfo::default());
        let mut cube = SoftBody::cube("cube", Point3::new(0.0, 2.0, 0.0), 1.0, 1.0).unwrap();
        cube.generate_clusters(1);
        let id = world.add_body(cube);
        let cluster = ClusterRef { body: id, index: 0 };
        world
            .append_linear_joint(&JointSpecs::default(), cluster, Body::World, &Point3::new(0.0, 2.0, 0.0))
            .unwrap();
        for _ in 0..100 {
            world.step(0.01);
        }
        let com = world.body(id).unwrap().center_of_mass();
        assert!(com.y > 1.5, "joint did not hold: {}", com.y);
    }

    #[test]
    fn test_invalid_joint_endpoints() {
        let mut world = SoftWorld::new(WorldInfo::default());
        let id = world.add_body(SoftBody::cube("cube", Point3::origin(), 1.0, 1.0).unwrap());
        let missing = ClusterRef { body: id, index: 0 };
        let result = world.append_linear_joint(&JointSpecs::default(), missing, Body::World, &Point3::origin());
        assert!(matches!(result, Err(SoftBodyError::InvalidJoint(_))));
        let result = world.append_linear_joint(
            &JointSpecs::default(),
            missing,
            Body::Rigid(RigidBodyId(4)),
            &Point3::origin(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_remove_rigid_purges_references() {
        let mut world = SoftWorld::new(WorldInfo::default());
        let rid = world.add_rigid_body(RigidBody::fixed(Isometry3::translation(0.0, 2.0, 0.0)));
        let mut cube = SoftBody::cube("cube", Point3::new(0.0, 2.0, 0.0), 1.0, 1.0).unwrap();
        let rigid = world.rigid_bodies().get(rid).unwrap().clone();
        cube.append_anchor_at_node(0, rid, &rigid, 1.0, true).unwrap();
        let id = world.add_body(cube);

        assert!(world.remove_rigid_body(rid).is_some());
        let body = world.body(id).unwrap();
        assert!(body.anchors().is_empty());
        assert!(!body.collision_disabled_with(rid));
        assert!(world.remove_rigid_body(rid).is_none());
    }

    #[test]
    fn test_release_cluster_fixes_foreign_joints() {
        let mut world = SoftWorld::new(WorldInfo::default());
        let mut a = SoftBody::cube("a", Point3::origin(), 1.0, 1.0).unwrap();
        let mut b = SoftBody::cube("b", Point3::new(3.0, 0.0, 0.0), 1.0, 1.0).unwrap();
        a.generate_clusters(0);
        b.generate_clusters(1);
        let ida = world.add_body(a);
        let idb = world.add_body(b);
        let specs = JointSpecs::default();
        let pivot = Point3::new(1.5, 0.0, 0.0);
        world
            .append_linear_joint(&specs, ClusterRef { body: idb, index: 0 }, Body::Cluster(ClusterRef { body: ida, index: 1 }), &pivot)
            .unwrap();
        world
            .append_linear_joint(&specs, ClusterRef { body: idb, index: 0 }, Body::Cluster(ClusterRef { body: ida, index: 3 }), &pivot)
            .unwrap();

        assert!(world.release_cluster(ida, 1));
        let joints = world.body(idb).unwrap().joints();
        assert_eq!(joints.len(), 1);
        assert_eq!(joints[0].bodies[1], Body::Cluster(ClusterRef { body: ida, index: 2 }));
        assert!(!world.release_cluster(ida, 99));
    }

    #[test]
    fn test_regenerating_clusters_drops_foreign_joints() {
        let mut world = SoftWorld::new(WorldInfo::default());
        let mut a = SoftBody::cube("a", Point3::origin(), 1.0, 1.0).unwrap();
        let mut b = SoftBody::cube("b", Point3::new(3.0, 0.0, 0.0), 1.0, 1.0).unwrap();
        a.generate_clusters(0);
        b.generate_clusters(0);
        let ida = world.add_body(a);
        let idb = world.add_body(b);
        let specs = JointSpecs::default();
        let pivot = Point3::new(1.5, 0.0, 0.0);
        world
            .append_linear_joint(&specs, ClusterRef { body: ida, index: 0 }, Body::Cluster(ClusterRef { body: idb, index: 4 }), &pivot)
            .unwrap();
        world
            .append_linear_joint(&specs, ClusterRef { body: ida, index: 1 }, Body::Cluster(ClusterRef { body: idb, index: 0 }), &pivot)
            .unwrap();

        assert_eq!(world.generate_clusters(idb, 2), Some(2));
        assert!(world.body(ida).unwrap().joints().is_empty());
        assert!(world.generate_clusters(SoftBodyId(u64::MAX), 2).is_none());

        world
            .append_linear_joint(&specs, ClusterRef { body: ida, index: 0 }, Body::Cluster(ClusterRef { body: idb, index: 1 }), &pivot)
            .unwrap();
        assert!(world.release_clusters(idb));
        assert!(world.body(ida).unwrap().joints().is_empty());
        assert_eq!(world.body(idb).unwrap().cluster_count(), 0);
        // The owner's own clusters are untouched.
        assert_eq!(world.body(ida).unwrap().cluster_count(), 5);
    }

    #[test]
    fn test_step_bodies_matches_sequential() {
        let make = || {
            vec![
                SoftBody::cube("a", Point3::new(0.0, 1.0, 0.0), 1.0, 1.0).unwrap(),
                SoftBody::rope("b", &Point3::origin(), &Point3::new(1.0, 0.0, 0.0), 4, 1, 1.0).unwrap(),
            ]
        };
        let info = WorldInfo::default();
        let mut batch = make();
        let stats = step_bodies(&mut batch, &info, 0.01);
        assert_eq!(stats.len(), 2);

        let mut single = make();
        let mut rigids = RigidBodySet::new();
        for body in &mut single {
            body.step(0.01, &info, &mut rigids);
        }
        for (x, y) in batch.iter().zip(&single) {
            for (n, m) in x.nodes().iter().zip(y.nodes()) {
                assert_relative_eq!(n.position, m.position, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_solve_clusters_without_joints() {
        let mut bodies = vec![SoftBody::cube("a", Point3::origin(), 1.0, 1.0).unwrap()];
        let mut rigids = RigidBodySet::new();
        assert_eq!(solve_clusters(&mut bodies, &mut rigids, JointOrdering::PerBody), 0);
    }
}
