//! Time integration.
//!
//! A step brackets the solver with two integrator halves:
//!
//! - [`SoftBody::predict_motion`] turns forces into velocities (explicit
//!   Euler), predicts positions, refreshes clusters, trees and the pose, and
//!   clears last step's node contacts.
//! - [`integrate_motion`] commits solved positions and derives velocities
//!   from the actual displacement, `v = (x - q) / dt`, so velocity never
//!   drifts from the applied motion.
//!
//! With zero forces and zero velocity, a predict/integrate pair leaves every
//! node where it was.

use nalgebra::Vector3;
use tracing::trace;

use crate::dbvt::Aabb;
use crate::rigid::RigidBodySet;
use crate::soft_body::SoftBody;
use crate::solver::{SolverState, position_kernel};
use crate::types::NodeFlags;
use crate::world::WorldInfo;

/// Smallest scaled time step.
const MIN_DT: f64 = 1e-10;

impl SoftBody {
    /// First half of a step: integrate forces and predict positions.
    pub fn predict_motion(&mut self, dt: f64, info: &WorldInfo) {
        // Guard against zero timestep
        let sdt = (dt * self.config.timescale).max(MIN_DT);
        self.state = SolverState {
            sdt,
            isdt: 1.0 / sdt,
            velocity_margin: sdt * 3.0,
            radial_margin: self.collision_margin,
            update_margin: self.collision_margin * 0.25,
        };

        // 1. Gravity
        let dv = info.gravity * sdt;
        self.add_velocity(&dv);

        // 2. External forces
        self.update_area();
        self.apply_aero_forces(info.air_density);
        self.apply_volume_forces();

        // 3. Integrate
        let clamp = info.max_displacement / sdt;
        for node in &mut self.nodes {
            node.prev_position = node.position;
            let dv = (node.force * (node.inv_mass * sdt)).map(|c| c.clamp(-clamp, clamp));
            node.velocity += dv;
            node.position += node.velocity * sdt;
            node.force = Vector3::zeros();
        }

        // 4. Clusters and bounds
        self.update_clusters();
        self.update_bounds();
        self.update_tree_leaves();

        // 5. Pose
        self.pose.update(&self.nodes, self.config.max_volume);
        let kmt = self.config.pose_matching;
        if self.pose.has_frame && kmt > 0.0 && self.pose.tracks(self.nodes.len()) {
            for (i, node) in self.nodes.iter_mut().enumerate() {
                if node.is_pinned() {
                    continue;
                }
                if let Some(goal) = self.pose.goal(i) {
                    node.position += (goal - node.position) * kmt;
                }
            }
        }

        // 6. Contacts from the previous step
        self.rigid_contacts.clear();
        self.soft_contacts.clear();
        for node in &mut self.nodes {
            node.flags.remove(NodeFlags::COLLIDING);
        }
        trace!(body = %self.id, sdt, "predicted motion");
    }

    /// Pressure and volume conservation forces along node normals.
    fn apply_volume_forces(&mut self) {
        let kpr = self.config.pressure;
        let kvc = self.config.volume_conservation;
        let use_pressure = kpr != 0.0;
        let use_volume = self.pose.has_volume && kvc > 0.0;
        if !use_pressure && !use_volume {
            return;
        }
        let volume = self.volume();
        let pressure = if use_pressure && volume.abs() > f64::EPSILON {
            kpr / volume.abs()
        } else {
            0.0
        };
        let conservation = if use_volume {
            (self.pose.volume - volume) * kvc
        } else {
            0.0
        };
        for node in self.nodes.iter_mut().filter(|n| !n.is_pinned()) {
            node.force += node.normal * (node.area * (pressure + conservation));
        }
    }

    fn update_tree_leaves(&mut self) {
        let SolverState {
            velocity_margin,
            radial_margin,
            update_margin,
            ..
        } = self.state;
        for node in &self.nodes {
            if let Some(leaf) = node.leaf {
                let volume = Aabb::from_center_radius(node.position, radial_margin);
                self.node_tree
                    .update_with_margin(leaf, volume, &(node.velocity * velocity_margin), update_margin);
            }
        }
        for face in &self.faces {
            let Some(leaf) = face.leaf else {
                continue;
            };
            let corners = face.corners(&self.nodes);
            let Some(volume) = Aabb::from_points(&corners) else {
                continue;
            };
            let [a, b, c] = face.nodes;
            let v = (self.nodes[a].velocity + self.nodes[b].velocity + self.nodes[c].velocity) / 3.0;
            self.face_tree.update_with_margin(
                leaf,
                volume.expanded(radial_margin),
                &(v * velocity_margin),
                update_margin,
            );
        }
    }
}

/// Second half of a step for `bodies[index]`: apply cluster impulses, derive
/// velocities, run the drift pass and refresh normals and bounds.
///
/// Returns the number of drift sweeps performed.
pub fn integrate_motion(bodies: &mut [SoftBody], index: usize, rigids: &mut RigidBodySet) -> usize {
    let Some(body) = bodies.get_mut(index) else {
        return 0;
    };

    // 1. Velocity impulses from the joint solve
    body.apply_clusters(false);

    // 2. Velocities from displacement
    let vc = body.state.isdt * (1.0 - body.config.damping);
    for node in &mut body.nodes {
        node.velocity = (node.position - node.prev_position) * vc;
        node.force = Vector3::zeros();
    }

    // 3. Drift
    let diterations = body.config.drift_iterations;
    if diterations > 0 {
        let vcf = body.config.velocity_correction * body.state.isdt;
        let sequence = body.config.drift_sequence.clone();
        for node in &mut body.nodes {
            node.prev_position = node.position;
        }
        for _ in 0..diterations {
            for kind in &sequence {
                position_kernel(bodies, index, rigids, *kind, 1.0);
            }
        }
        let Some(body) = bodies.get_mut(index) else {
            return 0;
        };
        for node in &mut body.nodes {
            node.velocity += (node.position - node.prev_position) * vcf;
        }
    }

    // 4. Cluster drift and damping
    let Some(body) = bodies.get_mut(index) else {
        return 0;
    };
    body.damp_clusters();
    body.apply_clusters(true);

    body.update_normals();
    body.update_bounds();
    diterations
}
