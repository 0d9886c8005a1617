//! Constraint solver.
//!
//! Each body is solved in two passes after motion prediction and collision
//! detection:
//!
//! 1. **Velocity pass**: `velocity_iterations` sweeps over the velocity
//!    sequence, then positions are re-predicted from the corrected velocities.
//! 2. **Position pass**: `position_iterations` Gauss-Seidel sweeps over the
//!    position sequence. Each kind moves node positions directly; order
//!    within a sweep matters.
//!
//! The drift pass run by the integrator reuses the position kernels with the
//! drift sequence.
//!
//! Soft contacts reference faces of another body, so the kernels take the
//! whole body slice and the index of the body being solved.

use std::mem;

use nalgebra::{Point3, Vector3};
use tracing::trace;

use crate::config::{PositionSolver, VelocitySolver};
use crate::joint::impulse_matrix_dt;
use crate::mesh::{Node, tetra_signed_volume, tetra_volume_gradients};
use crate::rigid::RigidBodySet;
use crate::soft_body::SoftBody;
use crate::types::SoftBodyId;

/// Per-step quantities shared by prediction, the solver and the integrator.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SolverState {
    /// Scaled time step, `dt * timescale`.
    pub sdt: f64,
    /// `1 / sdt`.
    pub isdt: f64,
    /// Velocity margin for tree updates.
    pub velocity_margin: f64,
    /// Radial margin for tree updates.
    pub radial_margin: f64,
    /// Minimum drift before a tree leaf is reinserted.
    pub update_margin: f64,
}

/// Statistics from a step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepStats {
    /// Velocity sweeps performed.
    pub velocity_iterations: usize,
    /// Position sweeps performed.
    pub position_iterations: usize,
    /// Drift sweeps performed.
    pub drift_iterations: usize,
    /// Node vs rigid contacts solved.
    pub rigid_contacts: usize,
    /// Node vs face contacts solved.
    pub soft_contacts: usize,
    /// Joints solved.
    pub joints: usize,
    /// Largest `|length - rest_length|` over all links after solving.
    pub max_link_error: f64,
    /// Kinetic energy of all nodes after the step.
    pub kinetic_energy: f64,
}

impl StepStats {
    /// Accumulate another body's statistics.
    pub fn merge(&mut self, other: &Self) {
        self.velocity_iterations += other.velocity_iterations;
        self.position_iterations += other.position_iterations;
        self.drift_iterations += other.drift_iterations;
        self.rigid_contacts += other.rigid_contacts;
        self.soft_contacts += other.soft_contacts;
        self.joints += other.joints;
        self.max_link_error = self.max_link_error.max(other.max_link_error);
        self.kinetic_energy += other.kinetic_energy;
    }
}

/// Run the velocity and position passes for `bodies[index]`.
///
/// Must follow [`SoftBody::predict_motion`] and collision detection for the
/// same step. An out-of-range index solves nothing.
pub fn solve_constraints(bodies: &mut [SoftBody], index: usize, rigids: &mut RigidBodySet) -> StepStats {
    let Some(body) = bodies.get_mut(index) else {
        return StepStats::default();
    };

    // 1. Per-step terms
    prepare_links(body);
    prepare_anchors(body, rigids);

    let viterations = body.config.velocity_iterations;
    let piterations = body.config.position_iterations;
    let velocity_sequence = body.config.velocity_sequence.clone();
    let position_sequence = body.config.position_sequence.clone();
    let mut stats = StepStats {
        rigid_contacts: body.rigid_contacts.len(),
        soft_contacts: body.soft_contacts.len(),
        ..StepStats::default()
    };

    // 2. Velocity pass
    if viterations > 0 && !velocity_sequence.is_empty() {
        for _ in 0..viterations {
            for kind in &velocity_sequence {
                velocity_kernel(body, *kind, 1.0);
            }
        }
        let sdt = body.state.sdt;
        for node in &mut body.nodes {
            node.position = node.prev_position + node.velocity * sdt;
        }
        stats.velocity_iterations = viterations;
    }

    // 3. Position pass
    for _ in 0..piterations {
        for kind in &position_sequence {
            position_kernel(bodies, index, rigids, *kind, 1.0);
        }
    }
    stats.position_iterations = piterations;

    if let Some(body) = bodies.get(index) {
        stats.max_link_error = max_link_error(body);
        trace!(
            body = %body.id,
            piterations,
            max_link_error = stats.max_link_error,
            "solved constraints"
        );
    }
    stats
}

/// Apply one velocity-domain solver kind to `body` with stiffness scale `kst`.
pub fn velocity_kernel(body: &mut SoftBody, kind: VelocitySolver, kst: f64) {
    match kind {
        VelocitySolver::Linear => vsolve_links(body, kst),
    }
}

/// Apply one position-domain solver kind to `bodies[index]` with stiffness
/// scale `kst`.
pub fn position_kernel(
    bodies: &mut [SoftBody],
    index: usize,
    rigids: &mut RigidBodySet,
    kind: PositionSolver,
    kst: f64,
) {
    if kind == PositionSolver::SoftContacts {
        psolve_soft_contacts(bodies, index);
        return;
    }
    let Some(body) = bodies.get_mut(index) else {
        return;
    };
    match kind {
        PositionSolver::Linear => psolve_links(body, kst),
        PositionSolver::Anchors => psolve_anchors(body, rigids, kst),
        PositionSolver::RigidContacts => psolve_rigid_contacts(body, rigids, kst),
        PositionSolver::Volumes => psolve_volumes(body, kst),
        PositionSolver::SoftContacts => {}
    }
}

fn prepare_links(body: &mut SoftBody) {
    for link in &mut body.links {
        link.prepare(&body.nodes);
    }
}

fn prepare_anchors(body: &mut SoftBody, rigids: &RigidBodySet) {
    let sdt = body.state.sdt;
    for anchor in &mut body.anchors {
        let Some(rigid) = rigids.get(anchor.rigid) else {
            anchor.inv_mass_dt = 0.0;
            continue;
        };
        let im = body.nodes[anchor.node].inv_mass;
        let ra = rigid.pose.rotation * anchor.local;
        anchor.impulse_matrix = impulse_matrix_dt(sdt, im, rigid.inv_mass, &rigid.inv_inertia_world(), &ra);
        anchor.rel_pos = ra;
        anchor.inv_mass_dt = sdt * im;
    }
}

/// Damp relative velocity along each link.
fn vsolve_links(body: &mut SoftBody, kst: f64) {
    for link in &body.links {
        let [a, b] = link.nodes;
        let (im0, im1) = (body.nodes[a].inv_mass, body.nodes[b].inv_mass);
        let dv = body.nodes[a].velocity - body.nodes[b].velocity;
        let j = -link.delta.dot(&dv) * link.impulse_scale * kst;
        body.nodes[a].velocity += link.delta * (j * im0);
        body.nodes[b].velocity -= link.delta * (j * im1);
    }
}

/// Project each link toward its rest length.
fn psolve_links(body: &mut SoftBody, kst: f64) {
    for link in &body.links {
        if link.mass_stiffness <= 0.0 {
            continue;
        }
        let [a, b] = link.nodes;
        let del = body.nodes[b].position - body.nodes[a].position;
        let len2 = del.norm_squared();
        let denom = link.mass_stiffness * (link.rest_length_sq + len2);
        if denom <= f64::EPSILON {
            continue;
        }
        let k = (link.rest_length_sq - len2) / denom * kst;
        let (im0, im1) = (body.nodes[a].inv_mass, body.nodes[b].inv_mass);
        body.nodes[a].position -= del * (k * im0);
        body.nodes[b].position += del * (k * im1);
    }
}

/// Drag anchored nodes toward their pivots and push back on the rigid body.
fn psolve_anchors(body: &mut SoftBody, rigids: &mut RigidBodySet, kst: f64) {
    let k = body.config.anchor_hardness * kst;
    let sdt = body.state.sdt;
    for anchor in &body.anchors {
        let Some(rigid) = rigids.get_mut(anchor.rigid) else {
            continue;
        };
        let node = &mut body.nodes[anchor.node];
        let wa = rigid.pose * Point3::from(anchor.local);
        let va = rigid.velocity_at(&anchor.rel_pos) * sdt;
        let vb = node.position - node.prev_position;
        let vr = (va - vb) + (wa - node.position) * k;
        let impulse = anchor.impulse_matrix * vr * anchor.influence;
        node.position += impulse * anchor.inv_mass_dt;
        rigid.apply_impulse(&-impulse, &anchor.rel_pos);
    }
}

/// Resolve penetration and friction against rigid bodies.
fn psolve_rigid_contacts(body: &mut SoftBody, rigids: &mut RigidBodySet, kst: f64) {
    let sdt = body.state.sdt;
    let margin = body.collision_margin;
    for contact in &body.rigid_contacts {
        let Some(rigid) = rigids.get_mut(contact.rigid) else {
            continue;
        };
        let node = &mut body.nodes[contact.node];
        let va = rigid.velocity_at(&contact.rel_pos) * sdt;
        let vb = node.position - node.prev_position;
        let vr = vb - va;
        let dn = vr.dot(&contact.normal);
        if dn > f64::EPSILON {
            continue;
        }
        let dp = (contact.normal.dot(&node.position.coords) + contact.offset).min(margin);
        let fv = vr - contact.normal * dn;
        let impulse = contact.impulse_matrix
            * ((vr - fv * contact.friction + contact.normal * (dp * contact.hardness)) * kst);
        node.position -= impulse * contact.inv_mass_dt;
        rigid.apply_impulse(&impulse, &contact.rel_pos);
    }
}

pub(crate) fn pair_mut(bodies: &mut [SoftBody], a: usize, b: usize) -> Option<(&mut SoftBody, &mut SoftBody)> {
    if a == b || a >= bodies.len() || b >= bodies.len() {
        return None;
    }
    if a < b {
        let (left, right) = bodies.split_at_mut(b);
        Some((&mut left[a], &mut right[0]))
    } else {
        let (left, right) = bodies.split_at_mut(a);
        Some((&mut right[0], &mut left[b]))
    }
}

/// Separate nodes from faces of other bodies.
fn psolve_soft_contacts(bodies: &mut [SoftBody], index: usize) {
    let Some(body) = bodies.get_mut(index) else {
        return;
    };
    let contacts = mem::take(&mut body.soft_contacts);
    let mut cached: Option<(SoftBodyId, usize)> = None;

    for c in &contacts {
        let other = match cached {
            Some((id, i)) if id == c.face_body => i,
            _ => {
                let Some(i) = bodies.iter().position(|b| b.id == c.face_body) else {
                    continue;
                };
                cached = Some((c.face_body, i));
                i
            }
        };
        let Some((body, face_body)) = pair_mut(bodies, index, other) else {
            continue;
        };
        let Some(face) = face_body.faces.get(c.face) else {
            continue;
        };
        let fnodes = face.nodes;
        let w = c.weights;
        let p = bary_eval(&face_body.nodes, fnodes, &w, |n| n.position.coords);
        let q = bary_eval(&face_body.nodes, fnodes, &w, |n| n.prev_position.coords);

        let node = &mut body.nodes[c.node];
        let vr = (node.position - node.prev_position) - (p - q);
        let mut corr = Vector3::zeros();
        let dot = vr.dot(&c.normal);
        if dot < 0.0 {
            let j = c.margin - (c.normal.dot(&node.position.coords) - c.normal.dot(&p));
            corr += c.normal * j;
        }
        corr -= (vr - c.normal * dot) * c.friction;
        node.position += corr * c.cfm[0];
        for (k, &i) in fnodes.iter().enumerate() {
            face_body.nodes[i].position -= corr * (c.cfm[1] * w[k]);
        }
    }

    if let Some(body) = bodies.get_mut(index) {
        body.soft_contacts = contacts;
    }
}

fn bary_eval(nodes: &[Node], face: [usize; 3], w: &Vector3<f64>, f: impl Fn(&Node) -> Vector3<f64>) -> Vector3<f64> {
    f(&nodes[face[0]]) * w.x + f(&nodes[face[1]]) * w.y + f(&nodes[face[2]]) * w.z
}

/// Project each tetrahedron toward its rest volume.
fn psolve_volumes(body: &mut SoftBody, kst: f64) {
    for t in &body.tetras {
        if t.stiffness <= 0.0 {
            continue;
        }
        let p = t.corners(&body.nodes);
        let c = tetra_signed_volume(&p) - t.rest_volume;
        let g = tetra_volume_gradients(&p);
        let w: f64 = t
            .nodes
            .iter()
            .zip(&g)
            .map(|(&i, gi)| body.nodes[i].inv_mass * gi.norm_squared())
            .sum();
        if w <= f64::EPSILON {
            continue;
        }
        let lambda = -c / w * t.stiffness * kst;
        for (&i, gi) in t.nodes.iter().zip(&g) {
            let im = body.nodes[i].inv_mass;
            body.nodes[i].position += gi * (lambda * im);
        }
    }
}

fn max_link_error(body: &SoftBody) -> f64 {
    body.links
        .iter()
        .map(|l| (l.length(&body.nodes) - l.rest_length).abs())
        .fold(0.0, f64::max)
}

impl SoftBody {
    /// Relax links and volumes without advancing time.
    ///
    /// Useful to settle a freshly built or edited mesh. Velocities are not
    /// touched.
    pub fn static_solve(&mut self, iterations: usize) {
        for _ in 0..iterations {
            psolve_links(self, 1.0);
            psolve_volumes(self, 1.0);
        }
        self.update_normals();
        self.update_bounds();
    }

    /// Kinetic energy of the nodes.
    #[must_use]
    pub fn kinetic_energy(&self) -> f64 {
        self.nodes
            .iter()
            .map(|n| 0.5 * n.mass() * n.velocity.norm_squared())
            .sum()
    }
}
