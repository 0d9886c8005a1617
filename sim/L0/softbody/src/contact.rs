//! Anchors, contact records and collision detection.
//!
//! Node contacts ([`RigidContact`], [`SoftContact`]) are rebuilt every step
//! after motion prediction and consumed by the position solver. Cluster
//! collisions produce contact [`Joint`]s instead, which the joint solver
//! keeps alive while the contact is re-detected and up to the configured
//! maximum life.
//!
//! | Handler | Pair | Result |
//! |---|---|---|
//! | `SDF_RS` | node vs rigid signed distance | [`RigidContact`] |
//! | `VF_SS` | node vs face, two bodies | [`SoftContact`] |
//! | `CL_RS` | cluster vs rigid signed distance | contact joint |
//! | `CL_SS` | cluster vs cluster, two bodies | contact joint |
//! | `CL_SELF` | non-adjacent clusters, one body | contact joint |

use nalgebra::{Matrix3, Point3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::cluster::Cluster;
use crate::config::CollisionFlags;
use crate::joint::{Body, ClusterRef, Joint, impulse_matrix, impulse_matrix_dt};
use crate::mesh::{Node, barycentric, closest_point_on_triangle};
use crate::rigid::{RigidBody, RigidBodyId};
use crate::soft_body::SoftBody;
use crate::types::{Frame, NodeFlags, SoftBodyId};

/// A node bound to a point of a rigid body.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Anchor {
    /// Anchored node.
    pub node: usize,
    /// Rigid body.
    pub rigid: RigidBodyId,
    /// Pivot in the rigid body's local frame.
    pub local: Vector3<f64>,
    /// Share of the correction applied per pass, `[0, 1]`.
    pub influence: f64,
    /// Per-step impulse matrix.
    pub impulse_matrix: Matrix3<f64>,
    /// Per-step pivot offset from the rigid origin, world space.
    pub rel_pos: Vector3<f64>,
    /// Per-step `dt * inv_mass` of the node.
    pub inv_mass_dt: f64,
}

impl Anchor {
    /// Create an anchor; per-step terms are filled by the solver.
    #[must_use]
    pub fn new(node: usize, rigid: RigidBodyId, local: Vector3<f64>, influence: f64) -> Self {
        Self {
            node,
            rigid,
            local,
            influence,
            impulse_matrix: Matrix3::zeros(),
            rel_pos: Vector3::zeros(),
            inv_mass_dt: 0.0,
        }
    }
}

/// Node vs rigid body contact.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RigidContact {
    /// Node index.
    pub node: usize,
    /// Rigid body.
    pub rigid: RigidBodyId,
    /// Outward surface normal of the rigid body.
    pub normal: Vector3<f64>,
    /// Plane offset: `normal · x + offset` is the signed depth.
    pub offset: f64,
    /// Impulse matrix.
    pub impulse_matrix: Matrix3<f64>,
    /// Contact point relative to the rigid origin.
    pub rel_pos: Vector3<f64>,
    /// `dt * inv_mass` of the node.
    pub inv_mass_dt: f64,
    /// Fraction of tangential motion left unresolved (0 sticks).
    pub friction: f64,
    /// Contact hardness.
    pub hardness: f64,
}

/// Node vs face contact between two soft bodies.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SoftContact {
    /// Node index in the owning body.
    pub node: usize,
    /// Body owning the face.
    pub face_body: SoftBodyId,
    /// Face index in `face_body`.
    pub face: usize,
    /// Barycentric weights of the closest point.
    pub weights: Vector3<f64>,
    /// Normal from the face toward the node.
    pub normal: Vector3<f64>,
    /// Separation to maintain.
    pub margin: f64,
    /// Friction.
    pub friction: f64,
    /// Share of the correction taken by the node and by the face.
    pub cfm: [f64; 2],
}

impl SoftBody {
    /// Whether collisions with `rigid` are disabled.
    #[must_use]
    pub fn collision_disabled_with(&self, rigid: RigidBodyId) -> bool {
        self.disabled_collisions.contains(&rigid)
    }

    /// Skip all contact generation against `rigid`.
    pub fn disable_collision_with(&mut self, rigid: RigidBodyId) {
        if !self.collision_disabled_with(rigid) {
            self.disabled_collisions.push(rigid);
        }
    }

    /// Re-enable contact generation against `rigid`.
    pub fn enable_collision_with(&mut self, rigid: RigidBodyId) {
        self.disabled_collisions.retain(|&r| r != rigid);
    }

    /// Generate node contacts against a rigid body's signed distance field.
    ///
    /// Must run after motion prediction. Returns the number of contacts added.
    pub fn collide_rigid(&mut self, id: RigidBodyId, rigid: &RigidBody) -> usize {
        if rigid.collider.is_none() || self.collision_disabled_with(id) {
            return 0;
        }
        let margin = self.collision_margin;
        let mut candidates = Vec::new();
        match rigid.world_aabb() {
            Some(volume) => self
                .node_tree
                .collide_volume(&volume.expanded(margin), |i| candidates.push(i)),
            None => candidates.extend(0..self.nodes.len()),
        }
        candidates.sort_unstable();

        let sdt = self.state.sdt;
        let dynamic_margin = margin + rigid.margin;
        let imb = rigid.inv_mass;
        let iwi = rigid.inv_inertia_world();
        let fc = self.config.dynamic_friction * rigid.friction;
        let hardness = if rigid.is_immovable() {
            self.config.kinetic_contact_hardness
        } else {
            self.config.rigid_contact_hardness
        };

        let before = self.rigid_contacts.len();
        for i in candidates {
            let node = &self.nodes[i];
            let m = if node.is_pinned() { margin } else { dynamic_margin };
            let Some((d, normal)) = rigid.signed_distance(&node.position) else {
                continue;
            };
            let dst = d - m;
            if dst >= 0.0 {
                continue;
            }
            let ima = node.inv_mass;
            if ima + imb <= 0.0 {
                continue;
            }
            let ra = node.position - rigid.pose.translation.vector;
            let ra = ra.coords;
            let va = rigid.velocity_at(&ra) * sdt;
            let vr = (node.position - node.prev_position) - va;
            let dn = vr.dot(&normal);
            let fv = vr - normal * dn;
            let friction = if fv.norm_squared() < (dn * fc).powi(2) {
                0.0
            } else {
                1.0 - fc
            };
            self.rigid_contacts.push(RigidContact {
                node: i,
                rigid: id,
                normal,
                offset: -normal.dot(&(node.position.coords - normal * dst)),
                impulse_matrix: impulse_matrix_dt(sdt, ima, imb, &iwi, &ra),
                rel_pos: ra,
                inv_mass_dt: ima * sdt,
                friction,
                hardness,
            });
            self.nodes[i].flags.insert(NodeFlags::COLLIDING);
        }
        self.rigid_contacts.len() - before
    }

    /// Generate cluster contact joints against a rigid body.
    ///
    /// Returns the number of contacts detected.
    pub fn collide_clusters_rigid(&mut self, id: RigidBodyId, rigid: &RigidBody) -> usize {
        if rigid.collider.is_none() || self.collision_disabled_with(id) || self.clusters.is_empty() {
            return 0;
        }
        let margin = self.collision_margin + rigid.margin;
        let mut candidates = Vec::new();
        match rigid.world_aabb() {
            Some(volume) => self
                .cluster_tree
                .collide_volume(&volume.expanded(margin), |c| candidates.push(c)),
            None => candidates.extend(0..self.clusters.len()),
        }
        candidates.sort_unstable();

        let friction = self.config.dynamic_friction.max(rigid.friction);
        let (erp, split) = if rigid.is_immovable() {
            (self.config.cluster_kinetic_hardness, self.config.cluster_kinetic_split)
        } else {
            (self.config.cluster_rigid_hardness, self.config.cluster_rigid_split)
        };
        let rigid_frame = Frame::from(&rigid.pose);

        let mut found = Vec::new();
        for c in candidates {
            let cluster = &self.clusters[c];
            if !cluster.collide {
                continue;
            }
            // Deepest member node.
            let mut deepest: Option<(usize, f64, Vector3<f64>)> = None;
            for &i in &cluster.nodes {
                if let Some((d, n)) = rigid.signed_distance(&self.nodes[i].position) {
                    if deepest.is_none_or(|(_, best, _)| d < best) {
                        deepest = Some((i, d, n));
                    }
                }
            }
            let Some((i, d, normal)) = deepest else {
                continue;
            };
            if d >= margin {
                continue;
            }
            let wa = self.nodes[i].position;
            let wb = wa - normal * d;
            let geometry = ContactGeometry {
                witnesses: [wa, wb],
                normal,
                depth: d - margin,
                friction,
            };
            let bodies = [
                Body::Cluster(ClusterRef {
                    body: self.id,
                    index: c,
                }),
                Body::Rigid(id),
            ];
            let mut joint = contact_joint(
                bodies,
                [
                    (cluster.frame, cluster.inv_mass, cluster.world_inv_inertia, cluster_velocity(cluster)),
                    (
                        rigid_frame,
                        rigid.inv_mass,
                        rigid.inv_inertia_world(),
                        RigidVelocity::of(rigid),
                    ),
                ],
                &geometry,
                self.config.contact_max_life,
            );
            joint.erp *= erp;
            joint.split *= split;
            found.push(joint);
        }
        let count = found.len();
        for joint in found {
            self.upsert_contact_joint(joint);
        }
        count
    }

    /// Generate contact joints between non-adjacent clusters of this body.
    ///
    /// Returns the number of contacts detected.
    pub fn collide_clusters_self(&mut self) -> usize {
        let n = self.clusters.len();
        let mut pairs = Vec::new();
        self.cluster_tree.collide_tree(&self.cluster_tree, |a, b| {
            if a < b {
                pairs.push((a, b));
            }
        });
        pairs.sort_unstable();
        pairs.dedup();

        let margin = 2.0 * self.collision_margin;
        let friction = self.config.dynamic_friction;
        let mut found = Vec::new();
        for (a, b) in pairs {
            if a >= n || b >= n || self.clusters_adjacent(a, b) {
                continue;
            }
            let (ca, cb) = (&self.clusters[a], &self.clusters[b]);
            if !ca.collide || !cb.collide {
                continue;
            }
            let Some(geometry) = cluster_separation(ca, &self.nodes, cb, &self.nodes, margin, friction) else {
                continue;
            };
            let mut joint = contact_joint(
                [
                    Body::Cluster(ClusterRef {
                        body: self.id,
                        index: a,
                    }),
                    Body::Cluster(ClusterRef {
                        body: self.id,
                        index: b,
                    }),
                ],
                [
                    (ca.frame, ca.inv_mass, ca.world_inv_inertia, cluster_velocity(ca)),
                    (cb.frame, cb.inv_mass, cb.world_inv_inertia, cluster_velocity(cb)),
                ],
                &geometry,
                self.config.contact_max_life,
            );
            joint.erp *= self.config.cluster_soft_hardness;
            joint.split *= self.config.cluster_soft_split;
            found.push(joint);
        }
        let count = found.len();
        for joint in found {
            self.upsert_contact_joint(joint);
        }
        count
    }

    /// Refresh a live contact joint between the same endpoints or add a new one.
    pub(crate) fn upsert_contact_joint(&mut self, joint: Joint) {
        match self
            .joints
            .iter_mut()
            .find(|j| j.is_contact() && j.same_bodies(&joint))
        {
            Some(existing) => existing.refresh_contact(&joint),
            None => self.joints.push(joint),
        }
    }

    /// Mark every contact joint as not yet re-detected.
    pub(crate) fn begin_contact_detection(&mut self) {
        for j in &mut self.joints {
            j.begin_detection();
        }
    }

    /// Purge contact joints the last collision pass did not re-detect.
    pub(crate) fn end_contact_detection(&mut self) {
        self.joints.retain(Joint::is_detected);
    }
}

/// Node-vs-face contacts between `a` (nodes) and `b` (faces), both directions.
///
/// Both bodies must enable [`CollisionFlags::VF_SS`]. Returns the number of
/// contacts added.
pub fn collide_soft(a: &mut SoftBody, b: &mut SoftBody) -> usize {
    if !a.config.collisions.contains(CollisionFlags::VF_SS)
        || !b.config.collisions.contains(CollisionFlags::VF_SS)
    {
        return 0;
    }
    collide_vertex_face(a, b) + collide_vertex_face(b, a)
}

fn collide_vertex_face(nodes_body: &mut SoftBody, faces_body: &SoftBody) -> usize {
    let mrg = nodes_body.collision_margin + faces_body.collision_margin;
    let mut pairs = Vec::new();
    nodes_body
        .node_tree
        .collide_tree(&faces_body.face_tree, |n, f| pairs.push((n, f)));
    pairs.sort_unstable();

    let friction = nodes_body
        .config
        .dynamic_friction
        .max(faces_body.config.dynamic_friction);
    let shr = [
        nodes_body.config.soft_contact_hardness,
        faces_body.config.soft_contact_hardness,
    ];

    let before = nodes_body.soft_contacts.len();
    for (n, f) in pairs {
        let (Some(node), Some(face)) = (nodes_body.nodes.get(n), faces_body.faces.get(f)) else {
            continue;
        };
        let o = node.position;
        let [pa, pb, pc] = face.corners(&faces_body.nodes);
        let closest = closest_point_on_triangle(&o, &pa, &pb, &pc);
        let d2 = (closest - o).norm_squared();
        let m = mrg + (o - node.prev_position).norm() * 2.0;
        if d2 >= m * m {
            continue;
        }

        let corners = face.nodes.map(|i| &faces_body.nodes[i]);
        let weights = barycentric(&pa, &pb, &pc, &closest);
        let ma = node.inv_mass;
        let mb = if corners.iter().any(|c| c.is_pinned()) {
            0.0
        } else {
            weights.x * corners[0].inv_mass + weights.y * corners[1].inv_mass + weights.z * corners[2].inv_mass
        };
        let ms = ma + mb;
        if ms <= 0.0 {
            continue;
        }
        let normal = if d2 > f64::EPSILON {
            (o - closest) / d2.sqrt()
        } else {
            face.normal
        };
        nodes_body.soft_contacts.push(SoftContact {
            node: n,
            face_body: faces_body.id,
            face: f,
            weights,
            normal,
            margin: m,
            friction,
            cfm: [ma / ms * shr[0], mb / ms * shr[1]],
        });
        nodes_body.nodes[n].flags.insert(NodeFlags::COLLIDING);
    }
    nodes_body.soft_contacts.len() - before
}

/// Contact joints between the clusters of two different bodies.
///
/// Both bodies must enable [`CollisionFlags::CL_SS`]. Joints are stored on
/// `a`. Returns the number of contacts detected.
pub fn collide_clusters_soft(a: &mut SoftBody, b: &SoftBody) -> usize {
    if !a.config.collisions.contains(CollisionFlags::CL_SS)
        || !b.config.collisions.contains(CollisionFlags::CL_SS)
    {
        return 0;
    }
    let mut pairs = Vec::new();
    a.cluster_tree
        .collide_tree(&b.cluster_tree, |ca, cb| pairs.push((ca, cb)));
    pairs.sort_unstable();

    let margin = a.collision_margin + b.collision_margin;
    let friction = a.config.dynamic_friction.max(b.config.dynamic_friction);
    let erp = a.config.cluster_soft_hardness.max(b.config.cluster_soft_hardness);
    let split = (a.config.cluster_soft_split + b.config.cluster_soft_split) / 2.0;

    let mut found = Vec::new();
    for (ia, ib) in pairs {
        let (Some(ca), Some(cb)) = (a.clusters.get(ia), b.clusters.get(ib)) else {
            continue;
        };
        if !ca.collide || !cb.collide {
            continue;
        }
        let Some(geometry) = cluster_separation(ca, &a.nodes, cb, &b.nodes, margin, friction) else {
            continue;
        };
        let mut joint = contact_joint(
            [
                Body::Cluster(ClusterRef {
                    body: a.id,
                    index: ia,
                }),
                Body::Cluster(ClusterRef {
                    body: b.id,
                    index: ib,
                }),
            ],
            [
                (ca.frame, ca.inv_mass, ca.world_inv_inertia, cluster_velocity(ca)),
                (cb.frame, cb.inv_mass, cb.world_inv_inertia, cluster_velocity(cb)),
            ],
            &geometry,
            a.config.contact_max_life,
        );
        joint.erp *= erp;
        joint.split *= split;
        found.push(joint);
    }
    let count = found.len();
    for joint in found {
        a.upsert_contact_joint(joint);
    }
    count
}

/// Witness points and normal of a detected contact.
#[derive(Debug, Clone, Copy)]
struct ContactGeometry {
    /// Closest points on A and on B.
    witnesses: [Point3<f64>; 2],
    /// Unit normal from B toward A.
    normal: Vector3<f64>,
    /// Separation minus margin, negative when penetrating.
    depth: f64,
    /// Friction coefficient.
    friction: f64,
}

#[derive(Debug, Clone, Copy)]
struct RigidVelocity {
    linear: Vector3<f64>,
    angular: Vector3<f64>,
}

impl RigidVelocity {
    fn of(rigid: &RigidBody) -> Self {
        Self {
            linear: rigid.linear_velocity,
            angular: rigid.angular_velocity,
        }
    }

    fn at(&self, r: &Vector3<f64>) -> Vector3<f64> {
        self.linear + self.angular.cross(r)
    }
}

fn cluster_velocity(cluster: &Cluster) -> RigidVelocity {
    RigidVelocity {
        linear: cluster.linear_velocity,
        angular: cluster.angular_velocity,
    }
}

/// Build a contact joint from detected geometry and the endpoints' current
/// frame, inverse mass, inverse world inertia and velocity.
fn contact_joint(
    bodies: [Body; 2],
    ends: [(Frame, f64, Matrix3<f64>, RigidVelocity); 2],
    geometry: &ContactGeometry,
    max_life: u32,
) -> Joint {
    let [(fa, ima, iia, va), (fb, imb, iib, vb)] = ends;
    let ra = geometry.witnesses[0] - fa.origin;
    let rb = geometry.witnesses[1] - fb.origin;
    let vrel = va.at(&ra) - vb.at(&rb);
    let rvac = vrel.dot(&geometry.normal);
    let fv = vrel - geometry.normal * rvac;
    let mu = geometry.friction;
    let friction = if fv.norm_squared() < (rvac * mu).powi(2) {
        1.0
    } else {
        mu
    };
    Joint::contact(
        bodies,
        [fa, fb],
        [ra, rb],
        geometry.normal,
        geometry.depth,
        friction,
        max_life,
        impulse_matrix(ima, &iia, &ra, imb, &iib, &rb),
    )
}

/// Separation of two clusters along the axis joining their centers.
///
/// Returns contact geometry when the gap along the axis is below `margin`.
fn cluster_separation(
    a: &Cluster,
    a_nodes: &[Node],
    b: &Cluster,
    b_nodes: &[Node],
    margin: f64,
    friction: f64,
) -> Option<ContactGeometry> {
    let bounds_a = a.bounds(a_nodes)?;
    let bounds_b = b.bounds(b_nodes)?;
    if !bounds_a.expanded(margin).overlaps(&bounds_b) {
        return None;
    }
    let normal = (a.com - b.com).try_normalize(1e-12)?;

    // Point of A furthest toward B and point of B furthest toward A.
    let support = |nodes: &[Node], members: &[usize], sign: f64| {
        members
            .iter()
            .map(|&i| (i, nodes[i].position.coords.dot(&normal) * sign))
            .fold(None, |best: Option<(usize, f64)>, (i, s)| match best {
                Some((_, bs)) if bs <= s => best,
                _ => Some((i, s)),
            })
    };
    let (ia, sa) = support(a_nodes, a.nodes.as_slice(), 1.0)?;
    let (ib, sb) = support(b_nodes, b.nodes.as_slice(), -1.0)?;
    let distance = sa + sb;
    if distance >= margin {
        return None;
    }
    Some(ContactGeometry {
        witnesses: [a_nodes[ia].position, b_nodes[ib].position],
        normal,
        depth: distance - margin,
        friction,
    })
}
