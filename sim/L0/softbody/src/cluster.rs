//! Rigid clusters: groups of nodes treated as approximate rigid bodies.
//!
//! Clusters let deformable contact be resolved with rigid-body machinery.
//! Each cluster keeps a mass, an inertia tensor in its reference frame, a
//! best-fit frame recomputed every step by polar decomposition, and linear
//! and angular velocities gathered from its nodes. Joints and contacts push
//! impulses into clusters; [`SoftBody::apply_clusters`] spreads the resulting
//! velocity changes back onto the nodes, mass-weighted across every cluster a
//! node belongs to.
//!
//! # Generation
//!
//! - `k = 0`: one cluster per tetrahedron, or one per face for surface-only
//!   bodies. No approximation.
//! - `k > 0`: mass-weighted k-means over node positions. Seed `c` is node
//!   `c * n / k`, so cluster indices follow the index order of their seed
//!   nodes. Nodes are assigned in index order and a node equidistant from
//!   several centroids joins the lowest cluster index, that is the cluster
//!   whose seed node has the lowest index. The loop stops when no node
//!   changes cluster or the iteration cap is hit (the partition reached so
//!   far is kept). A centroid that attracts no node is
//!   reseeded at the node farthest from its own centroid, lowest index first.
//!   Afterwards each cluster absorbs the face (or link) neighbors of its nodes
//!   so that neighboring clusters overlap.

use nalgebra::{Matrix3, Point3, Vector3};
use smallvec::SmallVec;
use tracing::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::dbvt::{Aabb, LeafId};
use crate::mesh::Node;
use crate::pose::polar_decompose;
use crate::soft_body::SoftBody;
use crate::types::Frame;

/// Iteration cap used by [`SoftBody::generate_clusters`].
pub const DEFAULT_KMEANS_ITERATIONS: usize = 8192;

/// A velocity and/or drift impulse.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Impulse {
    /// Velocity-level impulse.
    pub velocity: Vector3<f64>,
    /// Position-level (drift) impulse.
    pub drift: Vector3<f64>,
    /// Apply the velocity part.
    pub as_velocity: bool,
    /// Apply the drift part.
    pub as_drift: bool,
}

impl Impulse {
    /// Velocity-only impulse.
    #[must_use]
    pub fn velocity(v: Vector3<f64>) -> Self {
        Self {
            velocity: v,
            drift: Vector3::zeros(),
            as_velocity: true,
            as_drift: false,
        }
    }

    /// Drift-only impulse.
    #[must_use]
    pub fn drift(d: Vector3<f64>) -> Self {
        Self {
            velocity: Vector3::zeros(),
            drift: d,
            as_velocity: false,
            as_drift: true,
        }
    }
}

impl std::ops::Neg for Impulse {
    type Output = Self;
    fn neg(self) -> Self {
        Self {
            velocity: -self.velocity,
            drift: -self.drift,
            ..self
        }
    }
}

impl std::ops::Mul<f64> for Impulse {
    type Output = Self;
    fn mul(self, k: f64) -> Self {
        Self {
            velocity: self.velocity * k,
            drift: self.drift * k,
            ..self
        }
    }
}

/// A group of nodes approximated as a rigid body.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Cluster {
    /// Member node indices.
    pub nodes: SmallVec<[usize; 8]>,
    /// Member masses, `0` for pinned members.
    pub masses: SmallVec<[f64; 8]>,
    /// Member offsets from the center of mass at initialization.
    pub frame_refs: Vec<Vector3<f64>>,
    /// Current best-fit frame.
    pub frame: Frame,
    /// Sum of member masses, pinned members excluded.
    pub mass: f64,
    /// Inverse mass, `0` if the cluster holds a pinned node or has no mass.
    pub inv_mass: f64,
    /// Inverse inertia in the reference frame.
    pub local_inv_inertia: Matrix3<f64>,
    /// Inverse inertia in world space.
    pub world_inv_inertia: Matrix3<f64>,
    /// Center of mass.
    pub com: Point3<f64>,
    /// Accumulated velocity impulses (linear, angular).
    pub velocity_impulses: [Vector3<f64>; 2],
    /// Accumulated drift impulses (linear, angular).
    pub drift_impulses: [Vector3<f64>; 2],
    /// Number of velocity impulses this step.
    pub num_velocity_impulses: usize,
    /// Number of drift impulses this step.
    pub num_drift_impulses: usize,
    /// Linear velocity.
    pub linear_velocity: Vector3<f64>,
    /// Angular velocity.
    pub angular_velocity: Vector3<f64>,
    /// Node velocity damping toward the cluster's rigid motion.
    pub node_damping: f64,
    /// Linear velocity damping.
    pub linear_damping: f64,
    /// Angular velocity damping.
    pub angular_damping: f64,
    /// Shape-matching coefficient toward the cluster frame.
    pub matching: f64,
    /// Contains at least one pinned node.
    pub contains_anchor: bool,
    /// Takes part in cluster collisions.
    pub collide: bool,
    /// Leaf in the cluster tree.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub leaf: Option<LeafId>,
}

impl Cluster {
    /// Create an uninitialized cluster over `nodes`.
    #[must_use]
    pub fn new(nodes: impl IntoIterator<Item = usize>) -> Self {
        Self {
            nodes: nodes.into_iter().collect(),
            masses: SmallVec::new(),
            frame_refs: Vec::new(),
            frame: Frame::identity(),
            mass: 0.0,
            inv_mass: 0.0,
            local_inv_inertia: Matrix3::zeros(),
            world_inv_inertia: Matrix3::zeros(),
            com: Point3::origin(),
            velocity_impulses: [Vector3::zeros(); 2],
            drift_impulses: [Vector3::zeros(); 2],
            num_velocity_impulses: 0,
            num_drift_impulses: 0,
            linear_velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            node_damping: 0.0,
            linear_damping: 0.0,
            angular_damping: 0.0,
            matching: 0.0,
            contains_anchor: false,
            collide: true,
            leaf: None,
        }
    }

    /// Mass-weighted center of the members (plain average when massless).
    #[must_use]
    pub fn center_of_mass(&self, nodes: &[Node]) -> Point3<f64> {
        if self.nodes.is_empty() {
            return Point3::origin();
        }
        if self.mass > 0.0 {
            let sum = self
                .nodes
                .iter()
                .zip(&self.masses)
                .fold(Vector3::zeros(), |acc, (&i, &m)| acc + nodes[i].position.coords * m);
            Point3::from(sum / self.mass)
        } else {
            let sum = self
                .nodes
                .iter()
                .fold(Vector3::zeros(), |acc, &i| acc + nodes[i].position.coords);
            Point3::from(sum / self.nodes.len() as f64)
        }
    }

    /// Compute masses, inertia and reference frame from the members.
    pub fn initialize(&mut self, nodes: &[Node]) {
        self.masses = self.nodes.iter().map(|&i| nodes[i].mass()).collect();
        self.contains_anchor = self.nodes.iter().any(|&i| nodes[i].is_pinned());
        self.mass = self.masses.iter().sum();
        self.inv_mass = if self.contains_anchor || self.mass <= 0.0 {
            0.0
        } else {
            1.0 / self.mass
        };
        self.com = self.center_of_mass(nodes);
        self.linear_velocity = Vector3::zeros();
        self.angular_velocity = Vector3::zeros();

        let mut inertia = Matrix3::zeros();
        for (&i, &m) in self.nodes.iter().zip(&self.masses) {
            let k = nodes[i].position - self.com;
            inertia += (Matrix3::identity() * k.norm_squared() - k * k.transpose()) * m;
        }
        self.local_inv_inertia = if self.inv_mass > 0.0 {
            inertia
                .pseudo_inverse(1e-12)
                .unwrap_or_else(|_| Matrix3::zeros())
        } else {
            Matrix3::zeros()
        };
        self.world_inv_inertia = self.local_inv_inertia;

        self.frame = Frame::new(Matrix3::identity(), self.com);
        self.frame_refs = self
            .nodes
            .iter()
            .map(|&i| nodes[i].position - self.com)
            .collect();
    }

    /// Refresh frame, world inertia and velocities; apply shape matching.
    pub fn update(&mut self, nodes: &mut [Node]) {
        if self.nodes.is_empty() {
            return;
        }
        let com = self.center_of_mass(nodes);
        self.com = com;

        let mut m = Matrix3::zeros();
        for (&i, b) in self.nodes.iter().zip(&self.frame_refs) {
            m += (nodes[i].position - com) * b.transpose();
        }
        let (r, _) = polar_decompose(&m);
        self.frame = Frame::new(r, com);
        self.world_inv_inertia = r * self.local_inv_inertia * r.transpose();

        let mut lv = Vector3::zeros();
        let mut av = Vector3::zeros();
        for (&i, &mass) in self.nodes.iter().zip(&self.masses) {
            let v = nodes[i].velocity * mass;
            lv += v;
            av += (nodes[i].position - com).cross(&v);
        }
        self.linear_velocity = lv * (self.inv_mass * (1.0 - self.linear_damping));
        self.angular_velocity = self.world_inv_inertia * av * (1.0 - self.angular_damping);

        self.velocity_impulses = [Vector3::zeros(); 2];
        self.drift_impulses = [Vector3::zeros(); 2];
        self.num_velocity_impulses = 0;
        self.num_drift_impulses = 0;

        if self.matching > 0.0 {
            for (&i, r) in self.nodes.iter().zip(&self.frame_refs) {
                if nodes[i].is_pinned() {
                    continue;
                }
                let goal = self.frame.transform_point(r);
                let x = &mut nodes[i].position;
                *x += (goal - *x) * self.matching;
            }
        }
    }

    /// Bounds of the member nodes.
    #[must_use]
    pub fn bounds(&self, nodes: &[Node]) -> Option<Aabb> {
        Aabb::from_points(self.nodes.iter().map(|&i| &nodes[i].position))
    }

    /// Velocity of the point at `rpos` relative to the center of mass.
    #[must_use]
    pub fn velocity_at(&self, rpos: &Vector3<f64>) -> Vector3<f64> {
        self.linear_velocity + self.angular_velocity.cross(rpos)
    }

    /// Apply a velocity impulse at `rpos`.
    pub fn apply_velocity_impulse(&mut self, rpos: &Vector3<f64>, impulse: &Vector3<f64>) {
        let li = impulse * self.inv_mass;
        let ai = self.world_inv_inertia * rpos.cross(impulse);
        self.velocity_impulses[0] += li;
        self.linear_velocity += li;
        self.velocity_impulses[1] += ai;
        self.angular_velocity += ai;
        self.num_velocity_impulses += 1;
    }

    /// Apply a drift impulse at `rpos`.
    pub fn apply_drift_impulse(&mut self, rpos: &Vector3<f64>, impulse: &Vector3<f64>) {
        self.drift_impulses[0] += impulse * self.inv_mass;
        self.drift_impulses[1] += self.world_inv_inertia * rpos.cross(impulse);
        self.num_drift_impulses += 1;
    }

    /// Apply an impulse at `rpos`.
    pub fn apply_impulse(&mut self, rpos: &Vector3<f64>, impulse: &Impulse) {
        if impulse.as_velocity {
            self.apply_velocity_impulse(rpos, &impulse.velocity);
        }
        if impulse.as_drift {
            self.apply_drift_impulse(rpos, &impulse.drift);
        }
    }

    /// Apply an angular velocity impulse.
    pub fn apply_angular_velocity_impulse(&mut self, impulse: &Vector3<f64>) {
        let ai = self.world_inv_inertia * impulse;
        self.velocity_impulses[1] += ai;
        self.angular_velocity += ai;
        self.num_velocity_impulses += 1;
    }

    /// Apply an angular drift impulse.
    pub fn apply_angular_drift_impulse(&mut self, impulse: &Vector3<f64>) {
        self.drift_impulses[1] += self.world_inv_inertia * impulse;
        self.num_drift_impulses += 1;
    }

    /// Apply an angular impulse.
    pub fn apply_angular_impulse(&mut self, impulse: &Impulse) {
        if impulse.as_velocity {
            self.apply_angular_velocity_impulse(&impulse.velocity);
        }
        if impulse.as_drift {
            self.apply_angular_drift_impulse(&impulse.drift);
        }
    }

    /// Apply a drift impulse through the center of mass.
    pub fn apply_central_drift_impulse(&mut self, impulse: &Vector3<f64>) {
        self.drift_impulses[0] += impulse * self.inv_mass;
        self.num_drift_impulses += 1;
    }
}

/// Mass-weighted k-means over node positions.
///
/// Returns the member lists (ascending node order) and whether the loop
/// converged before `max_iterations`.
fn kmeans(nodes: &[Node], k: usize, max_iterations: usize) -> (Vec<Vec<usize>>, bool) {
    let n = nodes.len();
    let k = k.min(n);
    if k == 0 {
        return (Vec::new(), true);
    }

    let heaviest = nodes.iter().map(Node::mass).fold(0.0, f64::max);
    let pinned_weight = if heaviest > 0.0 { heaviest } else { 1.0 };
    let weights: Vec<f64> = nodes
        .iter()
        .map(|node| if node.is_pinned() { pinned_weight } else { node.mass() })
        .collect();

    let mut centers: Vec<Point3<f64>> = (0..k).map(|c| nodes[c * n / k].position).collect();
    let mut assignment = vec![usize::MAX; n];
    let mut converged = false;
    let mut iterations = 0;

    loop {
        let mut changed = false;
        for (i, node) in nodes.iter().enumerate() {
            let mut best = 0;
            let mut best_d = (node.position - centers[0]).norm_squared();
            for (c, center) in centers.iter().enumerate().skip(1) {
                let d = (node.position - center).norm_squared();
                if d < best_d {
                    best = c;
                    best_d = d;
                }
            }
            if assignment[i] != best {
                assignment[i] = best;
                changed = true;
            }
        }
        if !changed {
            converged = true;
            break;
        }
        if iterations >= max_iterations {
            break;
        }
        iterations += 1;

        let mut sums = vec![Vector3::zeros(); k];
        let mut wsum = vec![0.0; k];
        for (i, node) in nodes.iter().enumerate() {
            sums[assignment[i]] += node.position.coords * weights[i];
            wsum[assignment[i]] += weights[i];
        }
        let mut reseeded: SmallVec<[usize; 4]> = SmallVec::new();
        for c in 0..k {
            if wsum[c] > 0.0 {
                centers[c] = Point3::from(sums[c] / wsum[c]);
                continue;
            }
            // Empty cluster: reseed at the node farthest from its centroid.
            let mut far = None;
            let mut far_d = -1.0;
            for (i, node) in nodes.iter().enumerate() {
                if reseeded.contains(&i) {
                    continue;
                }
                let d = (node.position - centers[assignment[i]]).norm_squared();
                if d > far_d {
                    far = Some(i);
                    far_d = d;
                }
            }
            if let Some(i) = far {
                centers[c] = nodes[i].position;
                reseeded.push(i);
            }
        }
    }

    if !converged {
        debug!(k, max_iterations, "k-means reached iteration cap; keeping current partition");
    }

    let mut groups = vec![Vec::new(); k];
    for (i, &c) in assignment.iter().enumerate() {
        groups[c].push(i);
    }
    groups.retain(|g| !g.is_empty());
    (groups, converged)
}

impl SoftBody {
    /// Partition the body into clusters; see the module docs.
    ///
    /// Returns the number of clusters created. For a body inside a
    /// [`SoftWorld`](crate::SoftWorld), use
    /// [`SoftWorld::generate_clusters`](crate::SoftWorld::generate_clusters)
    /// so joints owned by other bodies are dropped as well.
    pub fn generate_clusters(&mut self, k: usize) -> usize {
        self.generate_clusters_with_limit(k, DEFAULT_KMEANS_ITERATIONS)
    }

    /// [`SoftBody::generate_clusters`] with an explicit k-means iteration cap.
    pub fn generate_clusters_with_limit(&mut self, k: usize, max_iterations: usize) -> usize {
        self.release_clusters();

        let groups: Vec<Vec<usize>> = if k == 0 {
            if self.tetras.is_empty() {
                self.faces.iter().map(|f| f.nodes.to_vec()).collect()
            } else {
                self.tetras.iter().map(|t| t.nodes.to_vec()).collect()
            }
        } else {
            let (mut groups, _) = kmeans(&self.nodes, k, max_iterations);
            self.merge_cluster_boundaries(&mut groups);
            groups
        };

        self.clusters = groups.into_iter().map(Cluster::new).collect();
        if !self.clusters.is_empty() {
            self.initialize_clusters();
            self.update_clusters();
            self.build_cluster_connectivity();
        }
        debug!(body = %self.id, k, clusters = self.clusters.len(), "generated clusters");
        self.clusters.len()
    }

    /// Each cluster absorbs the neighbors of its members so clusters overlap.
    fn merge_cluster_boundaries(&self, groups: &mut [Vec<usize>]) {
        let mut owner = vec![usize::MAX; self.nodes.len()];
        for (c, g) in groups.iter().enumerate() {
            for &i in g {
                owner[i] = c;
            }
        }
        let mut add = |a: usize, b: usize| {
            let c = owner[a];
            if c != usize::MAX && owner[b] != c && !groups[c].contains(&b) {
                groups[c].push(b);
            }
        };
        if self.faces.is_empty() {
            for l in &self.links {
                add(l.nodes[0], l.nodes[1]);
                add(l.nodes[1], l.nodes[0]);
            }
        } else {
            for f in &self.faces {
                for j in 0..3 {
                    for q in 1..3 {
                        add(f.nodes[j], f.nodes[(j + q) % 3]);
                    }
                }
            }
        }
    }

    fn build_cluster_connectivity(&mut self) {
        let n = self.clusters.len();
        self.cluster_connectivity = vec![false; n * n];

        let mut membership: Vec<SmallVec<[usize; 4]>> = vec![SmallVec::new(); self.nodes.len()];
        for (c, cluster) in self.clusters.iter().enumerate() {
            for &i in &cluster.nodes {
                membership[i].push(c);
            }
        }
        for list in &membership {
            for &a in list {
                for &b in list {
                    self.cluster_connectivity[a + b * n] = true;
                }
            }
        }
        for link in &self.links {
            for &a in &membership[link.nodes[0]] {
                for &b in &membership[link.nodes[1]] {
                    self.cluster_connectivity[a + b * n] = true;
                    self.cluster_connectivity[b + a * n] = true;
                }
            }
        }
    }

    /// Whether clusters `a` and `b` share a node or a link.
    #[must_use]
    pub fn clusters_adjacent(&self, a: usize, b: usize) -> bool {
        let n = self.clusters.len();
        a < n && b < n && self.cluster_connectivity[a + b * n]
    }

    /// Recompute masses, inertia and reference frames of every cluster.
    pub fn initialize_clusters(&mut self) {
        for cluster in &mut self.clusters {
            cluster.initialize(&self.nodes);
        }
    }

    /// Refresh every cluster's frame and velocity and its tree leaf.
    pub fn update_clusters(&mut self) {
        let velmrg = self.state.velocity_margin;
        let radmrg = self.state.radial_margin;
        for (index, cluster) in self.clusters.iter_mut().enumerate() {
            cluster.update(&mut self.nodes);
            if !cluster.collide {
                continue;
            }
            let Some(bounds) = cluster.bounds(&self.nodes) else {
                continue;
            };
            match cluster.leaf {
                Some(leaf) => {
                    let velocity = cluster.linear_velocity * velmrg;
                    self.cluster_tree
                        .update_with_margin(leaf, bounds, &velocity, radmrg);
                }
                None => cluster.leaf = Some(self.cluster_tree.insert(bounds.expanded(radmrg), index)),
            }
        }
    }

    /// Move nodes by the impulses accumulated in their clusters.
    ///
    /// With `drift`, averaged drift impulses are applied; otherwise velocity
    /// impulses. Nodes in several clusters receive the mass-weighted mean.
    pub fn apply_clusters(&mut self, drift: bool) {
        if self.clusters.is_empty() {
            return;
        }
        let sdt = self.state.sdt;
        let mut deltas = vec![Vector3::zeros(); self.nodes.len()];
        let mut weights = vec![0.0; self.nodes.len()];

        if drift {
            for c in &mut self.clusters {
                if c.num_drift_impulses > 0 {
                    let nd = c.num_drift_impulses as f64;
                    c.drift_impulses[0] /= nd;
                    c.drift_impulses[1] /= nd;
                }
            }
        }

        for c in &self.clusters {
            let count = if drift {
                c.num_drift_impulses
            } else {
                c.num_velocity_impulses
            };
            if count == 0 {
                continue;
            }
            let [lin, ang] = if drift {
                c.drift_impulses
            } else {
                c.velocity_impulses
            };
            let v = lin * sdt;
            let w = ang * sdt;
            for (&i, &q) in c.nodes.iter().zip(&c.masses) {
                let x = self.nodes[i].position;
                deltas[i] += (v + w.cross(&(x - c.com))) * q;
                weights[i] += q;
            }
        }

        for ((node, delta), w) in self.nodes.iter_mut().zip(&deltas).zip(&weights) {
            if *w > 0.0 {
                node.position += delta / *w;
            }
        }
    }

    /// Pull node velocities toward their clusters' rigid motion.
    pub fn damp_clusters(&mut self) {
        for c in &self.clusters {
            if c.node_damping <= 0.0 {
                continue;
            }
            for &i in &c.nodes {
                let node = &mut self.nodes[i];
                if node.is_pinned() {
                    continue;
                }
                let vx = c.velocity_at(&(node.prev_position - c.com));
                if vx.norm_squared() <= node.velocity.norm_squared() {
                    node.velocity += (vx - node.velocity) * c.node_damping;
                }
            }
        }
    }

    /// Discard cluster `index` and every joint of this body attached to it.
    ///
    /// Later clusters shift down by one. Returns `false` for an unknown index.
    pub fn release_cluster(&mut self, index: usize) -> bool {
        if index >= self.clusters.len() {
            return false;
        }
        let id = self.id;
        self.joints.retain(|j| !j.references_cluster(id, index));
        for j in &mut self.joints {
            j.shift_cluster_refs(id, index);
        }

        let removed = self.clusters.remove(index);
        if let Some(leaf) = removed.leaf {
            self.cluster_tree.remove(leaf);
        }
        for (i, c) in self.clusters.iter().enumerate().skip(index) {
            if let Some(leaf) = c.leaf {
                self.cluster_tree.set_data(leaf, i);
            }
        }

        let old = self.clusters.len() + 1;
        let mut connectivity = Vec::with_capacity(self.clusters.len().pow(2));
        for b in (0..old).filter(|&b| b != index) {
            for a in (0..old).filter(|&a| a != index) {
                connectivity.push(self.cluster_connectivity[a + b * old]);
            }
        }
        self.cluster_connectivity = connectivity;
        true
    }

    /// Discard every cluster and every joint of this body attached to one.
    ///
    /// Joints owned by other bodies are only dropped by
    /// [`SoftWorld::release_clusters`](crate::SoftWorld::release_clusters).
    pub fn release_clusters(&mut self) {
        let id = self.id;
        self.joints.retain(|j| !j.references_any_cluster_of(id));
        self.clusters.clear();
        self.cluster_tree.clear();
        self.cluster_connectivity.clear();
    }

    /// Number of clusters.
    #[must_use]
    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// Cluster by index.
    #[must_use]
    pub fn cluster(&self, index: usize) -> Option<&Cluster> {
        self.clusters.get(index)
    }

    /// Mutable cluster by index (damping and matching coefficients).
    pub fn cluster_mut(&mut self, index: usize) -> Option<&mut Cluster> {
        self.clusters.get_mut(index)
    }

    /// All clusters.
    #[must_use]
    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::material::MaterialId;
    use crate::soft_body::SoftBody;
    use approx::assert_relative_eq;

    fn line_nodes(xs: &[f64]) -> Vec<Node> {
        xs.iter()
            .map(|&x| Node::new(Point3::new(x, 0.0, 0.0), 1.0, MaterialId(0)))
            .collect()
    }

    #[test]
    fn test_kmeans_two_groups() {
        let nodes = line_nodes(&[0.0, 0.1, 0.2, 10.0, 10.1, 10.2]);
        let (groups, converged) = kmeans(&nodes, 2, 100);
        assert!(converged);
        assert_eq!(groups, vec![vec![0, 1, 2], vec![3, 4, 5]]);
    }

    #[test]
    fn test_kmeans_tie_goes_to_lower_seed() {
        // Seeds are nodes 0 and 1; node 2 sits halfway between them.
        let nodes = line_nodes(&[0.0, 2.0, 1.0]);
        let (groups, converged) = kmeans(&nodes, 2, 100);
        assert!(converged);
        assert_eq!(groups, vec![vec![0, 2], vec![1]]);
    }

    #[test]
    fn test_kmeans_is_deterministic() {
        let nodes = line_nodes(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        let a = kmeans(&nodes, 3, 100);
        let b = kmeans(&nodes, 3, 100);
        assert_eq!(a, b);
    }

    #[test]
    fn test_kmeans_iteration_cap_keeps_partition() {
        let nodes = line_nodes(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        let (groups, converged) = kmeans(&nodes, 3, 0);
        assert!(!converged);
        let total: usize = groups.iter().map(Vec::len).sum();
        assert_eq!(total, nodes.len());
    }

    #[test]
    fn test_kmeans_reseeds_empty_cluster() {
        // Coincident seeds: cluster 1 starts empty and must be reseeded.
        let mut nodes = line_nodes(&[0.0, 0.0, 0.0, 9.0]);
        nodes[1].position.x = 0.0;
        let (groups, _) = kmeans(&nodes, 2, 100);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1], vec![3]);
    }

    #[test]
    fn test_cluster_mass_and_pinned() {
        let mut nodes = line_nodes(&[0.0, 1.0, 2.0]);
        nodes[1].inv_mass = 0.5;
        let mut c = Cluster::new([0, 1, 2]);
        c.initialize(&nodes);
        assert_relative_eq!(c.mass, 4.0);
        assert_relative_eq!(c.inv_mass, 0.25);
        assert!(!c.contains_anchor);

        for n in &mut nodes {
            n.inv_mass = 0.0;
        }
        let mut pinned = Cluster::new([0, 1, 2]);
        pinned.initialize(&nodes);
        assert_eq!(pinned.mass, 0.0);
        assert_eq!(pinned.inv_mass, 0.0);
        assert!(pinned.contains_anchor);
        assert!(pinned.com.coords.iter().all(|v| v.is_finite()));

        pinned.apply_velocity_impulse(&Vector3::x(), &Vector3::y());
        assert_eq!(pinned.linear_velocity, Vector3::zeros());
        assert_eq!(pinned.angular_velocity, Vector3::zeros());
    }

    #[test]
    fn test_velocity_impulse_moves_com() {
        let nodes = line_nodes(&[-1.0, 1.0]);
        let mut c = Cluster::new([0, 1]);
        c.initialize(&nodes);
        c.apply_velocity_impulse(&Vector3::zeros(), &Vector3::new(0.0, 2.0, 0.0));
        assert_relative_eq!(c.linear_velocity, Vector3::new(0.0, 1.0, 0.0));
        assert_eq!(c.num_velocity_impulses, 1);
    }

    #[test]
    fn test_generate_clusters_per_tetra() {
        let mut body = SoftBody::cube("cube", Point3::origin(), 1.0, 1.0).unwrap();
        let tetras = body.tetras().len();
        assert_eq!(body.generate_clusters(0), tetras);
        for (c, t) in body.clusters().iter().zip(body.tetras()) {
            assert_eq!(c.nodes.as_slice(), &t.nodes);
        }
        assert!(body.clusters_adjacent(0, 1));
    }

    #[test]
    fn test_release_cluster_shifts_indices() {
        let mut body = SoftBody::cube("cube", Point3::origin(), 1.0, 1.0).unwrap();
        let n = body.generate_clusters(0);
        assert!(body.release_cluster(0));
        assert_eq!(body.cluster_count(), n - 1);
        assert!(!body.release_cluster(n));
        body.release_clusters();
        assert_eq!(body.cluster_count(), 0);
    }
}
