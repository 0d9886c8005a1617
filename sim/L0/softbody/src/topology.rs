//! Topology edits: cutting, refinement, bending links and constraint order.
//!
//! Edits only append nodes and rewrite indices in place, so every index held
//! by links, faces, tetrahedra, anchors and clusters stays valid.

use std::collections::VecDeque;

use nalgebra::{Point3, Vector3};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::error::{Result, SoftBodyError};
use crate::material::MaterialId;
use crate::mesh::Face;
use crate::soft_body::SoftBody;

/// Iteration cap for locating a surface crossing.
const MAX_BISECTIONS: usize = 256;

/// Scalar field whose zero level set is a surface; negative inside.
pub trait ImplicitFn {
    /// Field value at `p`.
    fn eval(&self, p: &Point3<f64>) -> f64;
}

impl<F: Fn(&Point3<f64>) -> f64> ImplicitFn for F {
    fn eval(&self, p: &Point3<f64>) -> f64 {
        self(p)
    }
}

/// Sphere surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImplicitSphere {
    /// Center.
    pub center: Point3<f64>,
    /// Radius.
    pub radius: f64,
}

impl ImplicitFn for ImplicitSphere {
    fn eval(&self, p: &Point3<f64>) -> f64 {
        (p - self.center).norm() - self.radius
    }
}

/// Plane `normal · p + offset = 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImplicitPlane {
    /// Unit normal.
    pub normal: Vector3<f64>,
    /// Offset.
    pub offset: f64,
}

impl ImplicitFn for ImplicitPlane {
    fn eval(&self, p: &Point3<f64>) -> f64 {
        self.normal.dot(&p.coords) + self.offset
    }
}

/// Fraction along `a -> b` where `f` crosses zero, or `None` if both ends are
/// on the same side (within `accuracy`).
fn locate_crossing(f: &dyn ImplicitFn, a: &Point3<f64>, b: &Point3<f64>, accuracy: f64) -> Option<f64> {
    let (mut lo, mut hi) = (0.0, 1.0);
    let fa = f.eval(a);
    let fb = f.eval(b);
    if fa.abs() < accuracy || fb.abs() < accuracy || fa.signum() == fb.signum() {
        return None;
    }
    let lo_negative = fa < 0.0;
    let mut t = 0.5;
    for _ in 0..MAX_BISECTIONS {
        t = 0.5 * (lo + hi);
        let v = f.eval(&(a + (b - a) * t));
        if v.abs() < accuracy || hi - lo < accuracy {
            break;
        }
        if (v < 0.0) == lo_negative {
            lo = t;
        } else {
            hi = t;
        }
    }
    Some(t)
}

/// Position of edge `a -> b` within a face: `Some((k, forward))` when the
/// face has the edge at corners `k, k + 1`.
fn face_edge(face: &Face, a: usize, b: usize) -> Option<(usize, bool)> {
    (0..3).find_map(|k| {
        let (p, q) = (face.nodes[k], face.nodes[(k + 1) % 3]);
        if p == a && q == b {
            Some((k, true))
        } else if p == b && q == a {
            Some((k, false))
        } else {
            None
        }
    })
}

impl SoftBody {
    /// Split the edge `node0 -> node1` at fraction `position`.
    ///
    /// Two coincident nodes are inserted; links and faces sharing the edge
    /// are separated so one side keeps `node0`, the other `node1`. Returns
    /// `false` without changes if no link or face uses the edge.
    pub fn cut_link(&mut self, node0: usize, node1: usize, position: f64) -> bool {
        if node0 >= self.nodes.len() || node1 >= self.nodes.len() || node0 == node1 {
            return false;
        }
        let uses_edge = self.links.iter().any(|l| l.connects(node0, node1))
            || self.faces.iter().any(|f| face_edge(f, node0, node1).is_some());
        if !uses_edge {
            return false;
        }

        let t = position.clamp(0.0, 1.0);
        let (a, b) = (self.nodes[node0], self.nodes[node1]);
        let x = a.position + (b.position - a.position) * t;
        let v = a.velocity + (b.velocity - a.velocity) * t;
        let mass = match (a.is_pinned(), b.is_pinned()) {
            (true, true) => 0.0,
            (true, false) => b.mass(),
            (false, true) => a.mass(),
            (false, false) => a.mass() + (b.mass() - a.mass()) * t,
        };
        let new = [self.append_node(x, mass / 2.0), self.append_node(x, mass / 2.0)];
        for &n in &new {
            self.nodes[n].velocity = v;
        }

        // Links: node0 keeps one half, node1 the other
        let count = self.links.len();
        for i in 0..count {
            let link = self.links[i];
            let matched = if link.nodes == [node0, node1] {
                0
            } else if link.nodes == [node1, node0] {
                1
            } else {
                continue;
            };
            let mut other = link;
            let rest = link.rest_length;
            let (near, far) = if matched == 0 { (t, 1.0 - t) } else { (1.0 - t, t) };
            self.links[i].nodes[1] = new[matched];
            self.links[i].rest_length = rest * near;
            other.nodes[0] = new[1 - matched];
            other.rest_length = rest * far;
            self.links.push(other);
        }

        // Faces
        let mut extra_links = Vec::new();
        let count = self.faces.len();
        for i in 0..count {
            let Some((k, forward)) = face_edge(&self.faces[i], node0, node1) else {
                continue;
            };
            let matched = usize::from(!forward);
            let mut other = self.faces[i];
            self.faces[i].nodes[(k + 1) % 3] = new[matched];
            other.nodes[k] = new[1 - matched];
            other.leaf = None;
            let opposite = self.faces[i].nodes[(k + 2) % 3];
            extra_links.push((new[0], opposite, self.faces[i].material));
            extra_links.push((new[1], opposite, self.faces[i].material));
            self.faces.push(other);
        }
        for (n, opposite, material) in extra_links {
            self.append_edit_link(n, opposite, material);
        }

        for link in &mut self.links {
            link.rest_length_sq = link.rest_length * link.rest_length;
        }
        self.rebuild_trees();
        self.update_constants();
        self.update_normals();
        self.update_bounds();
        self.log_topology("cut link");
        true
    }

    /// Refine links crossed by the zero level set of `f`.
    ///
    /// For every link whose ends lie on opposite sides, the crossing is found
    /// by bisection to `accuracy`. With `cut` the body is cut there; otherwise
    /// a node is inserted and the link and its faces are subdivided. Mass is
    /// conserved. Returns the number of links refined.
    pub fn refine(&mut self, f: &dyn ImplicitFn, accuracy: f64, cut: bool) -> usize {
        let accuracy = accuracy.max(f64::EPSILON);
        let crossings: Vec<(usize, usize, f64)> = self
            .links
            .iter()
            .filter_map(|l| {
                let [a, b] = l.nodes;
                locate_crossing(f, &self.nodes[a].position, &self.nodes[b].position, accuracy)
                    .map(|t| (a, b, t))
            })
            .collect();

        let mut refined = 0;
        for (a, b, t) in crossings {
            let done = if cut {
                self.cut_link(a, b, t)
            } else {
                self.subdivide_link(a, b, t)
            };
            if done {
                refined += 1;
            }
        }
        if !cut && refined > 0 {
            self.rebuild_trees();
            self.update_constants();
            self.update_normals();
            self.update_bounds();
            self.log_topology("refine");
        }
        refined
    }

    /// Insert a node on edge `a -> b` at fraction `t`, splitting the link and
    /// faces sharing it.
    fn subdivide_link(&mut self, a: usize, b: usize, t: f64) -> bool {
        let Some(li) = self.links.iter().position(|l| l.connects(a, b)) else {
            return false;
        };
        let (na, nb) = (self.nodes[a], self.nodes[b]);
        let x = na.position + (nb.position - na.position) * t;
        let v = na.velocity + (nb.velocity - na.velocity) * t;

        // Redistribute so the three masses sum to the original two.
        let mass = match (na.is_pinned(), nb.is_pinned()) {
            (false, false) => {
                let (ma, mb) = (na.mass(), nb.mass());
                let mc = ma + (mb - ma) * t;
                let k = (ma + mb) / (ma + mb + mc);
                self.nodes[a].inv_mass = 1.0 / (ma * k);
                self.nodes[b].inv_mass = 1.0 / (mb * k);
                mc * k
            }
            (false, true) => {
                self.nodes[a].inv_mass *= 2.0;
                na.mass() / 2.0
            }
            (true, false) => {
                self.nodes[b].inv_mass *= 2.0;
                nb.mass() / 2.0
            }
            (true, true) => 0.0,
        };
        let n = self.append_node(x, mass);
        self.nodes[n].velocity = v;

        let link = self.links[li];
        let rest = link.rest_length;
        let mut second = link;
        let far_end = link.nodes[1];
        let t_first = if link.nodes[0] == a { t } else { 1.0 - t };
        self.links[li].nodes[1] = n;
        self.links[li].rest_length = rest * t_first;
        self.links[li].rest_length_sq = self.links[li].rest_length.powi(2);
        second.nodes = [n, far_end];
        second.rest_length = rest * (1.0 - t_first);
        second.rest_length_sq = second.rest_length.powi(2);
        self.links.push(second);

        let count = self.faces.len();
        for i in 0..count {
            let Some((k, _)) = face_edge(&self.faces[i], a, b) else {
                continue;
            };
            let mut other = self.faces[i];
            // [p, n, c] and [n, q, c]
            self.faces[i].nodes[(k + 1) % 3] = n;
            other.nodes[k] = n;
            other.leaf = None;
            let opposite = self.faces[i].nodes[(k + 2) % 3];
            self.faces.push(other);
            self.append_edit_link(n, opposite, link.material);
        }
        true
    }

    /// Link a split node to the far corner of its face, reusing an existing
    /// link. Degenerate links are skipped and logged.
    fn append_edit_link(&mut self, node: usize, opposite: usize, material: MaterialId) -> bool {
        match self.append_link(node, opposite, material, true) {
            Ok(_) => true,
            Err(err) => {
                debug!(body = %self.id, node, opposite, %err, "skipped link in topology edit");
                false
            }
        }
    }

    /// Add links between nodes exactly `distance` hops apart in the link
    /// graph, flagged as bending links. Returns the number added.
    ///
    /// # Errors
    ///
    /// Returns an error if `material` does not exist.
    pub fn generate_bending_constraints(&mut self, distance: usize, material: MaterialId) -> Result<usize> {
        if self.material(material).is_none() {
            return Err(SoftBodyError::index_out_of_bounds(format!("material {}", material.0)));
        }
        if distance < 2 {
            return Ok(0);
        }
        let n = self.nodes.len();
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
        for l in &self.links {
            let [a, b] = l.nodes;
            adjacency[a].push(b);
            adjacency[b].push(a);
        }

        let mut pairs = Vec::new();
        let mut hops = vec![usize::MAX; n];
        let mut queue = VecDeque::new();
        for start in 0..n {
            hops.fill(usize::MAX);
            hops[start] = 0;
            queue.clear();
            queue.push_back(start);
            while let Some(i) = queue.pop_front() {
                if hops[i] == distance {
                    if i > start {
                        pairs.push((start, i));
                    }
                    continue;
                }
                for &j in &adjacency[i] {
                    if hops[j] == usize::MAX {
                        hops[j] = hops[i] + 1;
                        queue.push_back(j);
                    }
                }
            }
        }

        let mut added = 0;
        for (a, b) in pairs {
            if self.check_link(a, b) {
                continue;
            }
            if let Ok(index) = self.append_link(a, b, material, false) {
                self.links[index].bending = true;
                added += 1;
            }
        }
        debug!(body = %self.id, distance, added, "generated bending constraints");
        Ok(added)
    }

    /// Shuffle link and face order with a seeded generator.
    pub fn randomize_constraints(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        self.links.shuffle(&mut rng);
        self.faces.shuffle(&mut rng);
        for (i, face) in self.faces.iter().enumerate() {
            if let Some(leaf) = face.leaf {
                self.face_tree.set_data(leaf, i);
            }
        }
    }
}
