//! Mesh primitives of a soft body.
//!
//! - [`Node`] - A particle with position, velocity and inverse mass
//! - [`Link`] - A spring between two nodes
//! - [`Face`] - A surface triangle
//! - [`Tetra`] - A volume tetrahedron
//!
//! Primitives refer to nodes by index into the owning body's node arena.
//! Topology-dependent constants (rest lengths, rest areas, rest volumes and
//! the mass/stiffness products derived from them) are computed when a
//! primitive is appended or the body's constants are refreshed; only the
//! time-step-dependent terms are rebuilt every step.

use nalgebra::{Point3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::dbvt::LeafId;
use crate::material::{Material, MaterialId};
use crate::types::NodeFlags;

/// A particle of a soft body.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Node {
    /// Current position.
    pub position: Point3<f64>,
    /// Position at the start of the step (before prediction).
    pub prev_position: Point3<f64>,
    /// Velocity.
    pub velocity: Vector3<f64>,
    /// Accumulated external force for this step.
    pub force: Vector3<f64>,
    /// Area-weighted surface normal.
    pub normal: Vector3<f64>,
    /// Inverse mass (0 for pinned nodes).
    pub inv_mass: f64,
    /// Share of the surrounding surface area.
    pub area: f64,
    /// State flags.
    pub flags: NodeFlags,
    /// Material.
    pub material: MaterialId,
    /// Leaf in the node tree.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub leaf: Option<LeafId>,
}

impl Node {
    /// Create a node at `position` with mass `mass` (0 pins the node).
    #[must_use]
    pub fn new(position: Point3<f64>, mass: f64, material: MaterialId) -> Self {
        Self {
            position,
            prev_position: position,
            velocity: Vector3::zeros(),
            force: Vector3::zeros(),
            normal: Vector3::zeros(),
            inv_mass: if mass > 0.0 { 1.0 / mass } else { 0.0 },
            area: 0.0,
            flags: NodeFlags::empty(),
            material,
            leaf: None,
        }
    }

    /// Whether the node has infinite mass.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.inv_mass <= 0.0
    }

    /// Mass of the node, `0` for pinned nodes.
    #[must_use]
    pub fn mass(&self) -> f64 {
        if self.inv_mass > 0.0 {
            1.0 / self.inv_mass
        } else {
            0.0
        }
    }
}

/// A spring between two nodes.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Link {
    /// Node indices.
    pub nodes: [usize; 2],
    /// Material.
    pub material: MaterialId,
    /// Rest length.
    pub rest_length: f64,
    /// `(im0 + im1) / kLST`; zero disables the link.
    pub mass_stiffness: f64,
    /// Rest length squared.
    pub rest_length_sq: f64,
    /// Per-step velocity impulse scale, `1 / (|delta|^2 * mass_stiffness)`.
    pub impulse_scale: f64,
    /// Per-step separation `q1 - q0`.
    pub delta: Vector3<f64>,
    /// Created by bending constraint generation.
    pub bending: bool,
}

impl Link {
    /// Create a link with the given rest length; constants are filled by
    /// [`Link::update_constants`].
    #[must_use]
    pub fn new(n0: usize, n1: usize, material: MaterialId, rest_length: f64) -> Self {
        Self {
            nodes: [n0, n1],
            material,
            rest_length,
            mass_stiffness: 0.0,
            rest_length_sq: rest_length * rest_length,
            impulse_scale: 0.0,
            delta: Vector3::zeros(),
            bending: false,
        }
    }

    /// Whether the link joins `a` and `b` in either order.
    #[must_use]
    pub fn connects(&self, a: usize, b: usize) -> bool {
        (self.nodes[0] == a && self.nodes[1] == b) || (self.nodes[0] == b && self.nodes[1] == a)
    }

    /// Recompute the topology-dependent constants.
    pub fn update_constants(&mut self, nodes: &[Node], material: &Material) {
        let im = nodes[self.nodes[0]].inv_mass + nodes[self.nodes[1]].inv_mass;
        self.mass_stiffness = if material.linear_stiffness > 0.0 {
            im / material.linear_stiffness
        } else {
            0.0
        };
        self.rest_length_sq = self.rest_length * self.rest_length;
    }

    /// Recompute the per-step terms from the start-of-step positions.
    pub fn prepare(&mut self, nodes: &[Node]) {
        self.delta = nodes[self.nodes[1]].prev_position - nodes[self.nodes[0]].prev_position;
        let denom = self.delta.norm_squared() * self.mass_stiffness;
        self.impulse_scale = if denom > f64::EPSILON { 1.0 / denom } else { 0.0 };
    }

    /// Current length of the link.
    #[must_use]
    pub fn length(&self, nodes: &[Node]) -> f64 {
        (nodes[self.nodes[1]].position - nodes[self.nodes[0]].position).norm()
    }
}

/// A surface triangle.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Face {
    /// Node indices.
    pub nodes: [usize; 3],
    /// Material.
    pub material: MaterialId,
    /// Unit normal.
    pub normal: Vector3<f64>,
    /// Area of the face at the last constants refresh.
    pub rest_area: f64,
    /// Leaf in the face tree.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub leaf: Option<LeafId>,
}

impl Face {
    /// Create a face; constants are filled by [`Face::update_constants`].
    #[must_use]
    pub fn new(n0: usize, n1: usize, n2: usize, material: MaterialId) -> Self {
        Self {
            nodes: [n0, n1, n2],
            material,
            normal: Vector3::zeros(),
            rest_area: 0.0,
            leaf: None,
        }
    }

    /// Whether the face uses node `n`.
    #[must_use]
    pub fn contains(&self, n: usize) -> bool {
        self.nodes.contains(&n)
    }

    /// Positions of the three corners.
    #[must_use]
    pub fn corners(&self, nodes: &[Node]) -> [Point3<f64>; 3] {
        self.nodes.map(|i| nodes[i].position)
    }

    /// Recompute rest area and normal.
    pub fn update_constants(&mut self, nodes: &[Node]) {
        let [a, b, c] = self.corners(nodes);
        self.rest_area = triangle_area(&a, &b, &c);
        self.update_normal(nodes);
    }

    /// Recompute the unit normal from current positions.
    pub fn update_normal(&mut self, nodes: &[Node]) {
        let [a, b, c] = self.corners(nodes);
        let n = (b - a).cross(&(c - a));
        let len = n.norm();
        self.normal = if len > 1e-12 { n / len } else { Vector3::zeros() };
    }
}

/// A volume tetrahedron.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Tetra {
    /// Node indices.
    pub nodes: [usize; 4],
    /// Material.
    pub material: MaterialId,
    /// Signed rest volume.
    pub rest_volume: f64,
    /// Volume gradient with respect to each corner at rest.
    pub rest_gradients: [Vector3<f64>; 4],
    /// Effective volume stiffness, zero when all corners are pinned.
    pub stiffness: f64,
}

impl Tetra {
    /// Create a tetrahedron; constants are filled by [`Tetra::update_constants`].
    #[must_use]
    pub fn new(nodes: [usize; 4], material: MaterialId) -> Self {
        Self {
            nodes,
            material,
            rest_volume: 0.0,
            rest_gradients: [Vector3::zeros(); 4],
            stiffness: 0.0,
        }
    }

    /// Whether the tetrahedron uses node `n`.
    #[must_use]
    pub fn contains(&self, n: usize) -> bool {
        self.nodes.contains(&n)
    }

    /// Positions of the four corners.
    #[must_use]
    pub fn corners(&self, nodes: &[Node]) -> [Point3<f64>; 4] {
        self.nodes.map(|i| nodes[i].position)
    }

    /// Recompute rest volume, rest gradients and stiffness.
    pub fn update_constants(&mut self, nodes: &[Node], material: &Material) {
        let p = self.corners(nodes);
        self.rest_volume = tetra_signed_volume(&p);
        self.rest_gradients = tetra_volume_gradients(&p);
        let im: f64 = self.nodes.iter().map(|&i| nodes[i].inv_mass).sum();
        self.stiffness = if im > 0.0 {
            material.volume_stiffness
        } else {
            0.0
        };
    }
}

/// Area of a triangle.
#[must_use]
pub fn triangle_area(a: &Point3<f64>, b: &Point3<f64>, c: &Point3<f64>) -> f64 {
    0.5 * (b - a).cross(&(c - a)).norm()
}

/// Signed volume of a tetrahedron (positive for right-handed corners).
#[must_use]
pub fn tetra_signed_volume(p: &[Point3<f64>; 4]) -> f64 {
    (p[1] - p[0]).cross(&(p[2] - p[0])).dot(&(p[3] - p[0])) / 6.0
}

/// Gradient of [`tetra_signed_volume`] with respect to each corner.
#[must_use]
pub fn tetra_volume_gradients(p: &[Point3<f64>; 4]) -> [Vector3<f64>; 4] {
    let e1 = p[1] - p[0];
    let e2 = p[2] - p[0];
    let e3 = p[3] - p[0];
    let g1 = e2.cross(&e3) / 6.0;
    let g2 = e3.cross(&e1) / 6.0;
    let g3 = e1.cross(&e2) / 6.0;
    [-(g1 + g2 + g3), g1, g2, g3]
}

/// Barycentric coordinates of `p` relative to triangle `(a, b, c)`.
///
/// Degenerate triangles yield weights for the first corner.
#[must_use]
pub fn barycentric(
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
    p: &Point3<f64>,
) -> Vector3<f64> {
    let v0 = b - a;
    let v1 = c - a;
    let v2 = p - a;
    let d00 = v0.dot(&v0);
    let d01 = v0.dot(&v1);
    let d11 = v1.dot(&v1);
    let d20 = v2.dot(&v0);
    let d21 = v2.dot(&v1);
    let denom = d00 * d11 - d01 * d01;
    if denom.abs() < 1e-18 {
        return Vector3::new(1.0, 0.0, 0.0);
    }
    let v = (d11 * d20 - d01 * d21) / denom;
    let w = (d00 * d21 - d01 * d20) / denom;
    Vector3::new(1.0 - v - w, v, w)
}

/// Closest point on triangle `(a, b, c)` to `p`.
#[must_use]
pub fn closest_point_on_triangle(
    p: &Point3<f64>,
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
) -> Point3<f64> {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;
    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return *a;
    }

    let bp = p - b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return *b;
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return a + ab * v;
    }

    let cp = p - c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return *c;
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return a + ac * w;
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return b + (c - b) * w;
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    a + ab * v + ac * w
}

/// Intersection of segment `from + t * (to - from)` with triangle `(a, b, c)`.
///
/// Returns `t` in `[0, max_fraction)` if the segment crosses the triangle.
#[must_use]
pub fn ray_triangle(
    from: &Point3<f64>,
    to: &Point3<f64>,
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
    max_fraction: f64,
) -> Option<f64> {
    const EPS: f64 = 1e-12;
    let dir = to - from;
    let e1 = b - a;
    let e2 = c - a;
    let h = dir.cross(&e2);
    let det = e1.dot(&h);
    if det.abs() < EPS {
        return None;
    }
    let inv = 1.0 / det;
    let s = from - a;
    let u = s.dot(&h) * inv;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(&e1);
    let v = dir.dot(&q) * inv;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(&q) * inv;
    (t >= 0.0 && t < max_fraction).then_some(t)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_tetra() -> [Point3<f64>; 4] {
        [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
        ]
    }

    #[test]
    fn test_tetra_volume_and_gradients() {
        let p = unit_tetra();
        assert_relative_eq!(tetra_signed_volume(&p), 1.0 / 6.0, epsilon = 1e-12);

        // Gradients sum to zero and match a finite difference.
        let g = tetra_volume_gradients(&p);
        let sum = g.iter().fold(Vector3::zeros(), |acc, v| acc + v);
        assert_relative_eq!(sum, Vector3::zeros(), epsilon = 1e-12);

        let h = 1e-6;
        let mut q = p;
        q[3].z += h;
        let fd = (tetra_signed_volume(&q) - tetra_signed_volume(&p)) / h;
        assert_relative_eq!(fd, g[3].z, epsilon = 1e-6);
    }

    #[test]
    fn test_node_mass() {
        let n = Node::new(Point3::origin(), 2.0, MaterialId(0));
        assert_relative_eq!(n.inv_mass, 0.5);
        assert_relative_eq!(n.mass(), 2.0);
        assert!(!n.is_pinned());

        let pinned = Node::new(Point3::origin(), 0.0, MaterialId(0));
        assert!(pinned.is_pinned());
        assert_eq!(pinned.mass(), 0.0);
    }

    #[test]
    fn test_link_constants() {
        let nodes = [
            Node::new(Point3::origin(), 1.0, MaterialId(0)),
            Node::new(Point3::new(2.0, 0.0, 0.0), 1.0, MaterialId(0)),
        ];
        let mut link = Link::new(0, 1, MaterialId(0), 2.0);
        link.update_constants(&nodes, &Material::default().with_linear_stiffness(0.5));
        assert_relative_eq!(link.mass_stiffness, 4.0);
        assert_relative_eq!(link.rest_length_sq, 4.0);

        link.prepare(&nodes);
        assert_relative_eq!(link.impulse_scale, 1.0 / 16.0);
        assert!(link.connects(1, 0));
    }

    #[test]
    fn test_face_area_and_normal() {
        let nodes = [
            Node::new(Point3::origin(), 1.0, MaterialId(0)),
            Node::new(Point3::new(1.0, 0.0, 0.0), 1.0, MaterialId(0)),
            Node::new(Point3::new(0.0, 1.0, 0.0), 1.0, MaterialId(0)),
        ];
        let mut face = Face::new(0, 1, 2, MaterialId(0));
        face.update_constants(&nodes);
        assert_relative_eq!(face.rest_area, 0.5);
        assert_relative_eq!(face.normal, Vector3::z());
    }

    #[test]
    fn test_barycentric_and_closest_point() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(1.0, 0.0, 0.0);
        let c = Point3::new(0.0, 1.0, 0.0);

        let w = barycentric(&a, &b, &c, &Point3::new(0.25, 0.25, 0.0));
        assert_relative_eq!(w, Vector3::new(0.5, 0.25, 0.25), epsilon = 1e-12);

        let p = closest_point_on_triangle(&Point3::new(0.2, 0.2, 3.0), &a, &b, &c);
        assert_relative_eq!(p, Point3::new(0.2, 0.2, 0.0), epsilon = 1e-12);

        let p = closest_point_on_triangle(&Point3::new(-1.0, -1.0, 0.0), &a, &b, &c);
        assert_relative_eq!(p, a, epsilon = 1e-12);
    }

    #[test]
    fn test_ray_triangle() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(1.0, 0.0, 0.0);
        let c = Point3::new(0.0, 1.0, 0.0);
        let from = Point3::new(0.2, 0.2, 1.0);
        let to = Point3::new(0.2, 0.2, -1.0);

        let t = ray_triangle(&from, &to, &a, &b, &c, 1.0).unwrap();
        assert_relative_eq!(t, 0.5, epsilon = 1e-12);

        assert!(ray_triangle(&from, &to, &a, &b, &c, 0.4).is_none());
        let miss = Point3::new(2.0, 2.0, -1.0);
        assert!(ray_triangle(&Point3::new(2.0, 2.0, 1.0), &miss, &a, &b, &c, 1.0).is_none());
    }
}
