//! Rest pose and shape matching.
//!
//! A [`Pose`] records node positions relative to a weighted center of mass at
//! the moment it is captured. Every step the body recomputes the weighted
//! covariance between the reference shape and the current shape,
//!
//! ```text
//! Apq = Σ w_i (x_i - com) q_iᵀ
//! ```
//!
//! and splits it into a rotation `R` and a stretch via polar decomposition.
//! The rotation drives the shape-matching goal `R q_i + com`; the best-fit
//! linear map `Apq Aqq⁻¹` gives the scale matrix whose inverse determinant,
//! clamped to the configured maximum volume ratio, bounds volume growth.
//!
//! Pinned nodes get a weight large enough to dominate the center of mass, so
//! a pinned body keeps its reference anchored in place.

use nalgebra::{Matrix3, Point3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::mesh::Node;

/// Weight multiplier applied to pinned nodes, per node and unit of mass.
const PINNED_WEIGHT_FACTOR: f64 = 1000.0;

/// Split `m` into a rotation `R` and a symmetric stretch `S` with `m = R S`.
///
/// Reflections are removed by flipping the axis of the smallest singular
/// value, so `R` always has a positive determinant. Falls back to the
/// identity if the SVD does not produce both factors.
#[must_use]
pub fn polar_decompose(m: &Matrix3<f64>) -> (Matrix3<f64>, Matrix3<f64>) {
    let svd = m.svd(true, true);
    let (Some(mut u), Some(v_t)) = (svd.u, svd.v_t) else {
        return (Matrix3::identity(), *m);
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        // nalgebra sorts singular values in descending order.
        let mut col = u.column_mut(2);
        col *= -1.0;
        r = u * v_t;
    }
    let s = r.transpose() * m;
    (r, s)
}

/// Reference configuration used for shape matching and volume forces.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Pose {
    /// Volume forces are enabled.
    pub has_volume: bool,
    /// Shape matching is enabled.
    pub has_frame: bool,
    /// Rest volume.
    pub volume: f64,
    /// Reference positions relative to the reference center of mass.
    pub positions: Vec<Vector3<f64>>,
    /// Normalized per-node weights.
    pub weights: Vec<f64>,
    /// Current weighted center of mass.
    pub com: Point3<f64>,
    /// Current best-fit rotation.
    pub rotation: Matrix3<f64>,
    /// Current best-fit scale, volume-clamped.
    pub scale: Matrix3<f64>,
    /// Inverse of the reference second moment `Σ w q qᵀ`.
    pub aqq: Matrix3<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            has_volume: false,
            has_frame: false,
            volume: 0.0,
            positions: Vec::new(),
            weights: Vec::new(),
            com: Point3::origin(),
            rotation: Matrix3::identity(),
            scale: Matrix3::identity(),
            aqq: Matrix3::zeros(),
        }
    }
}

impl Pose {
    /// Capture the current node configuration as the reference pose.
    ///
    /// `volume` is the rest volume recorded for volume forces.
    #[must_use]
    pub fn capture(nodes: &[Node], volume: f64, has_volume: bool, has_frame: bool) -> Self {
        let weights = pose_weights(nodes);
        let com = weighted_com(nodes, &weights);
        let positions: Vec<Vector3<f64>> = nodes.iter().map(|n| n.position - com).collect();

        let aqq = inverse_moment(&positions, &weights);

        Self {
            has_volume,
            has_frame,
            volume: if has_volume { volume } else { 0.0 },
            positions,
            weights,
            com,
            rotation: Matrix3::identity(),
            scale: Matrix3::identity(),
            aqq,
        }
    }

    /// Weighted center of mass of the current node positions.
    #[must_use]
    pub fn current_com(&self, nodes: &[Node]) -> Point3<f64> {
        weighted_com(nodes, &self.weights)
    }

    /// Refresh center of mass, rotation and scale from the current nodes.
    ///
    /// Does nothing without a frame or when the reference does not cover
    /// every node.
    pub fn update(&mut self, nodes: &[Node], max_volume: f64) {
        if !self.has_frame || !self.tracks(nodes.len()) {
            return;
        }
        let com = self.current_com(nodes);
        self.com = com;

        let eps = f64::EPSILON;
        let mut apq = Matrix3::from_diagonal(&Vector3::new(eps, eps * 2.0, eps * 3.0));
        for ((node, q), w) in nodes.iter().zip(&self.positions).zip(&self.weights) {
            apq += (node.position - com) * (q * *w).transpose();
        }

        let (r, _) = polar_decompose(&apq);
        self.rotation = r;
        self.scale = r.transpose() * apq * self.aqq;
        if max_volume > 1.0 {
            let det = self.scale.determinant();
            if det.abs() > f64::EPSILON {
                let idet = (1.0 / det).clamp(1.0, max_volume);
                self.scale *= idet;
            }
        }
    }

    /// Whether the reference covers exactly `count` nodes.
    #[must_use]
    pub fn tracks(&self, count: usize) -> bool {
        self.positions.len() == count
    }

    /// Extend a captured reference to nodes appended after capture.
    ///
    /// New nodes are mapped back through the current best-fit frame, then the
    /// reference is re-centered on the new weights.
    pub fn extend(&mut self, nodes: &[Node]) {
        let known = self.positions.len();
        if known == 0 || known >= nodes.len() {
            return;
        }
        let inv = self.rotation.transpose();
        for node in &nodes[known..] {
            self.positions.push(inv * (node.position - self.com));
        }
        self.weights = pose_weights(nodes);
        let center: Vector3<f64> = self
            .positions
            .iter()
            .zip(&self.weights)
            .map(|(q, w)| q * *w)
            .sum();
        for q in &mut self.positions {
            *q -= center;
        }
        self.aqq = inverse_moment(&self.positions, &self.weights);
    }

    /// Shape-matching goal for node `i`, if the reference covers it.
    #[must_use]
    pub fn goal(&self, i: usize) -> Option<Point3<f64>> {
        self.positions.get(i).map(|q| self.com + self.rotation * q)
    }
}

fn inverse_moment(positions: &[Vector3<f64>], weights: &[f64]) -> Matrix3<f64> {
    let mut aqq = Matrix3::zeros();
    for (q, w) in positions.iter().zip(weights) {
        aqq += q * q.transpose() * *w;
    }
    aqq.pseudo_inverse(1e-12).unwrap_or_else(|_| Matrix3::zeros())
}

fn pose_weights(nodes: &[Node]) -> Vec<f64> {
    if nodes.is_empty() {
        return Vec::new();
    }
    let omass: f64 = nodes.iter().map(Node::mass).sum();
    let kmass = omass * nodes.len() as f64 * PINNED_WEIGHT_FACTOR;
    let pinned = nodes.iter().filter(|n| n.is_pinned()).count() as f64;
    let tmass = omass + pinned * kmass;
    if tmass <= 0.0 {
        return vec![1.0 / nodes.len() as f64; nodes.len()];
    }
    nodes
        .iter()
        .map(|n| {
            if n.is_pinned() {
                kmass / tmass
            } else {
                1.0 / (n.inv_mass * tmass)
            }
        })
        .collect()
}

fn weighted_com(nodes: &[Node], weights: &[f64]) -> Point3<f64> {
    let sum = nodes
        .iter()
        .zip(weights)
        .fold(Vector3::zeros(), |acc, (n, w)| acc + n.position.coords * *w);
    Point3::from(sum)
}
