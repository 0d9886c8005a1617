//! Core types shared across the soft body modules.
//!
//! - [`SoftBodyId`] - Unique identifier for soft bodies
//! - [`NodeFlags`] - Per-node state bits (attached, colliding)
//! - [`Feature`] / [`RayHit`] - Result of a ray cast against a body
//! - [`Frame`] - Rigid frame (basis + origin) used by clusters and joints

use nalgebra::{Isometry3, Matrix3, Point3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Unique identifier for a soft body in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SoftBodyId(pub u64);

impl SoftBodyId {
    /// Create a new soft body ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for SoftBodyId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SoftBodyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SoftBody({})", self.0)
    }
}

/// ID generator for soft bodies.
///
/// Thread-safe counter for generating unique IDs.
pub struct SoftBodyIdGenerator {
    next_id: std::sync::atomic::AtomicU64,
}

impl Default for SoftBodyIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftBodyIdGenerator {
    /// Create a new ID generator starting at 0.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_id: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Generate the next unique ID.
    pub fn next(&self) -> SoftBodyId {
        SoftBodyId(
            self.next_id
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        )
    }
}

static ID_GENERATOR: SoftBodyIdGenerator = SoftBodyIdGenerator::new();

/// Generate a new unique soft body ID.
pub fn next_soft_body_id() -> SoftBodyId {
    ID_GENERATOR.next()
}

bitflags::bitflags! {
    /// Flags for node state.
    ///
    /// Pinning is expressed through a zero inverse mass, not a flag.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct NodeFlags: u32 {
        /// Node is bound to a rigid body by an anchor.
        const ATTACHED = 0b0000_0001;
        /// Node took part in a rigid or soft contact during the last step.
        const COLLIDING = 0b0000_0010;
    }
}

/// Kind of mesh feature a query result refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Feature {
    /// No feature.
    #[default]
    None,
    /// A node (particle).
    Node,
    /// A link (spring).
    Link,
    /// A surface face.
    Face,
    /// A volume tetrahedron.
    Tetra,
    /// A cluster.
    Cluster,
}

/// Nearest hit reported by a ray cast.
///
/// The hit point is `from + (to - from) * fraction`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RayHit {
    /// Kind of feature that was hit.
    pub feature: Feature,
    /// Index of the feature in its arena.
    pub index: usize,
    /// Fraction along the ray segment, in `[0, 1]`.
    pub fraction: f64,
}

/// A rigid frame: orthonormal basis plus origin.
///
/// Clusters carry their best-fit rotation as a plain matrix, so joints work
/// with this type rather than an [`Isometry3`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Frame {
    /// Rotation part.
    pub basis: Matrix3<f64>,
    /// Translation part.
    pub origin: Point3<f64>,
}

impl Default for Frame {
    fn default() -> Self {
        Self::identity()
    }
}

impl Frame {
    /// Identity frame at the world origin.
    #[must_use]
    pub fn identity() -> Self {
        Self {
            basis: Matrix3::identity(),
            origin: Point3::origin(),
        }
    }

    /// Create a frame from a basis and origin.
    #[must_use]
    pub const fn new(basis: Matrix3<f64>, origin: Point3<f64>) -> Self {
        Self { basis, origin }
    }

    /// Map a local point into world space.
    #[must_use]
    pub fn transform_point(&self, local: &Vector3<f64>) -> Point3<f64> {
        self.origin + self.basis * local
    }

    /// Map a world point into local space.
    #[must_use]
    pub fn inverse_transform_point(&self, world: &Point3<f64>) -> Vector3<f64> {
        self.basis.transpose() * (world - self.origin)
    }
}

impl From<&Isometry3<f64>> for Frame {
    fn from(iso: &Isometry3<f64>) -> Self {
        Self {
            basis: iso.rotation.to_rotation_matrix().into_inner(),
            origin: Point3::from(iso.translation.vector),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    #[test]
    fn test_soft_body_id() {
        let id = SoftBodyId::new(42);
        assert_eq!(id.raw(), 42);
        assert_eq!(id.to_string(), "SoftBody(42)");

        let id2: SoftBodyId = 42.into();
        assert_eq!(id, id2);
    }

    #[test]
    fn test_id_generator() {
        let generator = SoftBodyIdGenerator::new();
        let id1 = generator.next();
        let id2 = generator.next();

        assert_eq!(id1.raw(), 0);
        assert_eq!(id2.raw(), 1);
    }

    #[test]
    fn test_frame_round_trip() {
        let iso = Isometry3::from_parts(
            Vector3::new(1.0, 2.0, 3.0).into(),
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.7),
        );
        let frame = Frame::from(&iso);
        let local = Vector3::new(0.5, -0.25, 2.0);
        let world = frame.transform_point(&local);

        assert_relative_eq!(world, iso * Point3::from(local), epsilon = 1e-12);
        assert_relative_eq!(frame.inverse_transform_point(&world), local, epsilon = 1e-12);
    }
}
