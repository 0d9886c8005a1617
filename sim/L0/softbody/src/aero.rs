//! Aerodynamic forces from relative wind.
//!
//! The wind-relative velocity of a node (or of a face, from the mean of its
//! corners) is projected on the surface normal. Point and one/two-sided models
//! push along the normal with the lift coefficient and against the relative
//! velocity with the drag coefficient:
//!
//! ```text
//! c = ρ · area · (v_rel · n) · |v_rel|² / 2
//! f = -c · lift · n  -  c · drag · v̂_rel        (only when v_rel · n > 0)
//! ```
//!
//! Lift/drag models split the force into a drag term along `-v̂_rel` and a
//! lift term perpendicular to it. Lift is only generated for angles of attack
//! above ten degrees. Forces never reverse a node's velocity within a step:
//! a force whose velocity change would exceed the current speed is clamped.

use nalgebra::Vector3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::mesh::Node;
use crate::soft_body::SoftBody;

/// `cos(10°)`: lift vanishes for shallower angles of attack.
const LIFT_COS_LIMIT: f64 = 0.984_80;

/// Fraction of the node speed a clamped drag force may remove.
const DRAG_CLAMP: f64 = 0.8;

/// Aerodynamic model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AeroModel {
    /// Per node, normal along the relative wind.
    #[default]
    VertexPoint,
    /// Per node, double sided.
    VertexTwoSided,
    /// Per node, double sided, lift/drag split.
    VertexTwoSidedLiftDrag,
    /// Per node, single sided.
    VertexOneSided,
    /// Per face, double sided.
    FaceTwoSided,
    /// Per face, double sided, lift/drag split.
    FaceTwoSidedLiftDrag,
    /// Per face, single sided.
    FaceOneSided,
}

impl AeroModel {
    /// Whether forces are evaluated per node.
    #[must_use]
    pub const fn is_vertex(self) -> bool {
        matches!(
            self,
            Self::VertexPoint
                | Self::VertexTwoSided
                | Self::VertexTwoSidedLiftDrag
                | Self::VertexOneSided
        )
    }

    const fn two_sided(self) -> bool {
        matches!(
            self,
            Self::VertexTwoSided
                | Self::VertexTwoSidedLiftDrag
                | Self::FaceTwoSided
                | Self::FaceTwoSidedLiftDrag
        )
    }

    const fn lift_drag(self) -> bool {
        matches!(self, Self::VertexTwoSidedLiftDrag | Self::FaceTwoSidedLiftDrag)
    }
}

/// Coefficients shared by every aero evaluation of one step.
#[derive(Debug, Clone, Copy)]
pub struct AeroParams {
    /// Model.
    pub model: AeroModel,
    /// Lift coefficient.
    pub lift: f64,
    /// Drag coefficient.
    pub drag: f64,
    /// Medium density.
    pub density: f64,
}

/// Aerodynamic force on a surface patch.
///
/// `rel_v` is the patch velocity minus the wind, `normal` the unit surface
/// normal (ignored by [`AeroModel::VertexPoint`]).
#[must_use]
pub fn aero_force(params: &AeroParams, rel_v: &Vector3<f64>, normal: &Vector3<f64>, area: f64) -> Vector3<f64> {
    let rel_v2 = rel_v.norm_squared();
    if rel_v2 <= f64::EPSILON {
        return Vector3::zeros();
    }
    let rel_v_len = rel_v2.sqrt();
    let dir = rel_v / rel_v_len;

    let mut nrm = if params.model == AeroModel::VertexPoint {
        dir
    } else {
        *normal
    };
    if params.model.two_sided() && nrm.dot(rel_v) < 0.0 {
        nrm = -nrm;
    }

    if params.model.lift_drag() {
        let n_dot_v = nrm.dot(&dir);
        let half_area = 0.5 * area;
        let drag = -dir * (0.5 * params.drag * params.density * rel_v2 * half_area * n_dot_v);
        let lift = if n_dot_v > 0.0 && n_dot_v < LIFT_COS_LIMIT {
            nrm.cross(&dir).cross(&dir)
                * (0.5
                    * params.lift
                    * params.density
                    * rel_v_len
                    * half_area
                    * (1.0 - n_dot_v * n_dot_v).sqrt())
        } else {
            Vector3::zeros()
        };
        return drag + lift;
    }

    let dvn = rel_v.dot(&nrm);
    if dvn <= 0.0 {
        return Vector3::zeros();
    }
    let c = area * dvn * rel_v2 * 0.5 * params.density;
    -nrm * (c * params.lift) - dir * (c * params.drag)
}

/// Add `force` to `node` unless it would reverse the node's velocity within
/// `dt`, in which case only the velocity component along the force is removed.
pub fn apply_clamped_force(node: &mut Node, force: &Vector3<f64>, dt: f64) {
    let dtim = dt * node.inv_mass;
    if dtim <= 0.0 {
        return;
    }
    if (force * dtim).norm_squared() > node.velocity.norm_squared() {
        let Some(axis) = force.try_normalize(f64::EPSILON) else {
            return;
        };
        node.force -= axis * node.velocity.dot(&axis) / dtim;
    } else {
        node.force += force;
    }
}

impl SoftBody {
    /// Accumulate aerodynamic forces on nodes for this step.
    pub(crate) fn apply_aero_forces(&mut self, density: f64) {
        let params = AeroParams {
            model: self.config.aero_model,
            lift: self.config.lift,
            drag: self.config.drag,
            density,
        };
        if params.lift <= 0.0 && params.drag <= 0.0 {
            return;
        }
        let wind = self.wind_velocity;
        let dt = self.state.sdt;

        if params.model.is_vertex() {
            for node in &mut self.nodes {
                if node.is_pinned() {
                    continue;
                }
                let rel_v = node.velocity - wind;
                let force = aero_force(&params, &rel_v, &node.normal, node.area);
                if params.model.lift_drag() {
                    add_drag_limited(node, force, dt);
                } else {
                    apply_clamped_force(node, &force, dt);
                }
            }
            return;
        }

        for face in &self.faces {
            let [a, b, c] = face.nodes;
            let v = (self.nodes[a].velocity + self.nodes[b].velocity + self.nodes[c].velocity) / 3.0;
            let area = crate::mesh::triangle_area(
                &self.nodes[a].position,
                &self.nodes[b].position,
                &self.nodes[c].position,
            );
            let force = aero_force(&params, &(v - wind), &face.normal, area) / 3.0;
            for i in face.nodes {
                let node = &mut self.nodes[i];
                if node.is_pinned() {
                    continue;
                }
                if params.model.lift_drag() {
                    add_drag_limited(node, force, dt);
                } else {
                    apply_clamped_force(node, &force, dt);
                }
            }
        }
    }
}

/// Scale a lift/drag force back if its velocity change would exceed the
/// node's speed.
fn add_drag_limited(node: &mut Node, mut force: Vector3<f64>, dt: f64) {
    let dv = force * (node.inv_mass * dt);
    let dv2 = dv.norm_squared();
    let v2 = node.velocity.norm_squared();
    if dv2 >= v2 && dv2 > 0.0 {
        force *= DRAG_CLAMP * (v2.sqrt() / dv2.sqrt());
    }
    node.force += force;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::material::MaterialId;
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    fn params(model: AeroModel) -> AeroParams {
        AeroParams {
            model,
            lift: 0.0,
            drag: 1.0,
            density: 1.2,
        }
    }

    #[test]
    fn test_drag_opposes_relative_wind() {
        let rel_v = Vector3::new(2.0, 0.0, 0.0);
        let f = aero_force(&params(AeroModel::VertexPoint), &rel_v, &Vector3::zeros(), 0.5);
        assert!(f.x < 0.0);
        assert_relative_eq!(f.y, 0.0);
        // c = 0.5 * 2 * 4 * 0.5 * 1.2
        assert_relative_eq!(f.x, -2.4, epsilon = 1e-12);
    }

    #[test]
    fn test_one_sided_ignores_back_face() {
        let rel_v = Vector3::new(0.0, 0.0, -1.0);
        let f = aero_force(&params(AeroModel::VertexOneSided), &rel_v, &Vector3::z(), 1.0);
        assert_eq!(f, Vector3::zeros());

        let two = aero_force(&params(AeroModel::VertexTwoSided), &rel_v, &Vector3::z(), 1.0);
        assert!(two.z > 0.0);
    }

    #[test]
    fn test_lift_drag_has_lift_at_angle() {
        let p = AeroParams {
            model: AeroModel::FaceTwoSidedLiftDrag,
            lift: 1.0,
            drag: 0.0,
            density: 1.0,
        };
        let rel_v = Vector3::new(1.0, 0.0, -1.0);
        let f = aero_force(&p, &rel_v, &Vector3::z(), 1.0);
        // Lift is perpendicular to the relative wind.
        assert_relative_eq!(f.dot(&rel_v), 0.0, epsilon = 1e-12);
        assert!(f.norm() > 0.0);
    }

    #[test]
    fn test_clamped_force_never_reverses() {
        let mut node = Node::new(Point3::origin(), 1.0, MaterialId(0));
        node.velocity = Vector3::new(1.0, 0.0, 0.0);
        apply_clamped_force(&mut node, &Vector3::new(-1000.0, 0.0, 0.0), 0.1);
        // Force cancels exactly the velocity along its axis.
        assert_relative_eq!(node.force, Vector3::new(-10.0, 0.0, 0.0), epsilon = 1e-12);

        let mut slow = Node::new(Point3::origin(), 1.0, MaterialId(0));
        slow.velocity = Vector3::new(1.0, 0.0, 0.0);
        apply_clamped_force(&mut slow, &Vector3::new(-1.0, 0.0, 0.0), 0.1);
        assert_relative_eq!(slow.force, Vector3::new(-1.0, 0.0, 0.0));
    }
}
