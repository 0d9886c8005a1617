//! Solver configuration for soft bodies.
//!
//! All coefficients are dimensionless and, unless noted, live in `[0, 1]`.
//! Hardness coefficients scale how much of a constraint violation is removed
//! per solver pass; split coefficients route a share of a cluster contact's
//! correction into a position-only impulse.
//!
//! The three solver sequences are ordered lists of solver kinds. Membership
//! and order are configuration: the position pass is Gauss-Seidel, so the
//! order changes results.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::aero::AeroModel;
use crate::error::{Result, SoftBodyError};

/// Velocity-domain solver kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum VelocitySolver {
    /// Spring damping along each link.
    Linear,
}

/// Position-domain solver kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PositionSolver {
    /// Link rest lengths.
    Linear,
    /// Node-to-rigid anchors.
    Anchors,
    /// Node vs rigid signed distance contacts.
    RigidContacts,
    /// Node vs face contacts between soft bodies.
    SoftContacts,
    /// Tetrahedron rest volumes.
    Volumes,
}

/// Named solver sequence presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SolverPreset {
    /// Springs solved in the position pass.
    Positions,
    /// Springs damped in the velocity pass and relaxed in the drift pass.
    Velocities,
}

bitflags::bitflags! {
    /// Collision handlers enabled for a body.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct CollisionFlags: u32 {
        /// Nodes vs rigid signed distance fields.
        const SDF_RS = 0b0000_0001;
        /// Clusters vs rigid bodies.
        const CL_RS = 0b0000_0010;
        /// Nodes vs faces between soft bodies.
        const VF_SS = 0b0001_0000;
        /// Clusters vs clusters between soft bodies.
        const CL_SS = 0b0010_0000;
        /// Non-adjacent clusters of the same body.
        const CL_SELF = 0b0100_0000;
    }
}

impl Default for CollisionFlags {
    fn default() -> Self {
        Self::SDF_RS
    }
}

/// Soft body solver configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SoftBodyConfig {
    /// Velocity correction factor applied after the drift pass.
    pub velocity_correction: f64,
    /// Velocity damping at commit.
    pub damping: f64,
    /// Drag coefficient.
    pub drag: f64,
    /// Lift coefficient.
    pub lift: f64,
    /// Pressure coefficient (any sign).
    pub pressure: f64,
    /// Volume conservation coefficient, `>= 0`.
    pub volume_conservation: f64,
    /// Dynamic friction coefficient.
    pub dynamic_friction: f64,
    /// Pose matching coefficient.
    pub pose_matching: f64,
    /// Hardness of node contacts with dynamic rigid bodies.
    pub rigid_contact_hardness: f64,
    /// Hardness of node contacts with static or kinematic rigid bodies.
    pub kinetic_contact_hardness: f64,
    /// Hardness of soft-soft contacts.
    pub soft_contact_hardness: f64,
    /// Hardness of anchors.
    pub anchor_hardness: f64,
    /// Cluster vs dynamic rigid hardness.
    pub cluster_rigid_hardness: f64,
    /// Cluster vs static or kinematic rigid hardness.
    pub cluster_kinetic_hardness: f64,
    /// Cluster vs cluster hardness.
    pub cluster_soft_hardness: f64,
    /// Cluster vs dynamic rigid impulse split.
    pub cluster_rigid_split: f64,
    /// Cluster vs static or kinematic rigid impulse split.
    pub cluster_kinetic_split: f64,
    /// Cluster vs cluster impulse split.
    pub cluster_soft_split: f64,
    /// Maximum volume ratio for the pose scale, `>= 1`.
    pub max_volume: f64,
    /// Time scale applied to the step size, `> 0`.
    pub timescale: f64,
    /// Velocity pass iterations.
    pub velocity_iterations: usize,
    /// Position pass iterations.
    pub position_iterations: usize,
    /// Drift pass iterations.
    pub drift_iterations: usize,
    /// Cluster joint solve iterations.
    pub cluster_iterations: usize,
    /// Enabled collision handlers.
    pub collisions: CollisionFlags,
    /// Aerodynamic model.
    pub aero_model: AeroModel,
    /// Number of steps a cluster contact joint survives.
    pub contact_max_life: u32,
    /// Minimum impulse magnitude for self-collision response.
    pub max_self_collision_impulse: f64,
    /// Scale applied to self-collision impulses.
    pub self_collision_impulse_factor: f64,
    /// Velocity pass sequence.
    pub velocity_sequence: Vec<VelocitySolver>,
    /// Position pass sequence.
    pub position_sequence: Vec<PositionSolver>,
    /// Drift pass sequence.
    pub drift_sequence: Vec<PositionSolver>,
}

impl Default for SoftBodyConfig {
    fn default() -> Self {
        let mut config = Self {
            velocity_correction: 1.0,
            damping: 0.0,
            drag: 0.0,
            lift: 0.0,
            pressure: 0.0,
            volume_conservation: 0.0,
            dynamic_friction: 0.2,
            pose_matching: 0.0,
            rigid_contact_hardness: 1.0,
            kinetic_contact_hardness: 0.1,
            soft_contact_hardness: 1.0,
            anchor_hardness: 0.7,
            cluster_rigid_hardness: 0.1,
            cluster_kinetic_hardness: 1.0,
            cluster_soft_hardness: 0.5,
            cluster_rigid_split: 0.5,
            cluster_kinetic_split: 0.5,
            cluster_soft_split: 0.5,
            max_volume: 1.0,
            timescale: 1.0,
            velocity_iterations: 0,
            position_iterations: 1,
            drift_iterations: 0,
            cluster_iterations: 4,
            collisions: CollisionFlags::default(),
            aero_model: AeroModel::default(),
            contact_max_life: 0,
            max_self_collision_impulse: 100.0,
            self_collision_impulse_factor: 0.01,
            velocity_sequence: Vec::new(),
            position_sequence: Vec::new(),
            drift_sequence: Vec::new(),
        };
        config.set_solver(SolverPreset::Positions);
        config
    }
}

impl SoftBodyConfig {
    /// Config for cloth: two-sided face aerodynamics, stiff springs,
    /// several position iterations.
    #[must_use]
    pub fn cloth() -> Self {
        Self {
            aero_model: AeroModel::FaceTwoSided,
            drag: 0.1,
            lift: 0.05,
            damping: 0.01,
            position_iterations: 8,
            ..Self::default()
        }
    }

    /// Config for closed volumetric bodies: pose matching and volume
    /// conservation with cluster collisions.
    #[must_use]
    pub fn volumetric() -> Self {
        Self {
            pose_matching: 0.1,
            volume_conservation: 20.0,
            max_volume: 1.5,
            position_iterations: 4,
            collisions: CollisionFlags::SDF_RS | CollisionFlags::CL_SS,
            ..Self::default()
        }
    }

    /// Config for ropes: many position iterations, no aerodynamics.
    #[must_use]
    pub fn rope() -> Self {
        Self {
            position_iterations: 16,
            damping: 0.005,
            ..Self::default()
        }
    }

    /// Replace the three solver sequences with a preset.
    pub fn set_solver(&mut self, preset: SolverPreset) {
        use PositionSolver::{Anchors, Linear, RigidContacts, SoftContacts};

        match preset {
            SolverPreset::Positions => {
                self.velocity_sequence = Vec::new();
                self.position_sequence = vec![Linear, Anchors, RigidContacts, SoftContacts];
                self.drift_sequence = vec![Linear];
            }
            SolverPreset::Velocities => {
                self.velocity_sequence = vec![VelocitySolver::Linear];
                self.position_sequence = vec![Anchors, RigidContacts, SoftContacts];
                self.drift_sequence = vec![Linear];
            }
        }
    }

    /// Check coefficient ranges.
    ///
    /// # Errors
    ///
    /// Returns [`SoftBodyError::InvalidConfig`] naming the first offending
    /// field.
    pub fn validate(&self) -> Result<()> {
        let unit = [
            ("velocity_correction", self.velocity_correction),
            ("damping", self.damping),
            ("dynamic_friction", self.dynamic_friction),
            ("pose_matching", self.pose_matching),
            ("rigid_contact_hardness", self.rigid_contact_hardness),
            ("kinetic_contact_hardness", self.kinetic_contact_hardness),
            ("soft_contact_hardness", self.soft_contact_hardness),
            ("anchor_hardness", self.anchor_hardness),
            ("cluster_rigid_hardness", self.cluster_rigid_hardness),
            ("cluster_kinetic_hardness", self.cluster_kinetic_hardness),
            ("cluster_soft_hardness", self.cluster_soft_hardness),
            ("cluster_rigid_split", self.cluster_rigid_split),
            ("cluster_kinetic_split", self.cluster_kinetic_split),
            ("cluster_soft_split", self.cluster_soft_split),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(SoftBodyError::invalid_config(format!(
                    "{name} must be in [0, 1], got {value}"
                )));
            }
        }
        for (name, value) in [
            ("drag", self.drag),
            ("lift", self.lift),
            ("volume_conservation", self.volume_conservation),
            ("max_self_collision_impulse", self.max_self_collision_impulse),
            ("self_collision_impulse_factor", self.self_collision_impulse_factor),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(SoftBodyError::invalid_config(format!(
                    "{name} must be non-negative, got {value}"
                )));
            }
        }
        if !self.pressure.is_finite() {
            return Err(SoftBodyError::invalid_config("pressure must be finite"));
        }
        if self.max_volume.is_nan() || self.max_volume < 1.0 {
            return Err(SoftBodyError::invalid_config(format!(
                "max_volume must be >= 1, got {}",
                self.max_volume
            )));
        }
        if !self.timescale.is_finite() || self.timescale <= 0.0 {
            return Err(SoftBodyError::invalid_config(format!(
                "timescale must be positive, got {}",
                self.timescale
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(SoftBodyConfig::default().validate().is_ok());
        assert!(SoftBodyConfig::cloth().validate().is_ok());
        assert!(SoftBodyConfig::volumetric().validate().is_ok());
        assert!(SoftBodyConfig::rope().validate().is_ok());
    }

    #[test]
    fn test_default_sequences() {
        let config = SoftBodyConfig::default();
        assert!(config.velocity_sequence.is_empty());
        assert_eq!(config.position_sequence[0], PositionSolver::Linear);
        assert_eq!(config.position_sequence.len(), 4);
        assert_eq!(config.collisions, CollisionFlags::SDF_RS);
    }

    #[test]
    fn test_set_solver_velocities() {
        let mut config = SoftBodyConfig::default();
        config.set_solver(SolverPreset::Velocities);
        assert_eq!(config.velocity_sequence, vec![VelocitySolver::Linear]);
        assert!(!config.position_sequence.contains(&PositionSolver::Linear));
        assert_eq!(config.drift_sequence, vec![PositionSolver::Linear]);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let config = SoftBodyConfig {
            anchor_hardness: 1.5,
            ..SoftBodyConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("anchor_hardness"));

        let config = SoftBodyConfig {
            timescale: 0.0,
            ..SoftBodyConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
