//! Material coefficients shared by links, faces and tetrahedra.
//!
//! A material is a set of three normalized stiffness coefficients:
//!
//! - **Linear (kLST)**: resistance of links to stretching, in `[0, 1]`
//! - **Area (kAST)**: resistance of faces to shearing, in `[0, 1]`
//! - **Volume (kVST)**: resistance of tetrahedra to volume change, in `[0, 1]`
//!
//! Materials live in a per-body arena and primitives refer to them through a
//! [`MaterialId`], so editing a material changes every primitive that uses it
//! once the body's derived constants are refreshed.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Result, SoftBodyError};

/// Index of a material in a body's material arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MaterialId(pub usize);

bitflags::bitflags! {
    /// Material flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct MaterialFlags: u32 {
        /// Primitives using this material are drawn by debug renderers.
        const DEBUG_DRAW = 0b0000_0001;
    }
}

impl Default for MaterialFlags {
    fn default() -> Self {
        Self::DEBUG_DRAW
    }
}

/// Stiffness coefficients for soft body primitives.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Material {
    /// Linear stiffness coefficient, `[0, 1]`.
    pub linear_stiffness: f64,
    /// Area/angular stiffness coefficient, `[0, 1]`.
    pub area_stiffness: f64,
    /// Volume stiffness coefficient, `[0, 1]`.
    pub volume_stiffness: f64,
    /// Flags.
    pub flags: MaterialFlags,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            linear_stiffness: 1.0,
            area_stiffness: 1.0,
            volume_stiffness: 1.0,
            flags: MaterialFlags::DEBUG_DRAW,
        }
    }
}

impl Material {
    /// Create a material with the given stiffness coefficients.
    #[must_use]
    pub fn new(linear: f64, area: f64, volume: f64) -> Self {
        Self {
            linear_stiffness: linear,
            area_stiffness: area,
            volume_stiffness: volume,
            flags: MaterialFlags::DEBUG_DRAW,
        }
    }

    /// Stretchy fabric: soft links, little shear resistance.
    #[must_use]
    pub fn cloth() -> Self {
        Self::new(0.5, 0.2, 0.0)
    }

    /// Rubber-like volume.
    #[must_use]
    pub fn rubber() -> Self {
        Self::new(0.6, 0.6, 0.9)
    }

    /// Nearly inextensible strand.
    #[must_use]
    pub fn rope() -> Self {
        Self::new(1.0, 0.0, 0.0)
    }

    /// Set the linear stiffness.
    #[must_use]
    pub const fn with_linear_stiffness(mut self, k: f64) -> Self {
        self.linear_stiffness = k;
        self
    }

    /// Set the flags.
    #[must_use]
    pub const fn with_flags(mut self, flags: MaterialFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Whether primitives using this material should be debug-drawn.
    #[must_use]
    pub const fn debug_draw(&self) -> bool {
        self.flags.contains(MaterialFlags::DEBUG_DRAW)
    }

    /// Check that all coefficients lie in `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`SoftBodyError::InvalidMaterial`] naming the first coefficient
    /// that is out of range or not finite.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("linear_stiffness", self.linear_stiffness),
            ("area_stiffness", self.area_stiffness),
            ("volume_stiffness", self.volume_stiffness),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(SoftBodyError::invalid_material(format!(
                    "{name} must be in [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}
