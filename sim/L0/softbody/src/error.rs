//! Error types for soft body simulation.

use thiserror::Error;

/// Errors that can occur while building or simulating soft bodies.
///
/// Expected, recoverable outcomes (a ray that hits nothing, a topology edit on
/// an edge that does not exist, a clustering pass that hit its iteration cap)
/// are reported through `Option`/`bool` results instead.
#[derive(Debug, Error)]
pub enum SoftBodyError {
    /// Invalid mesh topology (e.g., repeated node in a primitive).
    #[error("Invalid mesh topology: {0}")]
    InvalidTopology(String),

    /// Invalid material parameters (e.g., stiffness outside `[0, 1]`).
    #[error("Invalid material: {0}")]
    InvalidMaterial(String),

    /// Index out of bounds.
    #[error("Index out of bounds: {0}")]
    IndexOutOfBounds(String),

    /// Joint cannot be created with the requested endpoints.
    #[error("Invalid joint: {0}")]
    InvalidJoint(String),

    /// Configuration error.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Numerical error (`NaN`, infinity, singular matrix).
    #[error("Numerical error: {0}")]
    NumericalError(String),
}

impl SoftBodyError {
    /// Create an invalid topology error.
    pub fn invalid_topology(msg: impl Into<String>) -> Self {
        Self::InvalidTopology(msg.into())
    }

    /// Create an invalid material error.
    pub fn invalid_material(msg: impl Into<String>) -> Self {
        Self::InvalidMaterial(msg.into())
    }

    /// Create an index out of bounds error.
    pub fn index_out_of_bounds(msg: impl Into<String>) -> Self {
        Self::IndexOutOfBounds(msg.into())
    }

    /// Create an invalid joint error.
    pub fn invalid_joint(msg: impl Into<String>) -> Self {
        Self::InvalidJoint(msg.into())
    }

    /// Create an invalid config error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a numerical error.
    pub fn numerical_error(msg: impl Into<String>) -> Self {
        Self::NumericalError(msg.into())
    }
}

/// Result type for soft body operations.
pub type Result<T> = std::result::Result<T, SoftBodyError>;
