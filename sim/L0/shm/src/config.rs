//! Server configuration.

use nalgebra::Vector3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::block::{DEFAULT_QUEUE_CAPACITY, SHARED_MEMORY_KEY};

/// Settings of a [`crate::PhysicsServer`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ServerConfig {
    /// Region key.
    pub key: i32,
    /// Slots of each ring.
    pub capacity: usize,
    /// Up axis index (0 = x, 1 = y, 2 = z).
    pub up_axis: usize,
    /// Gravity magnitude along the negative up axis.
    pub gravity: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            key: SHARED_MEMORY_KEY,
            capacity: DEFAULT_QUEUE_CAPACITY,
            up_axis: 1,
            gravity: 9.8,
        }
    }
}

impl ServerConfig {
    /// Z-up configuration.
    #[must_use]
    pub fn z_up() -> Self {
        Self {
            up_axis: 2,
            ..Self::default()
        }
    }

    /// Gravity vector; an out-of-range up axis falls back to y.
    #[must_use]
    pub fn gravity_vector(&self) -> Vector3<f64> {
        let mut g = Vector3::zeros();
        let axis = if self.up_axis < 3 { self.up_axis } else { 1 };
        g[axis] = -self.gravity;
        g
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.key, 12347);
        assert_eq!(config.gravity_vector(), Vector3::new(0.0, -9.8, 0.0));
        assert_eq!(ServerConfig::z_up().gravity_vector(), Vector3::new(0.0, 0.0, -9.8));
    }

    #[test]
    fn test_bad_axis_falls_back() {
        let config = ServerConfig {
            up_axis: 7,
            ..ServerConfig::default()
        };
        assert_eq!(config.gravity_vector().y, -9.8);
    }
}
