//! Landmark observations and the measurement model
//!
//! Sensors report landmarks as (x, y) offsets in the vehicle's own frame (x forward, y left). To
//! score a particle the offsets are pushed through the particle's pose into the world frame, matched
//! to the nearest map landmark, and evaluated under an axis-aligned bivariate Gaussian:
//!
//! $$
//! p(m \mid l) = \frac{1}{2 \pi \sigma_x \sigma_y} \exp\left( -\left( \frac{(m_x - l_x)^2}{2 \sigma_x^2} + \frac{(m_y - l_y)^2}{2 \sigma_y^2} \right) \right)
//! $$
use crate::Pose;
use crate::error::{Result, check_measurement_std_dev};

use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// A landmark measurement in the vehicle frame. Carries no landmark id; association is computed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub x: f64,
    pub y: f64,
}
impl Observation {
    pub fn new(x: f64, y: f64) -> Observation {
        Observation { x, y }
    }
    /// Build an observation from a range and a bearing relative to the vehicle heading.
    pub fn from_range_bearing(range: f64, bearing: f64) -> Observation {
        Observation {
            x: range * bearing.cos(),
            y: range * bearing.sin(),
        }
    }
    /// Transform the observation into the world frame as seen from `pose`.
    ///
    /// `mx = cos(theta) * ox - sin(theta) * oy + x`, `my = sin(theta) * ox + cos(theta) * oy + y`.
    pub fn to_world(&self, pose: &Pose) -> Point2<f64> {
        pose.to_world(&Vector2::new(self.x, self.y))
    }
}
impl From<(f64, f64)> for Observation {
    fn from(tuple: (f64, f64)) -> Self {
        Observation::new(tuple.0, tuple.1)
    }
}

/// Measurement noise of the landmark sensor along each world axis.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LandmarkNoise {
    pub std_x: f64,
    pub std_y: f64,
}
impl Default for LandmarkNoise {
    fn default() -> Self {
        LandmarkNoise {
            std_x: 0.3,
            std_y: 0.3,
        }
    }
}
impl LandmarkNoise {
    /// Validated noise parameters from the `[std_x, std_y]` pair callers usually hold.
    ///
    /// Both values must be strictly positive; a zero-variance density is undefined.
    pub fn new(std_landmark: [f64; 2]) -> Result<LandmarkNoise> {
        Ok(LandmarkNoise {
            std_x: check_measurement_std_dev("std_landmark[0]", std_landmark[0])?,
            std_y: check_measurement_std_dev("std_landmark[1]", std_landmark[1])?,
        })
    }
    /// Likelihood of observing `measured` when the true landmark sits at `landmark`.
    pub fn likelihood(&self, measured: &Point2<f64>, landmark: &Point2<f64>) -> f64 {
        bivariate_gaussian(
            measured.x - landmark.x,
            measured.y - landmark.y,
            self.std_x,
            self.std_y,
        )
    }
}

/// Density of a zero-mean bivariate Gaussian with independent axes evaluated at `(dx, dy)`.
///
/// No underflow guard: far outliers evaluate to exactly zero.
pub fn bivariate_gaussian(dx: f64, dy: f64, std_x: f64, std_y: f64) -> f64 {
    let exponent = -(dx * dx / (2.0 * std_x * std_x) + dy * dy / (2.0 * std_y * std_y));
    exponent.exp() / (2.0 * PI * std_x * std_y)
}
