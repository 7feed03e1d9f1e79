//! Landmark-based Monte Carlo localization toolbox
//!
//! This crate estimates the pose (position and heading) of a vehicle driving on a known landmark map
//! using a Sequential Importance Resampling (SIR) particle filter. A cloud of pose hypotheses is
//! propagated with a noisy kinematic motion model, weighted by how well each hypothesis explains the
//! landmark observations reported by the vehicle's sensors, and then resampled in proportion to those
//! weights. Over time the cloud concentrates around the poses most consistent with both the control
//! inputs and the observations.
//!
//! This crate is primarily built off of three additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the rigid transforms and the estimate/covariance math.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): Provides random number generation for process noise, initialization, and resampling.
//!
//! All other functionality is auxiliary (configuration I/O, simulation, logging). Map file parsing and
//! communication with an external driving simulator are intentionally left to the surrounding
//! application: the filter consumes an in-memory [`map::LandmarkMap`] and slices of
//! [`measurements::Observation`].
//!
//! ## Crate overview
//!
//! - [error]: The [`FilterError`] type returned by all fallible filter operations.
//! - [map]: Landmarks and the landmark map with nearest-neighbor association.
//! - [measurements]: Vehicle-frame observations, the vehicle-to-world transform, and the measurement likelihood.
//! - [particle]: The particle filter itself (initialization, prediction, weighting, resampling, estimation).
//! - [sim]: Synthetic scenarios and a closed-loop simulation harness for exercising the filter.
//!
//! ## Pose and motion model
//!
//! The vehicle state is the planar pose
//!
//! $$
//! x = [p_x, p_y, \theta]
//! $$
//!
//! in the world (map) frame. The heading $\theta$ is in radians and is never wrapped. Averaging
//! strategies average it arithmetically.
//!
//! Motion is driven by a [`ControlInput`] holding the forward velocity $v$ and yaw rate $\dot\psi$.
//! When the yaw rate is zero the vehicle moves in a straight line:
//!
//! $$
//! p_x(+) = p_x(-) + v \Delta t \cos\theta, \quad p_y(+) = p_y(-) + v \Delta t \sin\theta
//! $$
//!
//! Otherwise the constant turn rate (bicycle) model is used:
//!
//! $$
//! p_x(+) = p_x(-) + \frac{v}{\dot\psi} \left( \sin(\theta + \dot\psi \Delta t) - \sin\theta \right)
//! $$
//!
//! $$
//! p_y(+) = p_y(-) + \frac{v}{\dot\psi} \left( \cos\theta - \cos(\theta + \dot\psi \Delta t) \right)
//! $$
//!
//! $$
//! \theta(+) = \theta(-) + \dot\psi \Delta t
//! $$
//!
//! The deterministic step is implemented by [`Pose::forward`] and shared by the particle filter and
//! the simulation ground truth.
pub mod error;
pub mod map;
pub mod measurements;
pub mod particle;
pub mod sim;

pub use error::{FilterError, Result};

use nalgebra::{Point2, Rotation2, Vector2};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Yaw rates with a magnitude below this value use the straight-line motion model.
pub const MIN_YAW_RATE: f64 = 1e-9;

/// Planar vehicle pose in the world frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// World-frame x position
    pub x: f64,
    /// World-frame y position
    pub y: f64,
    /// Heading in radians, unbounded
    pub theta: f64,
}
impl Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pose(x: {:.4}, y: {:.4}, theta: {:.4})", self.x, self.y, self.theta)
    }
}
impl From<(f64, f64, f64)> for Pose {
    fn from(tuple: (f64, f64, f64)) -> Self {
        Pose::new(tuple.0, tuple.1, tuple.2)
    }
}
impl From<Pose> for Vec<f64> {
    fn from(pose: Pose) -> Self {
        vec![pose.x, pose.y, pose.theta]
    }
}
impl Pose {
    pub fn new(x: f64, y: f64, theta: f64) -> Pose {
        Pose { x, y, theta }
    }
    /// World-frame position as a point.
    pub fn position(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }
    /// Rotation from the vehicle frame into the world frame.
    pub fn rotation(&self) -> Rotation2<f64> {
        Rotation2::new(self.theta)
    }
    /// Euclidean distance between the positions of two poses.
    pub fn distance_to(&self, other: &Pose) -> f64 {
        (self.position() - other.position()).norm()
    }
    /// Map a point given in this pose's body frame into the world frame.
    ///
    /// # Example
    /// ```rust
    /// use mcl::Pose;
    /// use nalgebra::Vector2;
    ///
    /// let pose = Pose::new(4.0, 5.0, -std::f64::consts::FRAC_PI_2);
    /// let world = pose.to_world(&Vector2::new(2.0, 2.0));
    /// assert!((world.x - 6.0).abs() < 1e-12);
    /// assert!((world.y - 3.0).abs() < 1e-12);
    /// ```
    pub fn to_world(&self, body: &Vector2<f64>) -> Point2<f64> {
        self.position() + self.rotation() * body
    }
    /// Deterministic kinematic propagation of the pose.
    ///
    /// Uses the straight-line model when `|yaw_rate| < MIN_YAW_RATE` and the constant turn rate
    /// model otherwise. Returns `true` when the turning branch was taken, which lets callers scale
    /// their process noise accordingly.
    ///
    /// # Arguments
    /// * `control` - forward velocity and yaw rate
    /// * `dt` - time step in seconds
    ///
    /// # Example
    /// ```rust
    /// use mcl::{ControlInput, Pose};
    ///
    /// let mut pose = Pose::default();
    /// let turning = pose.forward(&ControlInput::new(2.0, 0.0), 1.0);
    /// assert!(!turning);
    /// assert_eq!(pose, Pose::new(2.0, 0.0, 0.0));
    /// ```
    pub fn forward(&mut self, control: &ControlInput, dt: f64) -> bool {
        let ControlInput { velocity, yaw_rate } = *control;
        if yaw_rate.abs() < MIN_YAW_RATE {
            self.x += dt * velocity * self.theta.cos();
            self.y += dt * velocity * self.theta.sin();
            false
        } else {
            let theta_next = self.theta + yaw_rate * dt;
            let radius = velocity / yaw_rate;
            self.x += radius * (theta_next.sin() - self.theta.sin());
            self.y += radius * (self.theta.cos() - theta_next.cos());
            self.theta = theta_next;
            true
        }
    }
}

/// Control input driving the motion model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlInput {
    /// Forward velocity (m/s)
    pub velocity: f64,
    /// Yaw rate (rad/s)
    pub yaw_rate: f64,
}
impl Display for ControlInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ControlInput(velocity: {:.4}, yaw_rate: {:.4})",
            self.velocity, self.yaw_rate
        )
    }
}
impl ControlInput {
    pub fn new(velocity: f64, yaw_rate: f64) -> ControlInput {
        ControlInput { velocity, yaw_rate }
    }
}
