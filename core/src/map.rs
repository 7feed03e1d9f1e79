//! Landmark map
//!
//! The map is supplied by the surrounding application (loading it from disk is not this crate's
//! concern) and is read-only for the lifetime of the filter. Association is plain nearest-neighbor
//! search over every landmark.
use crate::{FilterError, Result};

use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// A single map landmark in world coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    /// Unique landmark identifier
    pub id: i32,
    /// World-frame x position
    pub x: f64,
    /// World-frame y position
    pub y: f64,
}
impl Display for Landmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Landmark #{} ({:.3}, {:.3})", self.id, self.x, self.y)
    }
}
impl Landmark {
    pub fn new(id: i32, x: f64, y: f64) -> Landmark {
        Landmark { id, x, y }
    }
    pub fn position(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }
}

/// Ordered, non-empty collection of landmarks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LandmarkMap {
    landmarks: Vec<Landmark>,
}
impl LandmarkMap {
    /// Build a map from a list of landmarks.
    ///
    /// # Errors
    /// Returns [`FilterError::EmptyMap`] if `landmarks` is empty.
    ///
    /// # Example
    /// ```rust
    /// use mcl::map::{Landmark, LandmarkMap};
    ///
    /// let map = LandmarkMap::new(vec![Landmark::new(1, 0.0, 0.0), Landmark::new(2, 10.0, 0.0)]).unwrap();
    /// let (nearest, distance) = map.nearest(7.0, 0.0);
    /// assert_eq!(nearest.id, 2);
    /// assert!((distance - 3.0).abs() < 1e-12);
    /// ```
    pub fn new(landmarks: Vec<Landmark>) -> Result<LandmarkMap> {
        if landmarks.is_empty() {
            return Err(FilterError::EmptyMap);
        }
        Ok(LandmarkMap { landmarks })
    }
    pub fn landmarks(&self) -> &[Landmark] {
        &self.landmarks
    }
    pub fn len(&self) -> usize {
        self.landmarks.len()
    }
    /// Always `false`; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }
    pub fn get(&self, id: i32) -> Option<&Landmark> {
        self.landmarks.iter().find(|lm| lm.id == id)
    }
    /// Nearest landmark to a world-frame point and its Euclidean distance.
    ///
    /// The whole map is searched with no gating. Ties resolve to the landmark listed first.
    pub fn nearest(&self, x: f64, y: f64) -> (&Landmark, f64) {
        let query = Point2::new(x, y);
        let mut best = &self.landmarks[0];
        let mut best_distance = (best.position() - query).norm();
        for landmark in &self.landmarks[1..] {
            let distance = (landmark.position() - query).norm();
            if distance < best_distance {
                best = landmark;
                best_distance = distance;
            }
        }
        (best, best_distance)
    }
    /// Landmarks whose distance from `(x, y)` does not exceed `range`.
    pub fn within_range(&self, x: f64, y: f64, range: f64) -> impl Iterator<Item = &Landmark> {
        let query = Point2::new(x, y);
        self.landmarks
            .iter()
            .filter(move |lm| (lm.position() - query).norm() <= range)
    }
}
impl TryFrom<Vec<Landmark>> for LandmarkMap {
    type Error = FilterError;
    fn try_from(landmarks: Vec<Landmark>) -> Result<Self> {
        LandmarkMap::new(landmarks)
    }
}
impl TryFrom<&[(i32, f64, f64)]> for LandmarkMap {
    type Error = FilterError;
    fn try_from(records: &[(i32, f64, f64)]) -> Result<Self> {
        LandmarkMap::new(
            records
                .iter()
                .map(|&(id, x, y)| Landmark::new(id, x, y))
                .collect(),
        )
    }
}
