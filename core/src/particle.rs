//! Sequential importance resampling particle filter for landmark-based localization.
//!
//! Each [`Particle`] is one hypothesis of the vehicle pose. A [`ParticleFilter`] owns a fixed-size
//! population of them and runs the usual SIR cycle once per observation frame:
//!
//! 1. [`ParticleFilter::initialize`] seeds the population around a coarse prior (e.g. a GPS fix).
//!    Runs exactly once.
//! 2. [`ParticleFilter::predict`] pushes every particle through the motion model and adds process
//!    noise.
//! 3. [`ParticleFilter::update_weights`] scores every particle against the landmark observations.
//! 4. [`ParticleFilter::resample`] draws a new population in proportion to the weights.
//!
//! Every stochastic step takes the random number generator as an argument, so a seeded
//! [`rand::rngs::StdRng`] makes a whole run reproducible.
//!
//! The weight stored on each particle is the only copy of that weight. [`ParticleFilter::weights`]
//! derives the sampling vector from the particles in order, so the two can never disagree.
use crate::error::{Result, check_std_dev};
use crate::map::LandmarkMap;
use crate::measurements::{LandmarkNoise, Observation};
use crate::{ControlInput, FilterError, Pose};

use log::{debug, warn};
use nalgebra::{Matrix3, Vector3};
use rand::Rng;
use rand::distr::weighted::WeightedIndex;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};

/// Default population size; a pragmatic accuracy/cost trade-off.
pub const DEFAULT_NUM_PARTICLES: usize = 1000;
/// Positional process noise multiplier applied only while turning, where the motion model is
/// less trustworthy.
pub const TURN_NOISE_SCALE: f64 = 1.5;

#[derive(Clone, Debug, PartialEq)]
pub struct Particle {
    pub pose: Pose,
    /// Relative (unnormalized) importance weight
    pub weight: f64,
    /// Landmark ids matched in the most recent weighting pass
    pub associations: Vec<i32>,
    /// World-frame x of each matched observation
    pub sense_x: Vec<f64>,
    /// World-frame y of each matched observation
    pub sense_y: Vec<f64>,
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("x", &self.pose.x)
            .field("y", &self.pose.y)
            .field("theta", &self.pose.theta)
            .field("weight", &self.weight)
            .field("associations", &self.associations.len())
            .finish()
    }
}
impl Particle {
    pub fn new(pose: Pose, weight: f64) -> Particle {
        Particle {
            pose,
            weight,
            associations: Vec::new(),
            sense_x: Vec::new(),
            sense_y: Vec::new(),
        }
    }
    /// Replace the association triple from the latest weighting pass.
    pub fn set_associations(&mut self, associations: Vec<i32>, sense_x: Vec<f64>, sense_y: Vec<f64>) {
        debug_assert!(associations.len() == sense_x.len() && sense_x.len() == sense_y.len());
        self.associations = associations;
        self.sense_x = sense_x;
        self.sense_y = sense_y;
    }
    /// Matched landmark ids as space separated text.
    pub fn get_associations(&self) -> String {
        join_space_separated(&self.associations)
    }
    /// World-frame x of the matched observations as space separated text.
    pub fn get_sense_x(&self) -> String {
        join_space_separated(&self.sense_x)
    }
    /// World-frame y of the matched observations as space separated text.
    pub fn get_sense_y(&self) -> String {
        join_space_separated(&self.sense_y)
    }
    /// Propagate the particle with the motion model and add process noise.
    ///
    /// Noise is zero mean with the given per-axis distributions. In the turning branch the x/y noise
    /// draws are multiplied by `turn_noise_scale`; heading noise is never scaled.
    pub fn propagate<R: Rng + ?Sized>(
        &mut self,
        control: &ControlInput,
        dt: f64,
        noise: &ProcessNoise,
        turn_noise_scale: f64,
        rng: &mut R,
    ) {
        let turning = self.pose.forward(control, dt);
        let scale = if turning { turn_noise_scale } else { 1.0 };
        self.pose.x += scale * noise.x.sample(rng);
        self.pose.y += scale * noise.y.sample(rng);
        self.pose.theta += noise.theta.sample(rng);
    }
    /// Recompute the weight from a frame of vehicle-frame observations.
    ///
    /// Each observation is moved to the world frame through this particle's pose and matched to the
    /// nearest landmark. The match is dropped when that landmark is farther than `sensor_range` from
    /// the particle's own position (not from the transformed observation). Every kept match
    /// multiplies the weight by its Gaussian likelihood. A particle that keeps no match gets weight 0.
    ///
    /// Returns the number of observations that were matched.
    pub fn update_weight(
        &mut self,
        sensor_range: f64,
        noise: &LandmarkNoise,
        observations: &[Observation],
        map: &LandmarkMap,
    ) -> usize {
        let mut weight = 1.0;
        let mut associations = Vec::with_capacity(observations.len());
        let mut sense_x = Vec::with_capacity(observations.len());
        let mut sense_y = Vec::with_capacity(observations.len());
        let position = self.pose.position();
        for observation in observations {
            let measured = observation.to_world(&self.pose);
            let (landmark, _) = map.nearest(measured.x, measured.y);
            if (landmark.position() - position).norm() > sensor_range {
                continue;
            }
            associations.push(landmark.id);
            sense_x.push(measured.x);
            sense_y.push(measured.y);
            weight *= noise.likelihood(&measured, &landmark.position());
        }
        let matched = associations.len();
        self.weight = if matched == 0 { 0.0 } else { weight };
        self.set_associations(associations, sense_x, sense_y);
        matched
    }
}

fn join_space_separated<T: Display>(values: &[T]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Zero-mean Gaussian process noise for each pose axis.
#[derive(Clone, Debug)]
pub struct ProcessNoise {
    x: Normal<f64>,
    y: Normal<f64>,
    theta: Normal<f64>,
}
impl ProcessNoise {
    /// Build from the `[std_x, std_y, std_theta]` triple.
    ///
    /// # Errors
    /// [`FilterError::InvalidStdDev`] for a negative or non-finite entry. Zero is allowed and
    /// disables noise on that axis.
    pub fn new(std_pos: [f64; 3]) -> Result<ProcessNoise> {
        Ok(ProcessNoise {
            x: gaussian("std_pos[0]", 0.0, std_pos[0])?,
            y: gaussian("std_pos[1]", 0.0, std_pos[1])?,
            theta: gaussian("std_pos[2]", 0.0, std_pos[2])?,
        })
    }
    /// One draw each of the x and y noise.
    pub fn sample_xy<R: Rng + ?Sized>(&self, rng: &mut R) -> (f64, f64) {
        (self.x.sample(rng), self.y.sample(rng))
    }
    pub fn sample_theta<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        self.theta.sample(rng)
    }
}

fn gaussian(name: &'static str, mean: f64, std_dev: f64) -> Result<Normal<f64>> {
    let std_dev = check_std_dev(name, std_dev)?;
    Normal::new(mean, std_dev).map_err(|_| FilterError::InvalidStdDev {
        name,
        value: std_dev,
    })
}

/// How the resampler turns weights into surviving particle indices.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ResamplingStrategy {
    /// Independent categorical draws with replacement.
    #[default]
    Multinomial,
    /// One uniform offset, evenly spaced pointers.
    Systematic,
    /// One uniform draw inside each of N equal strata.
    Stratified,
    /// Deterministic floor(N w) copies, remainder drawn systematically from the residuals.
    Residual,
}
impl ResamplingStrategy {
    /// Draw `n` indices into `weights` with probability proportional to weight.
    ///
    /// Weights that cannot define a distribution (all zero, negative, or non-finite) fall back to
    /// uniform draws over every index.
    pub fn draw<R: Rng + ?Sized>(&self, weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
        if weights.is_empty() || n == 0 {
            return Vec::new();
        }
        let total: f64 = weights.iter().sum();
        let usable = total > 0.0 && total.is_finite() && weights.iter().all(|w| *w >= 0.0);
        if !usable {
            warn!(
                "Resampling from degenerate weights (sum = {:.4e}); falling back to uniform",
                total
            );
            return uniform_draw(weights.len(), n, rng);
        }
        match self {
            ResamplingStrategy::Multinomial => multinomial_draw(weights, n, rng),
            ResamplingStrategy::Systematic => {
                let offset = rng.random::<f64>();
                let pointers: Vec<f64> = (0..n).map(|i| (i as f64 + offset) / n as f64).collect();
                walk_cumulative(weights, total, &pointers)
            }
            ResamplingStrategy::Stratified => {
                let pointers: Vec<f64> = (0..n)
                    .map(|i| (i as f64 + rng.random::<f64>()) / n as f64)
                    .collect();
                walk_cumulative(weights, total, &pointers)
            }
            ResamplingStrategy::Residual => residual_draw(weights, total, n, rng),
        }
    }
}

fn uniform_draw<R: Rng + ?Sized>(len: usize, n: usize, rng: &mut R) -> Vec<usize> {
    (0..n).map(|_| rng.random_range(0..len)).collect()
}

fn multinomial_draw<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    match WeightedIndex::new(weights) {
        Ok(sampler) => (0..n).map(|_| sampler.sample(rng)).collect(),
        Err(e) => {
            warn!("Weighted sampler rejected weights ({e}); falling back to uniform");
            uniform_draw(weights.len(), n, rng)
        }
    }
}

/// Map sorted pointers in [0, 1) onto the normalized cumulative weight distribution.
fn walk_cumulative(weights: &[f64], total: f64, pointers: &[f64]) -> Vec<usize> {
    let last = weights.len() - 1;
    let mut indices = Vec::with_capacity(pointers.len());
    let mut i = 0;
    let mut cumsum = weights[0] / total;
    for &u in pointers {
        while u >= cumsum && i < last {
            i += 1;
            cumsum += weights[i] / total;
        }
        indices.push(i);
    }
    indices
}

fn residual_draw<R: Rng + ?Sized>(weights: &[f64], total: f64, n: usize, rng: &mut R) -> Vec<usize> {
    let mut indices = Vec::with_capacity(n);
    let mut residual = Vec::with_capacity(weights.len());
    for (i, w) in weights.iter().enumerate() {
        let expected = w / total * n as f64;
        let copies = expected.floor() as usize;
        indices.extend(std::iter::repeat_n(i, copies.min(n - indices.len())));
        residual.push(expected - copies as f64);
    }
    let remaining = n - indices.len();
    if remaining > 0 {
        let residual_total: f64 = residual.iter().sum();
        if residual_total > 0.0 {
            let offset = rng.random::<f64>();
            let pointers: Vec<f64> = (0..remaining)
                .map(|i| (i as f64 + offset) / remaining as f64)
                .collect();
            indices.extend(walk_cumulative(&residual, residual_total, &pointers));
        } else {
            indices.extend(multinomial_draw(weights, remaining, rng));
        }
    }
    indices
}

/// How a single pose estimate is extracted from the particle cloud.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum AveragingStrategy {
    /// The pose of the particle with the largest weight.
    #[default]
    HighestWeight,
    WeightedAverage,
    UnweightedAverage,
}
impl AveragingStrategy {
    /// Mean pose and 3x3 covariance of (x, y, theta) for the given particles.
    ///
    /// Heading is averaged arithmetically, consistent with it never being wrapped.
    pub fn estimate(&self, particles: &[Particle]) -> (Vector3<f64>, Matrix3<f64>) {
        match self {
            AveragingStrategy::HighestWeight => highest_weight_state(particles),
            AveragingStrategy::WeightedAverage => {
                let total: f64 = particles.iter().map(|p| p.weight).sum();
                if total > 0.0 && total.is_finite() {
                    weighted_state(particles, |p| p.weight / total)
                } else {
                    let n = particles.len() as f64;
                    weighted_state(particles, |_| 1.0 / n)
                }
            }
            AveragingStrategy::UnweightedAverage => {
                let n = particles.len() as f64;
                weighted_state(particles, |_| 1.0 / n)
            }
        }
    }
}

fn state_of(particle: &Particle) -> Vector3<f64> {
    Vector3::new(particle.pose.x, particle.pose.y, particle.pose.theta)
}

fn weighted_state(
    particles: &[Particle],
    weight_of: impl Fn(&Particle) -> f64,
) -> (Vector3<f64>, Matrix3<f64>) {
    let mut mean = Vector3::<f64>::zeros();
    for particle in particles {
        mean += weight_of(particle) * state_of(particle);
    }
    let mut cov = Matrix3::<f64>::zeros();
    for particle in particles {
        let diff = state_of(particle) - mean;
        cov += weight_of(particle) * diff * diff.transpose();
    }
    (mean, cov)
}

fn highest_weight_state(particles: &[Particle]) -> (Vector3<f64>, Matrix3<f64>) {
    let best = particles
        .iter()
        .fold(None::<&Particle>, |best, p| match best {
            Some(b) if b.weight >= p.weight => Some(b),
            _ => Some(p),
        });
    match best {
        Some(p) => (state_of(p), Matrix3::zeros()),
        None => (Vector3::zeros(), Matrix3::zeros()),
    }
}

/// Tunables of the particle filter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticleFilterConfig {
    /// Population size, fixed for the lifetime of the filter
    #[serde(default = "default_num_particles")]
    pub num_particles: usize,
    /// Multiplier on x/y process noise while turning
    #[serde(default = "default_turn_noise_scale")]
    pub turn_noise_scale: f64,
    #[serde(default)]
    pub resampling_strategy: ResamplingStrategy,
    #[serde(default)]
    pub averaging_strategy: AveragingStrategy,
}
fn default_num_particles() -> usize {
    DEFAULT_NUM_PARTICLES
}
fn default_turn_noise_scale() -> f64 {
    TURN_NOISE_SCALE
}
impl Default for ParticleFilterConfig {
    fn default() -> Self {
        ParticleFilterConfig {
            num_particles: DEFAULT_NUM_PARTICLES,
            turn_noise_scale: TURN_NOISE_SCALE,
            resampling_strategy: ResamplingStrategy::default(),
            averaging_strategy: AveragingStrategy::default(),
        }
    }
}

/// Landmark-based SIR particle filter.
///
/// # Example
///
/// ```rust
/// use mcl::map::{Landmark, LandmarkMap};
/// use mcl::measurements::Observation;
/// use mcl::particle::ParticleFilter;
/// use mcl::{ControlInput, Pose};
/// use rand::SeedableRng;
/// use rand::rngs::StdRng;
///
/// let map = LandmarkMap::new(vec![Landmark::new(1, 5.0, 0.0), Landmark::new(2, 0.0, 5.0)]).unwrap();
/// let mut rng = StdRng::seed_from_u64(42);
/// let mut pf = ParticleFilter::with_num_particles(100).unwrap();
///
/// pf.initialize(Pose::new(0.0, 0.0, 0.0), [0.3, 0.3, 0.01], &mut rng).unwrap();
/// pf.predict(0.1, [0.3, 0.3, 0.01], &ControlInput::new(1.0, 0.0), &mut rng).unwrap();
/// pf.update_weights(50.0, [0.3, 0.3], &[Observation::new(4.9, 0.0)], &map).unwrap();
/// pf.resample(&mut rng).unwrap();
///
/// assert_eq!(pf.num_particles(), 100);
/// let best = pf.best_particle().unwrap();
/// assert_eq!(best.get_associations(), "1");
/// ```
#[derive(Clone)]
pub struct ParticleFilter {
    particles: Vec<Particle>,
    config: ParticleFilterConfig,
    is_initialized: bool,
}
impl Debug for ParticleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_weight = self
            .particles
            .iter()
            .map(|p| p.weight)
            .fold(f64::INFINITY, f64::min);
        let max_weight = self.particles.iter().map(|p| p.weight).fold(0.0, f64::max);
        let (mean, _) = AveragingStrategy::WeightedAverage.estimate(&self.particles);
        f.debug_struct("ParticleFilter")
            .field("num_particles", &self.config.num_particles)
            .field("is_initialized", &self.is_initialized)
            .field("effective_particles", &self.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .field(
                "mean_pose",
                &format_args!("({:.3}, {:.3}, {:.3} rad)", mean[0], mean[1], mean[2]),
            )
            .finish()
    }
}
impl ParticleFilter {
    /// Create an uninitialized filter.
    ///
    /// # Errors
    /// [`FilterError::ZeroParticles`] when `config.num_particles == 0`.
    pub fn new(config: ParticleFilterConfig) -> Result<ParticleFilter> {
        if config.num_particles == 0 {
            return Err(FilterError::ZeroParticles);
        }
        Ok(ParticleFilter {
            particles: Vec::with_capacity(config.num_particles),
            config,
            is_initialized: false,
        })
    }
    /// Create an uninitialized filter with default settings and the given population size.
    pub fn with_num_particles(num_particles: usize) -> Result<ParticleFilter> {
        ParticleFilter::new(ParticleFilterConfig {
            num_particles,
            ..ParticleFilterConfig::default()
        })
    }
    pub fn config(&self) -> &ParticleFilterConfig {
        &self.config
    }
    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }
    pub fn num_particles(&self) -> usize {
        self.config.num_particles
    }
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }
    /// Sampling weights, in particle order.
    pub fn weights(&self) -> Vec<f64> {
        self.particles.iter().map(|p| p.weight).collect()
    }
    /// Overwrite the particle weights, e.g. to inject an externally computed likelihood.
    pub fn set_weights(&mut self, weights: &[f64]) -> Result<()> {
        self.ensure_initialized()?;
        if weights.len() != self.particles.len() {
            return Err(FilterError::WeightCountMismatch {
                expected: self.particles.len(),
                actual: weights.len(),
            });
        }
        for (particle, &w) in self.particles.iter_mut().zip(weights) {
            particle.weight = w;
        }
        Ok(())
    }
    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized {
            Ok(())
        } else {
            Err(FilterError::NotInitialized)
        }
    }
    /// Seed the population around a prior pose.
    ///
    /// Every particle's x, y and theta are drawn independently from Gaussians centred on `prior`
    /// with standard deviations `std = [std_x, std_y, std_theta]`. All weights start at 1.
    ///
    /// # Errors
    /// - [`FilterError::AlreadyInitialized`] if called a second time.
    /// - [`FilterError::InvalidStdDev`] for a negative or non-finite standard deviation.
    pub fn initialize<R: Rng + ?Sized>(
        &mut self,
        prior: Pose,
        std: [f64; 3],
        rng: &mut R,
    ) -> Result<()> {
        if self.is_initialized {
            return Err(FilterError::AlreadyInitialized);
        }
        let dist_x = gaussian("std[0]", prior.x, std[0])?;
        let dist_y = gaussian("std[1]", prior.y, std[1])?;
        let dist_theta = gaussian("std[2]", prior.theta, std[2])?;
        self.particles = (0..self.config.num_particles)
            .map(|_| {
                let pose = Pose::new(
                    dist_x.sample(rng),
                    dist_y.sample(rng),
                    dist_theta.sample(rng),
                );
                Particle::new(pose, 1.0)
            })
            .collect();
        self.is_initialized = true;
        debug!(
            "Initialized {} particles around {}",
            self.particles.len(),
            prior
        );
        Ok(())
    }
    /// Advance every particle by `delta_t` under `control`, then add process noise.
    ///
    /// Straight-line model when the yaw rate is numerically zero, constant turn rate model
    /// otherwise. Positional noise is scaled by `turn_noise_scale` in the turning branch.
    ///
    /// # Errors
    /// - [`FilterError::NotInitialized`]
    /// - [`FilterError::InvalidStdDev`] for a negative or non-finite entry of `std_pos`.
    pub fn predict<R: Rng + ?Sized>(
        &mut self,
        delta_t: f64,
        std_pos: [f64; 3],
        control: &ControlInput,
        rng: &mut R,
    ) -> Result<()> {
        self.ensure_initialized()?;
        let noise = ProcessNoise::new(std_pos)?;
        let scale = self.config.turn_noise_scale;
        for particle in &mut self.particles {
            particle.propagate(control, delta_t, &noise, scale, rng);
        }
        Ok(())
    }
    /// Re-weight every particle against one frame of vehicle-frame observations.
    ///
    /// All previous weights and associations are discarded. See [`Particle::update_weight`] for the
    /// per-particle algorithm.
    ///
    /// # Errors
    /// - [`FilterError::NotInitialized`]
    /// - [`FilterError::InvalidSensorRange`] for a negative or NaN `sensor_range`.
    /// - [`FilterError::InvalidMeasurementStdDev`] unless both entries of `std_landmark` are
    ///   finite and positive.
    pub fn update_weights(
        &mut self,
        sensor_range: f64,
        std_landmark: [f64; 2],
        observations: &[Observation],
        map: &LandmarkMap,
    ) -> Result<()> {
        self.ensure_initialized()?;
        if sensor_range.is_nan() || sensor_range < 0.0 {
            return Err(FilterError::InvalidSensorRange(sensor_range));
        }
        let noise = LandmarkNoise::new(std_landmark)?;
        let mut starved = 0;
        for particle in &mut self.particles {
            if particle.update_weight(sensor_range, &noise, observations, map) == 0 {
                starved += 1;
            }
        }
        debug!(
            "Weighted {} particles against {} observations ({} matched nothing)",
            self.particles.len(),
            observations.len(),
            starved
        );
        Ok(())
    }
    /// Replace the population with `num_particles` draws (with replacement) proportional to weight.
    ///
    /// Drawn particles are full copies, including their weights and associations. When every weight
    /// is zero the draw is uniform.
    ///
    /// # Errors
    /// [`FilterError::NotInitialized`]
    pub fn resample<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        self.ensure_initialized()?;
        let weights = self.weights();
        let indices = self
            .config
            .resampling_strategy
            .draw(&weights, self.config.num_particles, rng);
        self.particles = indices.iter().map(|&i| self.particles[i].clone()).collect();
        Ok(())
    }
    /// Scale weights so they sum to one. Degenerate weights become uniform.
    pub fn normalize_weights(&mut self) {
        let sum: f64 = self.particles.iter().map(|p| p.weight).sum();
        if sum > 0.0 && sum.is_finite() {
            for particle in &mut self.particles {
                particle.weight /= sum;
            }
        } else {
            let uniform = 1.0 / self.particles.len() as f64;
            for particle in &mut self.particles {
                particle.weight = uniform;
            }
        }
    }
    /// Effective sample size `(sum w)^2 / sum w^2`; 0 when every weight is zero.
    pub fn effective_sample_size(&self) -> f64 {
        let sum: f64 = self.particles.iter().map(|p| p.weight).sum();
        let sum_of_squares: f64 = self.particles.iter().map(|p| p.weight * p.weight).sum();
        if sum_of_squares > 0.0 {
            sum * sum / sum_of_squares
        } else {
            0.0
        }
    }
    /// Particle with the largest weight (the first one on ties).
    pub fn best_particle(&self) -> Result<&Particle> {
        self.ensure_initialized()?;
        self.particles
            .iter()
            .fold(None::<&Particle>, |best, p| match best {
                Some(b) if b.weight >= p.weight => Some(b),
                _ => Some(p),
            })
            .ok_or(FilterError::NotInitialized)
    }
    /// Pose estimate according to the configured [`AveragingStrategy`].
    pub fn get_estimate(&self) -> Result<Pose> {
        self.ensure_initialized()?;
        let (mean, _) = self.config.averaging_strategy.estimate(&self.particles);
        Ok(Pose::new(mean[0], mean[1], mean[2]))
    }
    /// Covariance of (x, y, theta) according to the configured [`AveragingStrategy`].
    ///
    /// Zero for [`AveragingStrategy::HighestWeight`].
    pub fn get_certainty(&self) -> Result<Matrix3<f64>> {
        self.ensure_initialized()?;
        let (_, cov) = self.config.averaging_strategy.estimate(&self.particles);
        Ok(cov)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::Landmark;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::f64::consts::PI;

    fn initialized(n: usize, prior: Pose, std: [f64; 3], seed: u64) -> ParticleFilter {
        let mut pf = ParticleFilter::with_num_particles(n).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        pf.initialize(prior, std, &mut rng).unwrap();
        pf
    }

    fn line_map() -> LandmarkMap {
        LandmarkMap::new(vec![
            Landmark::new(1, 5.0, 0.0),
            Landmark::new(2, 10.0, 0.0),
            Landmark::new(3, 100.0, 0.0),
        ])
        .unwrap()
    }

    #[test]
    fn zero_particles_rejected() {
        assert_eq!(
            ParticleFilter::with_num_particles(0).unwrap_err(),
            FilterError::ZeroParticles
        );
    }
    #[test]
    fn operations_require_initialization() {
        let mut pf = ParticleFilter::with_num_particles(10).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let control = ControlInput::new(1.0, 0.0);
        assert_eq!(
            pf.predict(0.1, [0.0; 3], &control, &mut rng),
            Err(FilterError::NotInitialized)
        );
        assert_eq!(
            pf.update_weights(10.0, [0.3, 0.3], &[], &line_map()),
            Err(FilterError::NotInitialized)
        );
        assert_eq!(pf.resample(&mut rng), Err(FilterError::NotInitialized));
        assert!(pf.best_particle().is_err());
        assert!(pf.get_estimate().is_err());
    }
    #[test]
    fn initialize_only_once() {
        let mut pf = initialized(10, Pose::default(), [1.0, 1.0, 0.1], 3);
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(
            pf.initialize(Pose::default(), [1.0; 3], &mut rng),
            Err(FilterError::AlreadyInitialized)
        );
    }
    #[test]
    fn initialize_rejects_bad_std() {
        let mut pf = ParticleFilter::with_num_particles(10).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        assert!(matches!(
            pf.initialize(Pose::default(), [1.0, -1.0, 0.1], &mut rng),
            Err(FilterError::InvalidStdDev { name: "std[1]", .. })
        ));
        assert!(!pf.is_initialized());
    }
    #[test]
    fn initialize_samples_around_prior() {
        let prior = Pose::new(102.0, 65.0, 0.5);
        let pf = initialized(2000, prior, [2.0, 2.0, 0.05], 7);
        assert_eq!(pf.particles().len(), 2000);
        assert!(pf.weights().iter().all(|&w| w == 1.0));
        let (mean, cov) = AveragingStrategy::UnweightedAverage.estimate(pf.particles());
        assert_approx_eq!(mean[0], 102.0, 0.2);
        assert_approx_eq!(mean[1], 65.0, 0.2);
        assert_approx_eq!(mean[2], 0.5, 0.01);
        assert_approx_eq!(cov[(0, 0)].sqrt(), 2.0, 0.2);
        assert_approx_eq!(cov[(2, 2)].sqrt(), 0.05, 0.005);
    }
    #[test]
    fn initialize_with_zero_std_is_exact() {
        let pf = initialized(5, Pose::new(1.0, 2.0, 3.0), [0.0; 3], 7);
        for p in pf.particles() {
            assert_eq!(p.pose, Pose::new(1.0, 2.0, 3.0));
            assert!(p.associations.is_empty());
        }
    }
    #[test]
    fn predict_zero_yaw_zero_noise_is_exact() {
        let mut pf = initialized(3, Pose::new(0.0, 0.0, 0.0), [0.0; 3], 11);
        let mut rng = StdRng::seed_from_u64(11);
        pf.predict(1.0, [0.0; 3], &ControlInput::new(2.0, 0.0), &mut rng)
            .unwrap();
        for p in pf.particles() {
            assert_eq!(p.pose.x, 2.0);
            assert_eq!(p.pose.y, 0.0);
            assert_eq!(p.pose.theta, 0.0);
        }
    }
    #[test]
    fn predict_turning_zero_noise() {
        let mut pf = initialized(3, Pose::new(0.0, 0.0, 0.0), [0.0; 3], 11);
        let mut rng = StdRng::seed_from_u64(11);
        pf.predict(PI / 2.0, [0.0; 3], &ControlInput::new(1.0, 1.0), &mut rng)
            .unwrap();
        for p in pf.particles() {
            assert_approx_eq!(p.pose.x, 1.0, 1e-12);
            assert_approx_eq!(p.pose.y, 1.0, 1e-12);
            assert_approx_eq!(p.pose.theta, PI / 2.0, 1e-12);
        }
    }
    #[test]
    fn predict_rejects_bad_noise() {
        let mut pf = initialized(3, Pose::default(), [0.0; 3], 11);
        let mut rng = StdRng::seed_from_u64(11);
        assert!(matches!(
            pf.predict(0.1, [0.1, 0.1, f64::NAN], &ControlInput::new(1.0, 0.0), &mut rng),
            Err(FilterError::InvalidStdDev { name: "std_pos[2]", .. })
        ));
    }
    /// RMS deviation of x and theta from the noise-free pose after one prediction.
    fn prediction_spread(control: ControlInput, std_pos: [f64; 3], n: usize) -> (f64, f64) {
        let mut pf = initialized(n, Pose::default(), [0.0; 3], 5);
        let mut rng = StdRng::seed_from_u64(6);
        let mut exact = Pose::default();
        exact.forward(&control, 1.0);
        pf.predict(1.0, std_pos, &control, &mut rng).unwrap();
        let rms = |values: Vec<f64>| {
            (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
        };
        let dx = pf.particles().iter().map(|p| p.pose.x - exact.x).collect();
        let dtheta = pf.particles().iter().map(|p| p.pose.theta - exact.theta).collect();
        (rms(dx), rms(dtheta))
    }
    #[test]
    fn turning_inflates_positional_noise_only() {
        let std_pos = [0.5, 0.5, 0.1];
        let (straight_xy, straight_theta) = prediction_spread(ControlInput::new(1.0, 0.0), std_pos, 4000);
        let (turning_xy, turning_theta) = prediction_spread(ControlInput::new(1.0, 0.3), std_pos, 4000);
        assert_approx_eq!(straight_xy, 0.5, 0.05);
        assert_approx_eq!(turning_xy, 0.75, 0.075);
        assert_approx_eq!(straight_theta, 0.1, 0.01);
        assert_approx_eq!(turning_theta, 0.1, 0.01);
    }
    #[test]
    fn seeded_runs_are_reproducible() {
        let run = || {
            let mut rng = StdRng::seed_from_u64(99);
            let mut pf = ParticleFilter::with_num_particles(50).unwrap();
            pf.initialize(Pose::new(1.0, 1.0, 0.2), [0.3, 0.3, 0.01], &mut rng)
                .unwrap();
            pf.predict(0.1, [0.3, 0.3, 0.01], &ControlInput::new(5.0, 0.1), &mut rng)
                .unwrap();
            pf.update_weights(50.0, [0.3, 0.3], &[Observation::new(4.0, -1.0)], &line_map())
                .unwrap();
            pf.resample(&mut rng).unwrap();
            pf.particles().to_vec()
        };
        assert_eq!(run(), run());
    }
    #[test]
    fn weight_matches_closed_form() {
        let mut pf = initialized(1, Pose::new(0.0, 0.0, 0.0), [0.0; 3], 1);
        let observations = [Observation::new(5.1, 0.2), Observation::new(9.8, 0.0)];
        pf.update_weights(50.0, [0.3, 0.3], &observations, &line_map())
            .unwrap();
        let p = &pf.particles()[0];
        let density = |dx: f64, dy: f64| {
            (-(dx * dx / (2.0 * 0.09) + dy * dy / (2.0 * 0.09))).exp() / (2.0 * PI * 0.09)
        };
        let expected = density(0.1, 0.2) * density(-0.2, 0.0);
        assert_approx_eq!(p.weight, expected, 1e-9);
        assert_eq!(p.associations, vec![1, 2]);
        assert_eq!(p.sense_x.len(), 2);
        assert_eq!(p.sense_y.len(), 2);
        assert_eq!(pf.weights(), vec![p.weight]);
    }
    #[test]
    fn range_gate_uses_particle_position() {
        let mut pf = initialized(1, Pose::new(0.0, 0.0, 0.0), [0.0; 3], 1);
        // nearest landmark to the transformed observation is #3 at 100 m, beyond range
        let observations = [Observation::new(99.5, 0.0), Observation::new(5.0, 0.0)];
        pf.update_weights(20.0, [0.3, 0.3], &observations, &line_map())
            .unwrap();
        let p = &pf.particles()[0];
        assert_eq!(p.associations, vec![1]);
        assert!(!p.associations.contains(&3));
        assert_approx_eq!(p.weight, 1.0 / (2.0 * PI * 0.09), 1e-9);
    }
    #[test]
    fn range_gate_ignores_transformed_position() {
        // observation lands right on landmark #2 but the particle is far from it
        let mut pf = initialized(1, Pose::new(-50.0, 0.0, 0.0), [0.0; 3], 1);
        pf.update_weights(20.0, [0.3, 0.3], &[Observation::new(60.0, 0.0)], &line_map())
            .unwrap();
        let p = &pf.particles()[0];
        assert!(p.associations.is_empty());
        assert_eq!(p.weight, 0.0);
    }
    #[test]
    fn no_matches_means_zero_weight() {
        let mut pf = initialized(4, Pose::new(0.0, 0.0, 0.0), [0.0; 3], 1);
        pf.update_weights(1.0, [0.3, 0.3], &[Observation::new(5.0, 0.0)], &line_map())
            .unwrap();
        assert!(pf.weights().iter().all(|&w| w == 0.0));
        pf.update_weights(1.0, [0.3, 0.3], &[], &line_map()).unwrap();
        assert!(pf.weights().iter().all(|&w| w == 0.0));
    }
    #[test]
    fn matched_weight_of_exactly_one_is_kept() {
        // density at the peak equals 1 when 2 pi std_x std_y == 1
        let std = (1.0 / (2.0 * PI)).sqrt();
        let mut pf = initialized(1, Pose::new(0.0, 0.0, 0.0), [0.0; 3], 1);
        pf.update_weights(50.0, [std, std], &[Observation::new(5.0, 0.0)], &line_map())
            .unwrap();
        let p = &pf.particles()[0];
        assert_eq!(p.associations, vec![1]);
        assert_approx_eq!(p.weight, 1.0, 1e-12);
    }
    #[test]
    fn associations_are_replaced_not_appended() {
        let mut pf = initialized(1, Pose::new(0.0, 0.0, 0.0), [0.0; 3], 1);
        let map = line_map();
        let both = [Observation::new(5.0, 0.0), Observation::new(10.0, 0.0)];
        pf.update_weights(50.0, [0.3, 0.3], &both, &map).unwrap();
        assert_eq!(pf.particles()[0].associations.len(), 2);
        pf.update_weights(50.0, [0.3, 0.3], &[Observation::new(10.0, 0.0)], &map)
            .unwrap();
        let p = &pf.particles()[0];
        assert_eq!(p.associations, vec![2]);
        assert_eq!(p.sense_x, vec![10.0]);
        assert_eq!(p.sense_y, vec![0.0]);
    }
    #[test]
    fn update_rejects_bad_inputs() {
        let mut pf = initialized(1, Pose::default(), [0.0; 3], 1);
        assert_eq!(
            pf.update_weights(-1.0, [0.3, 0.3], &[], &line_map()),
            Err(FilterError::InvalidSensorRange(-1.0))
        );
        assert!(matches!(
            pf.update_weights(10.0, [0.0, 0.3], &[], &line_map()),
            Err(FilterError::InvalidMeasurementStdDev { .. })
        ));
    }
    #[test]
    fn weights_are_non_negative_and_arrays_parallel() {
        let mut rng = StdRng::seed_from_u64(21);
        let mut pf = initialized(300, Pose::new(2.0, 0.0, 0.0), [3.0, 3.0, 0.3], 21);
        pf.predict(0.1, [0.3, 0.3, 0.01], &ControlInput::new(3.0, 0.2), &mut rng)
            .unwrap();
        let observations = [
            Observation::new(3.0, 0.0),
            Observation::new(8.0, 0.1),
            Observation::new(-2.0, 4.0),
        ];
        pf.update_weights(12.0, [0.3, 0.3], &observations, &line_map())
            .unwrap();
        for p in pf.particles() {
            assert!(p.weight >= 0.0);
            assert_eq!(p.associations.len(), p.sense_x.len());
            assert_eq!(p.sense_x.len(), p.sense_y.len());
        }
    }
    #[test]
    fn diagnostic_strings() {
        let mut p = Particle::new(Pose::default(), 1.0);
        assert_eq!(p.get_associations(), "");
        p.set_associations(vec![3, 17, 4], vec![1.5, -2.0, 0.25], vec![0.0, 8.0, 3.125]);
        assert_eq!(p.get_associations(), "3 17 4");
        assert_eq!(p.get_sense_x(), "1.5 -2 0.25");
        assert_eq!(p.get_sense_y(), "0 8 3.125");
    }
    #[test]
    fn resampling_keeps_cardinality() {
        for strategy in [
            ResamplingStrategy::Multinomial,
            ResamplingStrategy::Systematic,
            ResamplingStrategy::Stratified,
            ResamplingStrategy::Residual,
        ] {
            let mut pf = ParticleFilter::new(ParticleFilterConfig {
                num_particles: 37,
                resampling_strategy: strategy,
                ..ParticleFilterConfig::default()
            })
            .unwrap();
            let mut rng = StdRng::seed_from_u64(8);
            pf.initialize(Pose::default(), [1.0, 1.0, 0.1], &mut rng)
                .unwrap();
            let weights: Vec<f64> = (0..37).map(|i| (i % 5) as f64 * 0.37).collect();
            pf.set_weights(&weights).unwrap();
            pf.resample(&mut rng).unwrap();
            assert_eq!(pf.particles().len(), 37, "{strategy:?}");
            assert!(pf.weights().iter().all(|&w| w > 0.0), "{strategy:?}");
        }
    }
    #[test]
    fn multinomial_resampling_is_proportional() {
        let mut rng = StdRng::seed_from_u64(2024);
        let indices = ResamplingStrategy::Multinomial.draw(&[3.0, 1.0], 10_000, &mut rng);
        assert_eq!(indices.len(), 10_000);
        let heavy = indices.iter().filter(|&&i| i == 0).count() as f64 / 10_000.0;
        assert_approx_eq!(heavy, 0.75, 0.02);
    }
    #[test]
    fn resample_two_particles_proportionally() {
        let mut pf = initialized(2, Pose::default(), [0.0; 3], 1);
        pf.set_weights(&[3.0, 1.0]).unwrap();
        let mut rng = StdRng::seed_from_u64(77);
        let mut heavy = 0usize;
        for _ in 0..5000 {
            let mut trial = pf.clone();
            trial.resample(&mut rng).unwrap();
            heavy += trial.weights().iter().filter(|&&w| w == 3.0).count();
        }
        assert_approx_eq!(heavy as f64 / 10_000.0, 0.75, 0.02);
    }
    #[test]
    fn low_variance_strategies_are_proportional() {
        let weights = [0.5, 0.25, 0.125, 0.125];
        for strategy in [
            ResamplingStrategy::Systematic,
            ResamplingStrategy::Stratified,
            ResamplingStrategy::Residual,
        ] {
            let mut rng = StdRng::seed_from_u64(4);
            let indices = strategy.draw(&weights, 8000, &mut rng);
            let mut counts = [0usize; 4];
            for i in indices {
                counts[i] += 1;
            }
            for (count, w) in counts.iter().zip(weights) {
                assert_approx_eq!(*count as f64 / 8000.0, w, 0.01);
            }
        }
    }
    #[test]
    fn all_zero_weights_resample_uniformly() {
        let mut pf = initialized(20, Pose::default(), [1.0, 1.0, 0.1], 9);
        let mut rng = StdRng::seed_from_u64(9);
        pf.update_weights(0.0, [0.3, 0.3], &[Observation::new(1.0, 1.0)], &line_map())
            .unwrap();
        assert!(pf.weights().iter().all(|&w| w == 0.0));
        pf.resample(&mut rng).unwrap();
        assert_eq!(pf.particles().len(), 20);

        let mut rng = StdRng::seed_from_u64(10);
        let indices = ResamplingStrategy::Systematic.draw(&[0.0; 4], 4000, &mut rng);
        for k in 0..4 {
            let share = indices.iter().filter(|&&i| i == k).count() as f64 / 4000.0;
            assert_approx_eq!(share, 0.25, 0.04);
        }
    }
    #[test]
    fn resampled_particles_keep_associations() {
        let mut pf = initialized(10, Pose::new(0.0, 0.0, 0.0), [0.0; 3], 1);
        pf.update_weights(50.0, [0.3, 0.3], &[Observation::new(5.0, 0.0)], &line_map())
            .unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        pf.resample(&mut rng).unwrap();
        for p in pf.particles() {
            assert_eq!(p.get_associations(), "1");
            assert_eq!(p.get_sense_x(), "5");
        }
    }
    #[test]
    fn estimates_and_effective_sample_size() {
        let mut pf = initialized(3, Pose::default(), [0.0; 3], 1);
        assert_approx_eq!(pf.effective_sample_size(), 3.0, 1e-12);
        pf.particles[0].pose = Pose::new(0.0, 0.0, 0.0);
        pf.particles[1].pose = Pose::new(2.0, 4.0, 0.2);
        pf.particles[2].pose = Pose::new(4.0, 8.0, 0.4);
        pf.set_weights(&[1.0, 2.0, 1.0]).unwrap();

        let best = pf.best_particle().unwrap();
        assert_eq!(best.pose, Pose::new(2.0, 4.0, 0.2));
        assert_eq!(pf.get_estimate().unwrap(), best.pose);
        assert_eq!(pf.get_certainty().unwrap(), Matrix3::zeros());

        let (mean, cov) = AveragingStrategy::WeightedAverage.estimate(pf.particles());
        assert_approx_eq!(mean[0], 2.0, 1e-12);
        assert_approx_eq!(mean[1], 4.0, 1e-12);
        assert_approx_eq!(mean[2], 0.2, 1e-12);
        assert_approx_eq!(cov[(0, 0)], 2.0, 1e-12);
        assert_approx_eq!(cov[(0, 1)], 4.0, 1e-12);
        assert_approx_eq!(pf.effective_sample_size(), 16.0 / 6.0, 1e-12);

        pf.normalize_weights();
        assert_approx_eq!(pf.weights().iter().sum::<f64>(), 1.0, 1e-12);
        pf.set_weights(&[0.0; 3]).unwrap();
        assert_eq!(pf.effective_sample_size(), 0.0);
        pf.normalize_weights();
        assert_approx_eq!(pf.weights()[1], 1.0 / 3.0, 1e-12);
        assert_eq!(
            pf.set_weights(&[1.0]),
            Err(FilterError::WeightCountMismatch {
                expected: 3,
                actual: 1
            })
        );
    }
    #[test]
    fn config_serde_defaults() {
        let config: ParticleFilterConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ParticleFilterConfig::default());
        let config: ParticleFilterConfig =
            serde_json::from_str(r#"{"num_particles": 10, "resampling_strategy": "systematic"}"#)
                .unwrap();
        assert_eq!(config.num_particles, 10);
        assert_eq!(config.resampling_strategy, ResamplingStrategy::Systematic);
        assert_eq!(config.turn_noise_scale, TURN_NOISE_SCALE);
    }
}
