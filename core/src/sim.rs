//! Synthetic scenarios and a closed-loop simulation harness.
//!
//! This module provides:
//! - [`SimulationConfig`]: every knob of a run, readable from and writable to JSON, YAML, or TOML
//! - [`Scenario`]: a random landmark map, a ground-truth trajectory, the control inputs that
//!   produced it, and the noisy vehicle-frame observations seen along the way
//! - [`run_closed_loop`]: drives a [`ParticleFilter`] through a scenario (initialize once, then
//!   predict / update / resample per frame) and records a [`StepResult`] per frame
//! - [`SimulationResult`]: error statistics and CSV export
use crate::map::{Landmark, LandmarkMap};
use crate::measurements::Observation;
use crate::particle::{ParticleFilter, ParticleFilterConfig, ProcessNoise};
use crate::{ControlInput, Pose, Result};

use log::{debug, info};
use nalgebra::Vector2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

fn default_seed() -> u64 {
    42
}

/// Parameters of a closed-loop simulation run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Random number generator seed; the same seed reproduces a run exactly
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Number of observation frames
    pub num_steps: usize,
    /// Time between frames in seconds
    pub delta_t: f64,
    /// Maximum landmark detection range in meters
    pub sensor_range: f64,
    /// Standard deviation of the coarse prior fix `[x (m), y (m), theta (rad)]`
    pub sigma_pos: [f64; 3],
    /// Landmark measurement noise `[x (m), y (m)]`
    pub sigma_landmark: [f64; 2],
    /// Process noise handed to the filter's prediction step `[x (m), y (m), theta (rad)]`
    pub process_noise: [f64; 3],
    /// Number of landmarks scattered over the map
    pub num_landmarks: usize,
    /// Half-width of the square area the landmarks are scattered over, centred on the start pose
    pub map_half_width: f64,
    /// Forward speed of the vehicle (m/s)
    pub velocity: f64,
    /// Peak yaw rate of the sinusoidal steering profile (rad/s)
    pub yaw_rate_amplitude: f64,
    /// Period of the steering profile (s)
    pub yaw_rate_period: f64,
    /// Control noise applied to the recorded velocity and yaw rate `[m/s, rad/s]`
    #[serde(default)]
    pub control_noise: [f64; 2],
    /// Starting pose of the vehicle
    #[serde(default)]
    pub start: Pose,
    #[serde(default)]
    pub filter: ParticleFilterConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            seed: default_seed(),
            num_steps: 200,
            delta_t: 0.1,
            sensor_range: 50.0,
            sigma_pos: [0.3, 0.3, 0.01],
            sigma_landmark: [0.3, 0.3],
            process_noise: [0.3, 0.3, 0.01],
            num_landmarks: 42,
            map_half_width: 150.0,
            velocity: 10.0,
            yaw_rate_amplitude: 0.2,
            yaw_rate_period: 20.0,
            control_noise: [0.0, 0.0],
            start: Pose::default(),
            filter: ParticleFilterConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }
    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }
    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension_of(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension_of(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
    /// Yaw rate commanded at time `t` by the sinusoidal steering profile.
    pub fn yaw_rate_at(&self, t: f64) -> f64 {
        if self.yaw_rate_period > 0.0 {
            self.yaw_rate_amplitude * (2.0 * PI * t / self.yaw_rate_period).sin()
        } else {
            self.yaw_rate_amplitude
        }
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

/// Everything the filter consumes during a run, plus the ground truth it is scored against.
#[derive(Clone, Debug)]
pub struct Scenario {
    pub map: LandmarkMap,
    /// True pose at every frame
    pub ground_truth: Vec<Pose>,
    /// Control input reported between frame `i` and frame `i + 1`
    pub controls: Vec<ControlInput>,
    /// Vehicle-frame observations available at every frame
    pub observations: Vec<Vec<Observation>>,
}

impl Scenario {
    /// Generate a random scenario from `config`.
    ///
    /// The vehicle starts at `config.start` and follows the sinusoidal steering profile exactly;
    /// the controls handed to the filter optionally carry `config.control_noise`. At every frame
    /// each landmark within `sensor_range` of the true pose is reported in the vehicle frame with
    /// `sigma_landmark` Gaussian noise.
    pub fn generate<R: Rng + ?Sized>(config: &SimulationConfig, rng: &mut R) -> Result<Scenario> {
        let map = random_map(config, rng)?;
        let velocity_noise = ProcessNoise::new([
            config.control_noise[0],
            config.control_noise[1],
            0.0,
        ])?;
        let landmark_noise = ProcessNoise::new([
            config.sigma_landmark[0],
            config.sigma_landmark[1],
            0.0,
        ])?;

        let mut ground_truth = Vec::with_capacity(config.num_steps);
        let mut controls = Vec::with_capacity(config.num_steps.saturating_sub(1));
        let mut observations = Vec::with_capacity(config.num_steps);
        let mut pose = config.start;
        for step in 0..config.num_steps {
            if step > 0 {
                let t = (step - 1) as f64 * config.delta_t;
                let truth = ControlInput::new(config.velocity, config.yaw_rate_at(t));
                pose.forward(&truth, config.delta_t);
                let (dv, dw) = velocity_noise.sample_xy(rng);
                controls.push(ControlInput::new(truth.velocity + dv, truth.yaw_rate + dw));
            }
            ground_truth.push(pose);
            observations.push(observe(&pose, &map, config.sensor_range, &landmark_noise, rng));
        }
        Ok(Scenario {
            map,
            ground_truth,
            controls,
            observations,
        })
    }
}

fn random_map<R: Rng + ?Sized>(config: &SimulationConfig, rng: &mut R) -> Result<LandmarkMap> {
    let half = config.map_half_width.abs();
    let landmarks = (0..config.num_landmarks)
        .map(|i| {
            Landmark::new(
                i as i32 + 1,
                config.start.x + rng.random_range(-half..=half),
                config.start.y + rng.random_range(-half..=half),
            )
        })
        .collect();
    LandmarkMap::new(landmarks)
}

/// Noisy vehicle-frame observations of every landmark within range of `pose`.
pub fn observe<R: Rng + ?Sized>(
    pose: &Pose,
    map: &LandmarkMap,
    sensor_range: f64,
    noise: &ProcessNoise,
    rng: &mut R,
) -> Vec<Observation> {
    let inverse = pose.rotation().inverse();
    map.within_range(pose.x, pose.y, sensor_range)
        .map(|landmark| {
            let body = inverse * (landmark.position() - pose.position());
            let (nx, ny) = noise.sample_xy(rng);
            let offset = body + Vector2::new(nx, ny);
            Observation::new(offset.x, offset.y)
        })
        .collect()
}

/// Per-frame record of a closed-loop run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: usize,
    pub true_x: f64,
    pub true_y: f64,
    pub true_theta: f64,
    pub best_x: f64,
    pub best_y: f64,
    pub best_theta: f64,
    pub mean_x: f64,
    pub mean_y: f64,
    pub mean_theta: f64,
    /// Absolute x error of the best particle
    pub error_x: f64,
    /// Absolute y error of the best particle
    pub error_y: f64,
    /// Absolute heading error of the best particle, folded into [0, pi]
    pub error_theta: f64,
    pub effective_sample_size: f64,
    /// Observations available in this frame
    pub num_observations: usize,
    /// Observations matched by the best particle
    pub num_associations: usize,
    pub associations: String,
}

/// Absolute heading difference folded into [0, pi].
pub fn heading_error(estimated: f64, truth: f64) -> f64 {
    let error = (estimated - truth).abs() % (2.0 * PI);
    if error > PI { 2.0 * PI - error } else { error }
}

/// Collected results of a closed-loop run.
#[derive(Clone, Debug, Default)]
pub struct SimulationResult {
    pub steps: Vec<StepResult>,
}

impl SimulationResult {
    /// Writes one row per frame to a CSV file.
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path).map_err(io::Error::other)?;
        for step in &self.steps {
            writer.serialize(step).map_err(io::Error::other)?;
        }
        writer.flush()
    }
    /// Reads results previously written by [`SimulationResult::to_csv`].
    pub fn from_csv<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut reader = csv::Reader::from_path(path).map_err(io::Error::other)?;
        let mut steps = Vec::new();
        for record in reader.deserialize() {
            steps.push(record.map_err(io::Error::other)?);
        }
        Ok(SimulationResult { steps })
    }
    /// Mean Euclidean position error of the best particle.
    pub fn mean_position_error(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        self.steps
            .iter()
            .map(|s| s.error_x.hypot(s.error_y))
            .sum::<f64>()
            / self.steps.len() as f64
    }
    /// Largest Euclidean position error of the best particle.
    pub fn max_position_error(&self) -> f64 {
        self.steps
            .iter()
            .map(|s| s.error_x.hypot(s.error_y))
            .fold(0.0, f64::max)
    }
    /// Largest heading error of the best particle.
    pub fn max_heading_error(&self) -> f64 {
        self.steps.iter().map(|s| s.error_theta).fold(0.0, f64::max)
    }
    /// `true` when every frame stays within the given per-axis and heading error bounds.
    pub fn within_tolerance(&self, max_translation_error: f64, max_heading_error: f64) -> bool {
        self.steps.iter().all(|s| {
            s.error_x <= max_translation_error
                && s.error_y <= max_translation_error
                && s.error_theta <= max_heading_error
        })
    }
}

/// Run the particle filter through a scenario.
///
/// Frame 0 initializes the filter from a noisy fix of the true start pose. Every later frame
/// predicts with the previous control input. Every frame then weights against its observations
/// and resamples. The recorded estimate is taken after weighting and before resampling.
pub fn run_closed_loop<R: Rng + ?Sized>(
    config: &SimulationConfig,
    scenario: &Scenario,
    rng: &mut R,
) -> Result<SimulationResult> {
    let mut pf = ParticleFilter::new(config.filter.clone())?;
    let mut result = SimulationResult {
        steps: Vec::with_capacity(scenario.ground_truth.len()),
    };
    for (step, truth) in scenario.ground_truth.iter().enumerate() {
        if step == 0 {
            let fix = noisy_fix(truth, config.sigma_pos, rng)?;
            pf.initialize(fix, config.sigma_pos, rng)?;
        } else {
            pf.predict(
                config.delta_t,
                config.process_noise,
                &scenario.controls[step - 1],
                rng,
            )?;
        }
        let observations = &scenario.observations[step];
        pf.update_weights(
            config.sensor_range,
            config.sigma_landmark,
            observations,
            &scenario.map,
        )?;

        let best = pf.best_particle()?.clone();
        let mean = pf.get_estimate()?;
        let record = StepResult {
            step,
            true_x: truth.x,
            true_y: truth.y,
            true_theta: truth.theta,
            best_x: best.pose.x,
            best_y: best.pose.y,
            best_theta: best.pose.theta,
            mean_x: mean.x,
            mean_y: mean.y,
            mean_theta: mean.theta,
            error_x: (best.pose.x - truth.x).abs(),
            error_y: (best.pose.y - truth.y).abs(),
            error_theta: heading_error(best.pose.theta, truth.theta),
            effective_sample_size: pf.effective_sample_size(),
            num_observations: observations.len(),
            num_associations: best.associations.len(),
            associations: best.get_associations(),
        };
        debug!(
            "step {}: error ({:.3}, {:.3}, {:.4}), n_eff {:.1}",
            step, record.error_x, record.error_y, record.error_theta, record.effective_sample_size
        );
        result.steps.push(record);

        pf.resample(rng)?;
    }
    info!(
        "Closed-loop run finished: {} steps, mean position error {:.3} m, max heading error {:.4} rad",
        result.steps.len(),
        result.mean_position_error(),
        result.max_heading_error()
    );
    Ok(result)
}

fn noisy_fix<R: Rng + ?Sized>(truth: &Pose, sigma_pos: [f64; 3], rng: &mut R) -> Result<Pose> {
    let noise = ProcessNoise::new(sigma_pos)?;
    let (dx, dy) = noise.sample_xy(rng);
    Ok(Pose::new(truth.x + dx, truth.y + dy, truth.theta + noise.sample_theta(rng)))
}

/// Generate a scenario and run the filter through it, seeded from `config.seed`.
pub fn simulate(config: &SimulationConfig) -> Result<(Scenario, SimulationResult)> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let scenario = Scenario::generate(config, &mut rng)?;
    info!(
        "Generated scenario: {} landmarks, {} frames",
        scenario.map.len(),
        scenario.ground_truth.len()
    );
    let result = run_closed_loop(config, &scenario, &mut rng)?;
    Ok((scenario, result))
}

/// Ground-truth dead reckoning from the (possibly noisy) controls alone, for comparison.
pub fn dead_reckoning(config: &SimulationConfig, scenario: &Scenario) -> Vec<Pose> {
    let mut pose = scenario
        .ground_truth
        .first()
        .copied()
        .unwrap_or(config.start);
    let mut poses = vec![pose];
    for control in &scenario.controls {
        pose.forward(control, config.delta_t);
        poses.push(pose);
    }
    poses
}
