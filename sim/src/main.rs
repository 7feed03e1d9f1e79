//! PF SIM: closed-loop simulation tool for the landmark particle filter.
//!
//! A random landmark map and a vehicle trajectory are generated, the vehicle's sensor reports noisy
//! landmark offsets at every frame, and the particle filter localizes the vehicle from those
//! reports and the (noisy) control inputs. One CSV row is written per frame.
//!
//! Simulations can be configured either by:
//!   1. Loading all parameters from a configuration file (TOML/JSON/YAML)
//!   2. Specifying parameters via command-line flags

mod common;

use clap::{Args, Parser, Subcommand};
use common::{ensure_parent_dir, init_logger, validate_config_path};
use log::{error, info, warn};
use mcl::particle::{AveragingStrategy, ParticleFilterConfig, ResamplingStrategy};
use mcl::sim::{SimulationConfig, SimulationResult, simulate};
use mcl::Pose;
use std::error::Error;
use std::path::{Path, PathBuf};

const LONG_ABOUT: &str = "PF SIM: closed-loop simulation tool for a landmark-based particle filter.

A random landmark map and a vehicle trajectory are generated. At every frame the vehicle reports
noisy vehicle-frame offsets of the landmarks within sensor range, and the particle filter runs one
predict / update / resample cycle. The per-frame ground truth, estimates, errors and effective
sample size are written to a CSV file.

Parameters come either from command-line flags (`run`) or from a TOML/JSON/YAML file (`config`).
`template` writes a configuration file with the default parameters.";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Closed-loop simulation tool for a landmark particle filter.", long_about = LONG_ABOUT)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(
        name = "run",
        about = "Run a simulation configured from command-line flags"
    )]
    Run(RunArgs),
    #[command(
        name = "config",
        about = "Run a simulation configured from a TOML/JSON/YAML file"
    )]
    Config(ConfigArgs),
    #[command(
        name = "template",
        about = "Write a configuration file holding the default parameters"
    )]
    Template(TemplateArgs),
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    #[command(flatten)]
    scenario: ScenarioArgs,
    #[command(flatten)]
    filter: FilterArgs,
    /// Output CSV file path
    #[arg(short, long, value_parser)]
    output: PathBuf,
}

#[derive(Args, Clone, Debug)]
struct ConfigArgs {
    /// Configuration file (TOML/JSON/YAML)
    file: PathBuf,
    /// Output CSV file path
    #[arg(short, long, value_parser)]
    output: PathBuf,
}

#[derive(Args, Clone, Debug)]
struct TemplateArgs {
    /// Where to write the template (.toml, .json, .yaml or .yml)
    file: PathBuf,
}

/// Scenario generation parameters
#[derive(Args, Clone, Debug)]
struct ScenarioArgs {
    /// Random number generator seed
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Number of observation frames
    #[arg(long, default_value_t = 200)]
    steps: usize,
    /// Time between frames (s)
    #[arg(long, default_value_t = 0.1)]
    delta_t: f64,
    /// Sensor range (m)
    #[arg(long, default_value_t = 50.0)]
    sensor_range: f64,
    /// Standard deviation of the initial fix: x (m), y (m), theta (rad)
    #[arg(long, value_delimiter = ',', default_values_t = [0.3, 0.3, 0.01])]
    sigma_pos: Vec<f64>,
    /// Landmark measurement noise: x (m), y (m)
    #[arg(long, value_delimiter = ',', default_values_t = [0.3, 0.3])]
    sigma_landmark: Vec<f64>,
    /// Process noise used by the filter's prediction: x (m), y (m), theta (rad)
    #[arg(long, value_delimiter = ',', default_values_t = [0.3, 0.3, 0.01])]
    process_noise: Vec<f64>,
    /// Noise on the reported controls: velocity (m/s), yaw rate (rad/s)
    #[arg(long, value_delimiter = ',', default_values_t = [0.0, 0.0])]
    control_noise: Vec<f64>,
    /// Number of landmarks in the map
    #[arg(long, default_value_t = 42)]
    landmarks: usize,
    /// Half-width of the square landmark area (m)
    #[arg(long, default_value_t = 150.0)]
    map_half_width: f64,
    /// Vehicle speed (m/s)
    #[arg(long, default_value_t = 10.0)]
    velocity: f64,
    /// Peak yaw rate of the steering profile (rad/s)
    #[arg(long, default_value_t = 0.2)]
    yaw_rate: f64,
    /// Period of the steering profile (s)
    #[arg(long, default_value_t = 20.0)]
    yaw_rate_period: f64,
}

/// Particle filter parameters
#[derive(Args, Clone, Debug)]
struct FilterArgs {
    /// Number of particles
    #[arg(long, default_value_t = mcl::particle::DEFAULT_NUM_PARTICLES)]
    particles: usize,
    /// Positional noise multiplier while turning
    #[arg(long, default_value_t = mcl::particle::TURN_NOISE_SCALE)]
    turn_noise_scale: f64,
    /// Resampling strategy
    #[arg(long, value_enum, default_value_t = ResamplingStrategy::Multinomial)]
    resampling: ResamplingStrategy,
    /// Strategy for the mean pose estimate
    #[arg(long, value_enum, default_value_t = AveragingStrategy::HighestWeight)]
    averaging: AveragingStrategy,
}

impl TryFrom<&RunArgs> for SimulationConfig {
    type Error = Box<dyn Error>;
    fn try_from(args: &RunArgs) -> Result<Self, Self::Error> {
        let s = &args.scenario;
        Ok(SimulationConfig {
            seed: s.seed,
            num_steps: s.steps,
            delta_t: s.delta_t,
            sensor_range: s.sensor_range,
            sigma_pos: fixed("--sigma-pos", &s.sigma_pos)?,
            sigma_landmark: fixed("--sigma-landmark", &s.sigma_landmark)?,
            process_noise: fixed("--process-noise", &s.process_noise)?,
            num_landmarks: s.landmarks,
            map_half_width: s.map_half_width,
            velocity: s.velocity,
            yaw_rate_amplitude: s.yaw_rate,
            yaw_rate_period: s.yaw_rate_period,
            control_noise: fixed("--control-noise", &s.control_noise)?,
            start: Pose::default(),
            filter: ParticleFilterConfig {
                num_particles: args.filter.particles,
                turn_noise_scale: args.filter.turn_noise_scale,
                resampling_strategy: args.filter.resampling,
                averaging_strategy: args.filter.averaging,
            },
        })
    }
}

/// Comma separated flag values into a fixed-size array.
fn fixed<const N: usize>(flag: &str, values: &[f64]) -> Result<[f64; N], Box<dyn Error>> {
    <[f64; N]>::try_from(values)
        .map_err(|_| format!("{} expects {} values, got {}", flag, N, values.len()).into())
}

fn run(config: &SimulationConfig, output: &Path) -> Result<(), Box<dyn Error>> {
    info!(
        "Simulating {} frames with {} particles ({:?} resampling), seed {}",
        config.num_steps, config.filter.num_particles, config.filter.resampling_strategy, config.seed
    );
    let (_, result) = simulate(config)?;
    report(&result);
    ensure_parent_dir(output)?;
    result.to_csv(output)?;
    info!("Results written to {}", output.display());
    Ok(())
}

fn report(result: &SimulationResult) {
    info!(
        "Position error: mean {:.3} m, max {:.3} m; max heading error {:.4} rad",
        result.mean_position_error(),
        result.max_position_error(),
        result.max_heading_error()
    );
    let starved = result
        .steps
        .iter()
        .filter(|s| s.num_associations == 0)
        .count();
    if starved > 0 {
        warn!("{} frames had no matched observations", starved);
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    let outcome = match &cli.command {
        Command::Run(args) => {
            SimulationConfig::try_from(args).and_then(|config| run(&config, &args.output))
        }
        Command::Config(args) => validate_config_path(&args.file).and_then(|_| {
            info!("Loading configuration from {}", args.file.display());
            let config = SimulationConfig::from_file(&args.file)?;
            run(&config, &args.output)
        }),
        Command::Template(args) => {
            ensure_parent_dir(&args.file).and_then(|_| {
                SimulationConfig::default().to_file(&args.file)?;
                info!("Template configuration written to {}", args.file.display());
                Ok(())
            })
        }
    };
    if let Err(e) = &outcome {
        error!("{}", e);
    }
    outcome
}
