use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tank_actuators::backend::{BackendKind, SelectionPolicy};
use tank_actuators::config::{DEFAULT_SPEED, DEFAULT_TURRET_SPEED, PinMap};
use tank_actuators::{Result, TankController};

/// Run one tank motion and release the hardware
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Pin map (JSON)
    #[arg(short, long, default_value = "config/motors.json")]
    config: PathBuf,

    /// GPIO provider to use
    #[arg(short, long, value_enum, default_value_t = BackendArg::Auto)]
    backend: BackendArg,

    /// Fail instead of falling back to simulation
    #[arg(long)]
    no_sim: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Auto,
    Modern,
    Legacy,
    Sim,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive forward
    Forward(DriveArgs),
    /// Drive backward
    Backward(DriveArgs),
    /// Pivot left
    Left(DriveArgs),
    /// Pivot right
    Right(DriveArgs),
    /// Pan the camera turret (positive = forward)
    Pan {
        #[arg(allow_hyphen_values = true)]
        degrees: f64,
        /// Steps per second
        #[arg(short, long, default_value_t = DEFAULT_TURRET_SPEED)]
        speed: f64,
    },
    /// Stop every wheel
    Stop,
}

#[derive(clap::Args, Debug)]
struct DriveArgs {
    /// Duty cycle, 0-100
    #[arg(short, long, default_value_t = DEFAULT_SPEED, value_parser = clap::value_parser!(u8).range(0..=100))]
    speed: u8,

    /// Seconds to drive before stopping
    #[arg(short, long, default_value_t = 1.0)]
    duration: f64,
}

impl DriveArgs {
    fn duration(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.duration).ok()
    }
}

fn policy(args: &Args) -> SelectionPolicy {
    let preferred = match args.backend {
        BackendArg::Auto => None,
        BackendArg::Modern => Some(BackendKind::Modern),
        BackendArg::Legacy => Some(BackendKind::Legacy),
        BackendArg::Sim => Some(BackendKind::Simulated),
    };
    SelectionPolicy {
        preferred,
        allow_simulation: !args.no_sim,
        ..SelectionPolicy::default()
    }
}

fn run(args: Args) -> Result<()> {
    let raw = std::fs::read_to_string(&args.config)?;
    let pin_map: PinMap = serde_json::from_str(&raw)?;
    let config = pin_map.validate()?;
    info!("Loaded pin map from {}", args.config.display());

    let mut tank = TankController::open(config, &policy(&args))?;
    let outcome = match &args.command {
        Command::Forward(drive) => tank.forward(drive.speed, drive.duration()),
        Command::Backward(drive) => tank.backward(drive.speed, drive.duration()),
        Command::Left(drive) => tank.turn_left(drive.speed, drive.duration()),
        Command::Right(drive) => tank.turn_right(drive.speed, drive.duration()),
        Command::Pan { degrees, speed } => tank.pan_at(*degrees, *speed).map(|report| {
            info!("Turret issued {}/{} steps", report.issued, report.requested);
        }),
        Command::Stop => tank.stop_all(),
    };

    // release even if the command failed
    let released = tank.release();
    outcome.and(released)
}

fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    if let Err(e) = run(Args::parse()) {
        eprintln!("tank error: {}", e);
        std::process::exit(1);
    }
}
