// Actuator control for a tracked robot: two H-bridge wheel banks and a
// stepper-driven camera turret over interchangeable GPIO backends.

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod motor;
pub mod tank;

pub use error::{Result, TankError};
pub use tank::{MotionState, TankController};
