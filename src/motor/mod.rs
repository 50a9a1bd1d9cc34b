// Actuator drivers for the tank
//
// Provides:
// - Dual-channel H-bridge driver for the wheel banks
// - Four-wire full-step driver for the camera turret

mod driver;
pub mod stepper;

pub use driver::{Channel, ChannelState, Direction, DualMotorDriver};
pub use stepper::{RotateReport, STEP_SEQUENCE, StepDirection, Stepper, step_delay, steps_for};
