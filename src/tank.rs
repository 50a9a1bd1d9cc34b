// Tank-level coordinator: two wheel banks and the camera turret
//
// All motions run on the calling thread. Timed drives block for their
// duration and then stop; untimed drives keep running until the next
// command. Nothing here stops the tank on its own.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendKind, SelectionPolicy};
use crate::clock::{CancelToken, Clock, Completion, SystemClock, TimedTask};
use crate::config::{DEFAULT_TURRET_SPEED, TankConfig};
use crate::error::{Result, TankError};
use crate::motor::{Channel, Direction, DualMotorDriver, RotateReport, Stepper, step_delay};

/// Coarse lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    Idle,
    Moving,
    Released,
}

struct Hardware {
    left: DualMotorDriver,
    right: DualMotorDriver,
    turret: Stepper,
}

impl Hardware {
    fn set_banks(&mut self, left: Direction, right: Direction, speed: u8) -> Result<()> {
        for (bank, direction) in [(&mut self.left, left), (&mut self.right, right)] {
            for channel in [Channel::A, Channel::B] {
                match direction {
                    Direction::Forward => bank.forward(channel, speed)?,
                    Direction::Backward => bank.backward(channel, speed)?,
                    Direction::Stopped => bank.stop(channel)?,
                }
            }
        }
        Ok(())
    }

    fn stop_all(&mut self) -> Result<()> {
        self.left.stop_all()?;
        self.right.stop_all()
    }

    fn is_moving(&self) -> bool {
        [&self.left, &self.right].iter().any(|bank| {
            [Channel::A, Channel::B].iter().any(|&channel| {
                bank.state(channel)
                    .is_some_and(|state| state.direction != Direction::Stopped)
            })
        })
    }
}

/// Owns the backend handle, both wheel banks and the turret
pub struct TankController {
    backend: Backend,
    hardware: Option<Hardware>,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    turret_speed: f64,
}

impl TankController {
    /// Select and open a backend per `policy`, then build the controller on it.
    /// If construction fails the backend is released again.
    pub fn open(config: TankConfig, policy: &SelectionPolicy) -> Result<Self> {
        let backend = Backend::open(policy)?;
        match Self::new(config, backend.clone()) {
            Ok(tank) => Ok(tank),
            Err(e) => {
                if let Err(release_err) = backend.release() {
                    warn!("Failed to release backend after init error: {}", release_err);
                }
                Err(e)
            }
        }
    }

    /// Build on an already opened backend, pacing with the wall clock
    pub fn new(config: TankConfig, backend: Backend) -> Result<Self> {
        Self::with_clock(config, backend, Arc::new(SystemClock::new()))
    }

    /// Build with an explicit clock (tests inject a `VirtualClock`)
    pub fn with_clock(config: TankConfig, backend: Backend, clock: Arc<dyn Clock>) -> Result<Self> {
        config.check()?;
        info!("Initializing tank controller on {} backend", backend.kind());

        let left = DualMotorDriver::new("left_wheels", &backend, config.left, config.pwm_frequency)?;
        let right =
            DualMotorDriver::new("right_wheels", &backend, config.right, config.pwm_frequency)?;
        let turret = Stepper::new(&backend, config.turret, Arc::clone(&clock))?;

        info!("Tank controller ready");
        Ok(Self {
            backend,
            hardware: Some(Hardware {
                left,
                right,
                turret,
            }),
            clock,
            cancel: CancelToken::new(),
            turret_speed: DEFAULT_TURRET_SPEED,
        })
    }

    fn hardware(&mut self) -> Result<&mut Hardware> {
        self.hardware.as_mut().ok_or(TankError::UseAfterRelease)
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn state(&self) -> MotionState {
        match &self.hardware {
            None => MotionState::Released,
            Some(hw) if hw.is_moving() => MotionState::Moving,
            Some(_) => MotionState::Idle,
        }
    }

    /// Token that aborts a running timed drive or pan at its next checkpoint.
    /// Every motion command re-arms it on entry, so a cancel issued while
    /// nothing is running has no effect.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Turret speed used by [`TankController::pan`], in steps per second
    pub fn set_turret_speed(&mut self, steps_per_sec: f64) -> Result<()> {
        step_delay(steps_per_sec)?;
        self.turret_speed = steps_per_sec;
        Ok(())
    }

    fn drive(
        &mut self,
        label: &str,
        left: Direction,
        right: Direction,
        speed: u8,
        duration: Option<Duration>,
    ) -> Result<()> {
        info!("{} at {}%{}", label, speed.min(100), match duration {
            Some(d) => format!(" for {:?}", d),
            None => String::new(),
        });
        self.cancel.clear();
        self.hardware()?.set_banks(left, right, speed)?;

        if let Some(duration) = duration {
            let completion = TimedTask::new(duration).run(self.clock.as_ref(), &self.cancel);
            if completion == Completion::Cancelled {
                warn!("{} cancelled before {:?} elapsed", label, duration);
            }
            self.stop_all()?;
        }
        Ok(())
    }

    /// All wheels forward
    pub fn forward(&mut self, speed: u8, duration: Option<Duration>) -> Result<()> {
        self.drive("Forward", Direction::Forward, Direction::Forward, speed, duration)
    }

    /// All wheels backward
    pub fn backward(&mut self, speed: u8, duration: Option<Duration>) -> Result<()> {
        self.drive("Backward", Direction::Backward, Direction::Backward, speed, duration)
    }

    /// Pivot left: left bank backward, right bank forward
    pub fn turn_left(&mut self, speed: u8, duration: Option<Duration>) -> Result<()> {
        self.drive("Turn left", Direction::Backward, Direction::Forward, speed, duration)
    }

    /// Pivot right: left bank forward, right bank backward
    pub fn turn_right(&mut self, speed: u8, duration: Option<Duration>) -> Result<()> {
        self.drive("Turn right", Direction::Forward, Direction::Backward, speed, duration)
    }

    pub fn stop_all(&mut self) -> Result<()> {
        debug!("Stopping all wheels");
        self.hardware()?.stop_all()
    }

    /// Pan the camera turret by `degrees` at the configured turret speed
    pub fn pan(&mut self, degrees: f64) -> Result<RotateReport> {
        let speed = self.turret_speed;
        self.pan_at(degrees, speed)
    }

    /// Pan the camera turret by `degrees` at `speed` steps per second
    pub fn pan_at(&mut self, degrees: f64, speed: f64) -> Result<RotateReport> {
        info!("Panning turret {} deg", degrees);
        let cancel = self.cancel.clone();
        let turret = &mut self.hardware()?.turret;
        cancel.clear();
        turret.rotate_cancellable(degrees, speed, &cancel)
    }

    /// Left bank, for direct per-channel control
    pub fn left(&mut self) -> Result<&mut DualMotorDriver> {
        Ok(&mut self.hardware()?.left)
    }

    /// Right bank, for direct per-channel control
    pub fn right(&mut self) -> Result<&mut DualMotorDriver> {
        Ok(&mut self.hardware()?.right)
    }

    pub fn turret(&mut self) -> Result<&mut Stepper> {
        Ok(&mut self.hardware()?.turret)
    }

    /// Stop everything, free every pin and release the backend handle.
    /// Must run before exit; later calls on this controller fail with
    /// `UseAfterRelease`.
    pub fn release(&mut self) -> Result<()> {
        let mut hw = self.hardware.take().ok_or(TankError::UseAfterRelease)?;
        info!("Releasing tank controller");

        // keep going on failure so the handle is still released
        let mut first_err = None;
        keep_first(&mut first_err, hw.stop_all());
        keep_first(&mut first_err, hw.turret.stop());
        let Hardware {
            left,
            right,
            turret,
        } = hw;
        keep_first(&mut first_err, left.release());
        keep_first(&mut first_err, right.release());
        keep_first(&mut first_err, turret.release());
        keep_first(&mut first_err, self.backend.release());

        match first_err {
            Some(e) => Err(e),
            None => {
                info!("Tank controller released");
                Ok(())
            }
        }
    }
}

fn keep_first(slot: &mut Option<TankError>, result: Result<()>) {
    if let Err(e) = result {
        warn!("Release step failed: {}", e);
        slot.get_or_insert(e);
    }
}

impl Drop for TankController {
    fn drop(&mut self) {
        // Safety net: pins must not stay claimed (or driven) after exit
        if self.hardware.is_some() {
            warn!("Tank controller dropped without release, releasing now");
            if let Err(e) = self.release() {
                warn!("Failed to release on drop: {}", e);
            }
        }
    }
}
