// Four-wire full-step stepper driver (camera turret)
//
// Speed control is purely the pause between steps; there is no timer
// hardware involved.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{Backend, Level, OutputPin};
use crate::clock::{CancelToken, Clock};
use crate::config::{DEFAULT_STEP_DELAY, StepperPins};
use crate::error::{Result, TankError};

/// Full-step sequence: one coil energised per state
pub const STEP_SEQUENCE: [[bool; 4]; 4] = [
    [true, false, false, false],
    [false, true, false, false],
    [false, false, true, false],
    [false, false, false, true],
];

/// De-energised pattern written by `stop`
const ALL_OFF: [bool; 4] = [false; 4];

/// Rotation sense of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirection {
    Forward,
    Backward,
}

impl StepDirection {
    /// +1 / -1
    pub fn delta(self) -> i8 {
        match self {
            StepDirection::Forward => 1,
            StepDirection::Backward => -1,
        }
    }
}

/// Outcome of a `rotate` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotateReport {
    pub requested: u32,
    pub issued: u32,
    pub direction: StepDirection,
}

impl RotateReport {
    pub fn completed(&self) -> bool {
        self.issued == self.requested
    }
}

/// Number of whole steps for `degrees`, rounded per call. Small repeated
/// moves drift because no remainder is carried over.
pub fn steps_for(degrees: f64, steps_per_rev: u32) -> Result<u32> {
    let steps = (degrees.abs() / 360.0 * f64::from(steps_per_rev)).round();
    if !steps.is_finite() || steps > f64::from(u32::MAX) {
        return Err(TankError::InvalidConfiguration(format!(
            "cannot rotate by {} degrees",
            degrees
        )));
    }
    Ok(steps as u32)
}

/// Pause between steps for `speed` steps per second
pub fn step_delay(speed: f64) -> Result<Duration> {
    if !speed.is_finite() || speed <= 0.0 {
        return Err(TankError::InvalidSpeed(speed));
    }
    Duration::try_from_secs_f64(1.0 / speed).map_err(|_| TankError::InvalidSpeed(speed))
}

pub struct Stepper {
    coils: Vec<OutputPin>,
    steps_per_rev: u32,
    current_step: u8,
    clock: Arc<dyn Clock>,
}

impl Stepper {
    pub fn new(backend: &Backend, pins: StepperPins, clock: Arc<dyn Clock>) -> Result<Self> {
        info!(
            "Initializing stepper on pins {:?}, {} steps/rev",
            pins.coils, pins.steps_per_rev
        );
        let coils = pins
            .coils
            .iter()
            .map(|&pin| backend.output(pin))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            coils,
            steps_per_rev: pins.steps_per_rev,
            current_step: 0,
            clock,
        })
    }

    /// Index into [`STEP_SEQUENCE`] of the last written state
    pub fn current_step(&self) -> u8 {
        self.current_step
    }

    pub fn steps_per_rev(&self) -> u32 {
        self.steps_per_rev
    }

    // De-energised coils go first so two coils are never on at once
    fn write_pattern(&mut self, pattern: [bool; 4]) -> Result<()> {
        for on in [false, true] {
            for (coil, _) in self
                .coils
                .iter_mut()
                .zip(pattern)
                .filter(|(_, level)| *level == on)
            {
                coil.set(Level::from(on))?;
            }
        }
        Ok(())
    }

    /// Advance one step, write the new coil pattern, then pause for `delay`
    pub fn step(&mut self, direction: StepDirection, delay: Duration) -> Result<()> {
        self.current_step = (self.current_step as i8 + direction.delta()).rem_euclid(4) as u8;
        let pattern = STEP_SEQUENCE[self.current_step as usize];
        self.write_pattern(pattern)?;
        self.clock.pause(delay);
        Ok(())
    }

    /// [`Stepper::step`] with the default 2 ms pause
    pub fn step_default(&mut self, direction: StepDirection) -> Result<()> {
        self.step(direction, DEFAULT_STEP_DELAY)
    }

    /// Rotate by `degrees` (positive = forward) at `speed` steps per second
    pub fn rotate(&mut self, degrees: f64, speed: f64) -> Result<RotateReport> {
        self.rotate_cancellable(degrees, speed, &CancelToken::new())
    }

    /// Like [`Stepper::rotate`], checking `cancel` before every step
    pub fn rotate_cancellable(
        &mut self,
        degrees: f64,
        speed: f64,
        cancel: &CancelToken,
    ) -> Result<RotateReport> {
        let delay = step_delay(speed)?;
        if !degrees.is_finite() {
            return Err(TankError::InvalidConfiguration(format!(
                "cannot rotate by {} degrees",
                degrees
            )));
        }

        let requested = steps_for(degrees, self.steps_per_rev)?;
        let direction = if degrees > 0.0 {
            StepDirection::Forward
        } else {
            StepDirection::Backward
        };
        debug!(
            "Rotating {} deg: {} steps {:?}, {:?} apart",
            degrees, requested, direction, delay
        );

        let mut issued = 0;
        while issued < requested {
            if cancel.is_cancelled() {
                warn!("Rotation cancelled after {}/{} steps", issued, requested);
                break;
            }
            self.step(direction, delay)?;
            issued += 1;
        }

        Ok(RotateReport {
            requested,
            issued,
            direction,
        })
    }

    /// De-energise every coil. Holding torque is lost.
    pub fn stop(&mut self) -> Result<()> {
        debug!("Stepper coils off");
        self.write_pattern(ALL_OFF)
    }

    /// Coils off, pins freed
    pub fn release(mut self) -> Result<()> {
        self.stop()?;
        for coil in self.coils.drain(..) {
            coil.release()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{PinEvent, SimLog};
    use crate::clock::VirtualClock;
    use proptest::prelude::*;

    const PINS: StepperPins = StepperPins {
        coils: [17, 27, 22, 23],
        steps_per_rev: 200,
    };

    fn stepper() -> (Stepper, SimLog, Arc<VirtualClock>) {
        let (backend, log) = Backend::simulated();
        let clock = Arc::new(VirtualClock::new());
        let stepper = Stepper::new(&backend, PINS, clock.clone()).unwrap();
        (stepper, log, clock)
    }

    fn coil_levels(log: &SimLog) -> [bool; 4] {
        PINS.coils
            .map(|pin| log.level(pin).is_some_and(|level| level.is_high()))
    }

    fn step_writes(log: &SimLog) -> usize {
        log.events()
            .iter()
            .filter(|event| matches!(event, PinEvent::Write { .. }))
            .count()
            / 4
    }

    #[test]
    fn test_new_leaves_coils_low() {
        let (stepper, log, _clock) = stepper();
        assert_eq!(stepper.current_step(), 0);
        assert_eq!(coil_levels(&log), ALL_OFF);
    }

    #[test]
    fn test_step_sequence_patterns() {
        let (mut stepper, log, clock) = stepper();
        let delay = Duration::from_millis(2);

        stepper.step(StepDirection::Forward, delay).unwrap();
        assert_eq!(stepper.current_step(), 1);
        assert_eq!(coil_levels(&log), [false, true, false, false]);

        stepper.step(StepDirection::Backward, delay).unwrap();
        stepper.step(StepDirection::Backward, delay).unwrap();
        assert_eq!(stepper.current_step(), 3);
        assert_eq!(coil_levels(&log), [false, false, false, true]);

        assert_eq!(clock.elapsed(), Duration::from_millis(6));
    }

    #[test]
    fn test_full_turn_issues_steps_per_rev_steps() {
        let (mut stepper, log, clock) = stepper();
        log.clear_events();

        let report = stepper.rotate(360.0, 500.0).unwrap();

        assert_eq!(report.requested, 200);
        assert!(report.completed());
        assert_eq!(report.direction, StepDirection::Forward);
        assert_eq!(step_writes(&log), 200);
        assert_eq!(clock.pauses(), 200);
        // 200 steps * 2 ms
        assert_eq!(clock.elapsed(), Duration::from_millis(400));
        // 200 is a multiple of 4
        assert_eq!(stepper.current_step(), 0);
    }

    #[test]
    fn test_negative_quarter_turn() {
        let (mut stepper, _log, _clock) = stepper();
        let report = stepper.rotate(-90.0, 500.0).unwrap();
        assert_eq!(report.issued, 50);
        assert_eq!(report.direction, StepDirection::Backward);
        // 0 - 50 mod 4
        assert_eq!(stepper.current_step(), 2);
    }

    #[test]
    fn test_small_angles_round_per_call() {
        assert_eq!(steps_for(1.0, 200).unwrap(), 1); // 0.555..
        assert_eq!(steps_for(0.8, 200).unwrap(), 0); // 0.444..
        assert_eq!(steps_for(-1.8, 200).unwrap(), 1); // sign ignored

        let (mut stepper, _log, _clock) = stepper();
        let mut total = 0;
        for _ in 0..10 {
            total += stepper.rotate(0.8, 500.0).unwrap().issued;
        }
        // 8 degrees would be 4.44 steps; per-call rounding drops all of them
        assert_eq!(total, 0);
    }

    #[test]
    fn test_zero_degrees_is_noop() {
        let (mut stepper, log, clock) = stepper();
        log.clear_events();
        let report = stepper.rotate(0.0, 500.0).unwrap();
        assert_eq!(report.issued, 0);
        assert!(log.events().is_empty());
        assert_eq!(clock.pauses(), 0);
    }

    #[test]
    fn test_invalid_speed_rejected() {
        let (mut stepper, _log, _clock) = stepper();
        assert!(matches!(
            stepper.rotate(90.0, 0.0),
            Err(TankError::InvalidSpeed(_))
        ));
        assert!(matches!(
            stepper.rotate(90.0, f64::NAN),
            Err(TankError::InvalidSpeed(_))
        ));
    }

    #[test]
    fn test_tiny_speed_rejected() {
        let (mut stepper, log, clock) = stepper();
        log.clear_events();
        assert!(matches!(
            stepper.rotate(90.0, 1e-20),
            Err(TankError::InvalidSpeed(_))
        ));
        assert!(matches!(
            stepper.rotate(90.0, f64::MIN_POSITIVE / 4.0),
            Err(TankError::InvalidSpeed(_))
        ));
        assert!(log.events().is_empty());
        assert_eq!(clock.pauses(), 0);
    }

    #[test]
    fn test_step_delay_is_inverse_speed() {
        assert_eq!(step_delay(500.0).unwrap(), Duration::from_millis(2));
        assert!(matches!(step_delay(-3.0), Err(TankError::InvalidSpeed(_))));
        assert!(matches!(step_delay(1e-20), Err(TankError::InvalidSpeed(_))));
    }

    #[test]
    fn test_huge_angle_rejected() {
        assert!(matches!(
            steps_for(1e10, 200),
            Err(TankError::InvalidConfiguration(_))
        ));
        assert_eq!(steps_for(360.0 * 1000.0, 200).unwrap(), 200_000);

        let (mut stepper, log, _clock) = stepper();
        log.clear_events();
        assert!(matches!(
            stepper.rotate(-1e10, 500.0),
            Err(TankError::InvalidConfiguration(_))
        ));
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_step_default_pauses_two_ms() {
        let (mut stepper, _log, clock) = stepper();
        stepper.step_default(StepDirection::Forward).unwrap();
        assert_eq!(stepper.current_step(), 1);
        assert_eq!(clock.elapsed(), DEFAULT_STEP_DELAY);
    }

    #[test]
    fn test_backward_step_never_energises_two_coils() {
        let (mut stepper, log, _clock) = stepper();
        stepper.step(StepDirection::Forward, Duration::ZERO).unwrap();
        log.clear_events();
        for _ in 0..8 {
            stepper.step(StepDirection::Backward, Duration::ZERO).unwrap();
        }
        stepper.rotate(36.0, 500.0).unwrap();

        let mut on = STEP_SEQUENCE[1];
        let mut writes = 0;
        for event in log.events() {
            if let PinEvent::Write { pin, level } = event {
                let coil = PINS.coils.iter().position(|&c| c == pin).unwrap();
                on[coil] = level.is_high();
                assert!(on.iter().filter(|&&c| c).count() <= 1, "two coils on: {:?}", on);
                writes += 1;
            }
        }
        assert!(writes > 0);
    }

    #[test]
    fn test_cancel_stops_between_steps() {
        let (mut stepper, _log, _clock) = stepper();
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = stepper.rotate_cancellable(180.0, 500.0, &cancel).unwrap();
        assert_eq!(report.requested, 100);
        assert_eq!(report.issued, 0);
        assert!(!report.completed());
    }

    #[test]
    fn test_stop_de_energises() {
        let (mut stepper, log, _clock) = stepper();
        stepper.rotate(45.0, 500.0).unwrap();
        stepper.stop().unwrap();
        assert_eq!(coil_levels(&log), ALL_OFF);
    }

    #[test]
    fn test_release_frees_coils() {
        let (mut stepper, log, _clock) = stepper();
        stepper.rotate(10.0, 500.0).unwrap();
        stepper.release().unwrap();
        assert_eq!(log.claimed_count(), 0);
    }

    proptest! {
        #[test]
        fn step_index_stays_in_range(forward in proptest::collection::vec(any::<bool>(), 0..64)) {
            let (mut stepper, log, _clock) = stepper();
            let mut expected: i32 = 0;
            for f in forward {
                let direction = if f { StepDirection::Forward } else { StepDirection::Backward };
                stepper.step(direction, Duration::ZERO).unwrap();
                expected = (expected + i32::from(direction.delta())).rem_euclid(4);

                prop_assert!(stepper.current_step() < 4);
                prop_assert_eq!(i32::from(stepper.current_step()), expected);
                let levels = coil_levels(&log);
                prop_assert_eq!(levels, STEP_SEQUENCE[stepper.current_step() as usize]);
                prop_assert_eq!(levels.iter().filter(|on| **on).count(), 1);
            }
        }
    }
}
