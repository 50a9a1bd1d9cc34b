// Simulation provider: no physical I/O, every intended effect is logged
// and recorded so callers (and tests) can observe it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use super::{BackendKind, GpioProvider, Level, PinMode, PwmOutput};
use crate::config::Pin;
use crate::error::Result;

/// One recorded effect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinEvent {
    Configure { pin: Pin, mode: PinMode },
    Write { pin: Pin, level: Level },
    PwmDuty { pin: Pin, frequency: u32, duty: u8 },
    PwmDisable { pin: Pin },
    Free { pin: Pin },
    Close,
}

#[derive(Default)]
struct SimState {
    events: Vec<PinEvent>,
    levels: HashMap<Pin, Level>,
    claimed: HashSet<Pin>,
    pwm: HashMap<Pin, (u8, bool)>, // (duty %, running)
    closed: bool,
}

impl SimState {
    fn record(&mut self, event: PinEvent) {
        match &event {
            PinEvent::Configure { pin, .. } => {
                self.claimed.insert(*pin);
            }
            PinEvent::Write { pin, level } => {
                self.levels.insert(*pin, *level);
            }
            PinEvent::PwmDuty { pin, duty, .. } => {
                self.pwm.insert(*pin, (*duty, true));
            }
            PinEvent::PwmDisable { pin } => {
                let entry = self.pwm.entry(*pin).or_insert((0, false));
                entry.1 = false;
            }
            PinEvent::Free { pin } => {
                self.claimed.remove(pin);
            }
            PinEvent::Close => self.closed = true,
        }
        self.events.push(event);
    }
}

/// Read side of the simulation, shared with the provider
#[derive(Clone, Default)]
pub struct SimLog {
    state: Arc<Mutex<SimState>>,
}

impl SimLog {
    fn record(&self, event: PinEvent) {
        self.state.lock().record(event);
    }

    /// Every effect so far, in order
    pub fn events(&self) -> Vec<PinEvent> {
        self.state.lock().events.clone()
    }

    /// Last level written to `pin`
    pub fn level(&self, pin: Pin) -> Option<Level> {
        self.state.lock().levels.get(&pin).copied()
    }

    /// Last duty (percent) sent to the PWM on `pin`
    pub fn pwm_duty(&self, pin: Pin) -> Option<u8> {
        self.state.lock().pwm.get(&pin).map(|(duty, _)| *duty)
    }

    pub fn pwm_running(&self, pin: Pin) -> bool {
        self.state
            .lock()
            .pwm
            .get(&pin)
            .is_some_and(|(_, running)| *running)
    }

    pub fn is_claimed(&self, pin: Pin) -> bool {
        self.state.lock().claimed.contains(&pin)
    }

    /// Number of pins currently claimed
    pub fn claimed_count(&self) -> usize {
        self.state.lock().claimed.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }
}

/// Provider that honours the full contract without touching hardware
#[derive(Default)]
pub struct SimulatedGpio {
    log: SimLog,
}

impl SimulatedGpio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> SimLog {
        self.log.clone()
    }
}

impl GpioProvider for SimulatedGpio {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulated
    }

    fn configure(&self, pin: Pin, mode: PinMode) -> Result<()> {
        info!("GPIO: configuring pin {} as {:?}", pin, mode);
        self.log.record(PinEvent::Configure { pin, mode });
        Ok(())
    }

    fn write(&self, pin: Pin, level: Level) -> Result<()> {
        info!("GPIO: setting pin {} to {}", pin, level);
        self.log.record(PinEvent::Write { pin, level });
        Ok(())
    }

    fn pwm(&self, pin: Pin, frequency: u32) -> Result<Box<dyn PwmOutput>> {
        Ok(Box::new(SimulatedPwm {
            pin,
            frequency,
            log: self.log.clone(),
        }))
    }

    fn free(&self, pin: Pin) -> Result<()> {
        info!("GPIO: freeing pin {}", pin);
        self.log.record(PinEvent::Free { pin });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        info!("GPIO: closing simulated handle");
        self.log.record(PinEvent::Close);
        Ok(())
    }
}

struct SimulatedPwm {
    pin: Pin,
    frequency: u32,
    log: SimLog,
}

impl PwmOutput for SimulatedPwm {
    // duty is carried as a plain percentage
    fn resolution(&self) -> u32 {
        100
    }

    fn set_duty(&mut self, raw: u32) -> Result<()> {
        let duty = raw.min(100) as u8;
        info!(
            "PWM: pin {} at {}Hz, {}% duty cycle",
            self.pin, self.frequency, duty
        );
        self.log.record(PinEvent::PwmDuty {
            pin: self.pin,
            frequency: self.frequency,
            duty,
        });
        Ok(())
    }

    fn disable(&mut self) -> Result<()> {
        info!("PWM: stopping pin {}", self.pin);
        self.log.record(PinEvent::PwmDisable { pin: self.pin });
        Ok(())
    }
}
