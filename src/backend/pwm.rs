// Per-pin PWM channel with a 0-100 duty contract

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{Backend, PwmOutput};
use crate::config::Pin;
use crate::error::Result;

/// Convert a 0-100 duty to a provider's `0..=resolution` range.
/// Exact at 0 and 100, rounds half up in between. Inputs above 100 saturate.
pub fn scale_duty(percent: u8, resolution: u32) -> u32 {
    let percent = u64::from(percent.min(100));
    ((percent * u64::from(resolution) + 50) / 100) as u32
}

/// Provider output plus the state the channel reports back
pub(crate) struct PwmSlot {
    output: Box<dyn PwmOutput>,
    duty: u8,
    running: bool,
}

impl PwmSlot {
    pub(crate) fn new(output: Box<dyn PwmOutput>) -> Self {
        Self {
            output,
            duty: 0,
            running: false,
        }
    }

    fn apply(&mut self, duty: u8) -> Result<()> {
        let raw = scale_duty(duty, self.output.resolution());
        self.output.set_duty(raw)
    }

    /// change(0) then disable
    pub(crate) fn stop(&mut self) -> Result<()> {
        self.duty = 0;
        if self.running {
            self.apply(0)?;
        }
        self.output.disable()?;
        self.running = false;
        Ok(())
    }
}

/// Pulse-width output on one pin
pub struct PwmChannel {
    pin: Pin,
    frequency: u32,
    slot: Arc<Mutex<PwmSlot>>,
    backend: Backend,
    released: bool,
}

fn clamp(duty: u8, pin: Pin) -> u8 {
    if duty > 100 {
        warn!("PWM duty {}% on pin {} clamped to 100%", duty, pin);
        100
    } else {
        duty
    }
}

impl PwmChannel {
    pub(crate) fn new(pin: Pin, frequency: u32, slot: Arc<Mutex<PwmSlot>>, backend: Backend) -> Self {
        Self {
            pin,
            frequency,
            slot,
            backend,
            released: false,
        }
    }

    pub fn pin(&self) -> Pin {
        self.pin
    }

    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    /// Last duty set on this channel (0-100)
    pub fn duty(&self) -> u8 {
        self.slot.lock().duty
    }

    pub fn is_running(&self) -> bool {
        self.slot.lock().running
    }

    /// Begin output at `duty` percent
    pub fn start(&mut self, duty: u8) -> Result<()> {
        self.backend.ensure_open()?;
        let duty = clamp(duty, self.pin);
        let mut slot = self.slot.lock();
        slot.apply(duty)?;
        slot.duty = duty;
        slot.running = true;
        debug!("PWM pin {} started at {}Hz, {}%", self.pin, self.frequency, duty);
        Ok(())
    }

    /// Update the duty. The value is stored even while stopped and takes
    /// effect on the next `start`.
    pub fn change(&mut self, duty: u8) -> Result<()> {
        self.backend.ensure_open()?;
        let duty = clamp(duty, self.pin);
        let mut slot = self.slot.lock();
        if slot.running {
            slot.apply(duty)?;
        }
        slot.duty = duty;
        debug!("PWM pin {} duty -> {}%", self.pin, duty);
        Ok(())
    }

    /// Equivalent to `change(0)` followed by disabling output
    pub fn stop(&mut self) -> Result<()> {
        self.backend.ensure_open()?;
        self.slot.lock().stop()?;
        debug!("PWM pin {} stopped", self.pin);
        Ok(())
    }

    /// Stop, unregister from the backend and free the pin
    pub fn release(mut self) -> Result<()> {
        self.free()
    }

    fn free(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.backend.ensure_open()?;
        self.slot.lock().stop()?;
        self.backend.forget_pwm(&self.slot);
        self.backend.provider().free(self.pin)
    }
}

impl Drop for PwmChannel {
    fn drop(&mut self) {
        if self.released || self.backend.is_released() {
            return;
        }
        if let Err(e) = self.free() {
            warn!("Failed to release PWM pin {} on drop: {}", self.pin, e);
        }
    }
}
