// Legacy provider: flat BCM numbering straight onto /sys/class/gpio,
// software PWM with 8-bit duty resolution

use std::path::Path;

use tracing::info;

use super::sysfs::{SoftPwm, SysfsGpio};
use super::{BackendKind, GpioProvider, Level, PinMode, PwmOutput};
use crate::config::Pin;
use crate::error::{Result, TankError};

pub const LEGACY_DUTY_RESOLUTION: u32 = 255;

pub struct LegacyGpio {
    sysfs: SysfsGpio,
}

impl LegacyGpio {
    pub fn open(root: &Path) -> Result<Self> {
        if !root.join("export").exists() {
            return Err(TankError::ResourceUnavailable(format!(
                "{} has no export interface",
                root.display()
            )));
        }
        info!("Using legacy sysfs GPIO at {}", root.display());
        Ok(Self {
            sysfs: SysfsGpio::new(root),
        })
    }
}

impl GpioProvider for LegacyGpio {
    fn kind(&self) -> BackendKind {
        BackendKind::Legacy
    }

    fn configure(&self, pin: Pin, mode: PinMode) -> Result<()> {
        self.sysfs.claim(pin, mode)
    }

    fn write(&self, pin: Pin, level: Level) -> Result<()> {
        Ok(self.sysfs.write(pin, level)?)
    }

    fn pwm(&self, pin: Pin, frequency: u32) -> Result<Box<dyn PwmOutput>> {
        Ok(Box::new(SoftPwm::new(
            self.sysfs.value_path(pin),
            frequency,
            LEGACY_DUTY_RESOLUTION,
        )))
    }

    fn free(&self, pin: Pin) -> Result<()> {
        Ok(self.sysfs.unexport(pin)?)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
