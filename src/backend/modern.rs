// Modern chip-based provider
//
// Pins are line offsets on one named gpiochip (the RP1 controller on a
// Raspberry Pi 5). The chip's `base` maps an offset to the kernel's global
// line number. Duty resolution matches lgpio: 0..=1_000_000.

use std::fs;
use std::path::Path;

use tracing::info;

use super::sysfs::{SoftPwm, SysfsGpio};
use super::{BackendKind, GpioProvider, Level, PinMode, PwmOutput};
use crate::config::Pin;
use crate::error::{Result, TankError};

pub const MODERN_DUTY_RESOLUTION: u32 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChipInfo {
    pub name: String,
    pub base: u32,
    pub ngpio: u32,
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Find the gpiochip whose label matches `label`
pub(crate) fn find_chip(root: &Path, label: &str) -> Option<ChipInfo> {
    let entries = fs::read_dir(root).ok()?;
    let mut chips: Vec<ChipInfo> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("gpiochip") {
                return None;
            }
            let dir = entry.path();
            if read_trimmed(&dir.join("label"))? != label {
                return None;
            }
            Some(ChipInfo {
                name,
                base: read_trimmed(&dir.join("base"))?.parse().ok()?,
                ngpio: read_trimmed(&dir.join("ngpio"))?.parse().ok()?,
            })
        })
        .collect();
    chips.sort_by_key(|chip| chip.base);
    chips.into_iter().next()
}

pub struct ChipGpio {
    sysfs: SysfsGpio,
    chip: ChipInfo,
}

impl ChipGpio {
    /// Open the chip labelled `label` under `root`
    pub fn open(root: &Path, label: &str) -> Result<Self> {
        let chip = find_chip(root, label).ok_or_else(|| {
            TankError::ResourceUnavailable(format!("no gpiochip labelled {}", label))
        })?;
        info!(
            "Using {} ({}) with {} lines at base {}",
            chip.name, label, chip.ngpio, chip.base
        );
        Ok(Self {
            sysfs: SysfsGpio::new(root),
            chip,
        })
    }

    fn line(&self, pin: Pin) -> Result<u32> {
        if pin >= self.chip.ngpio {
            return Err(TankError::InvalidConfiguration(format!(
                "pin {} outside {} (0..{})",
                pin, self.chip.name, self.chip.ngpio
            )));
        }
        Ok(self.chip.base + pin)
    }
}

impl GpioProvider for ChipGpio {
    fn kind(&self) -> BackendKind {
        BackendKind::Modern
    }

    fn configure(&self, pin: Pin, mode: PinMode) -> Result<()> {
        self.sysfs.claim(self.line(pin)?, mode)
    }

    fn write(&self, pin: Pin, level: Level) -> Result<()> {
        Ok(self.sysfs.write(self.line(pin)?, level)?)
    }

    fn pwm(&self, pin: Pin, frequency: u32) -> Result<Box<dyn PwmOutput>> {
        let value = self.sysfs.value_path(self.line(pin)?);
        Ok(Box::new(SoftPwm::new(value, frequency, MODERN_DUTY_RESOLUTION)))
    }

    fn free(&self, pin: Pin) -> Result<()> {
        Ok(self.sysfs.unexport(self.line(pin)?)?)
    }

    fn close(&self) -> Result<()> {
        info!("Closed {}", self.chip.name);
        Ok(())
    }
}
