// GPIO backend abstraction
//
// One capability interface (`GpioProvider`) with three implementations:
// - `ChipGpio`: modern chip-based access (lines addressed as offsets on a gpiochip)
// - `LegacyGpio`: flat global pin numbering under /sys/class/gpio
// - `SimulatedGpio`: no physical I/O, records every intended effect
//
// The provider is picked once per process. Everything else talks to the
// `Backend` handle, which owns the provider, tracks PWM channels and
// refuses all calls after `release()`.

mod legacy;
mod modern;
mod pwm;
mod simulated;
mod sysfs;

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{MODERN_CHIP_LABEL, Pin};
use crate::error::{Result, TankError};

pub use legacy::{LEGACY_DUTY_RESOLUTION, LegacyGpio};
pub use modern::{ChipGpio, MODERN_DUTY_RESOLUTION};
pub use pwm::{PwmChannel, scale_duty};
pub use simulated::{PinEvent, SimLog, SimulatedGpio};

/// Which provider a backend is running on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Modern,
    Legacy,
    Simulated,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Modern => write!(f, "modern"),
            BackendKind::Legacy => write!(f, "legacy"),
            BackendKind::Simulated => write!(f, "simulated"),
        }
    }
}

/// Digital output level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Low => write!(f, "LOW"),
            Level::High => write!(f, "HIGH"),
        }
    }
}

/// Pin direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input,
    Output,
}

/// Capability interface every hardware provider implements
pub trait GpioProvider: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Claim `pin` and set its direction
    fn configure(&self, pin: Pin, mode: PinMode) -> Result<()>;

    /// Drive a configured output
    fn write(&self, pin: Pin, level: Level) -> Result<()>;

    /// Create a PWM generator on `pin`. Output stays off until the first duty is set.
    fn pwm(&self, pin: Pin, frequency: u32) -> Result<Box<dyn PwmOutput>>;

    /// Give a pin claim back
    fn free(&self, pin: Pin) -> Result<()>;

    /// Close the connection to the pin controller
    fn close(&self) -> Result<()>;
}

/// Provider-side PWM generator. Duty values are in the provider's own
/// resolution (`0..=resolution()`); [`PwmChannel`] does the 0-100 scaling.
pub trait PwmOutput: Send {
    fn resolution(&self) -> u32;

    /// Start output or update the duty of a running output
    fn set_duty(&mut self, raw: u32) -> Result<()>;

    /// Turn output off entirely
    fn disable(&mut self) -> Result<()>;
}

// Only one hardware handle may exist per process
static HARDWARE_CLAIMED: AtomicBool = AtomicBool::new(false);

struct HardwareClaim;

impl HardwareClaim {
    fn acquire() -> Result<Self> {
        HARDWARE_CLAIMED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| HardwareClaim)
            .map_err(|_| {
                TankError::ResourceUnavailable("GPIO handle already owned by this process".into())
            })
    }
}

impl Drop for HardwareClaim {
    fn drop(&mut self) {
        HARDWARE_CLAIMED.store(false, Ordering::SeqCst);
    }
}

/// How to choose a provider
#[derive(Debug, Clone)]
pub struct SelectionPolicy {
    /// Skip probing and use this provider
    pub preferred: Option<BackendKind>,
    /// Fall back to simulation when no hardware is found
    pub allow_simulation: bool,
    /// Root of the sysfs gpio class (normally /sys/class/gpio)
    pub sysfs_root: PathBuf,
    /// Directory holding gpiochip character devices (normally /dev)
    pub dev_root: PathBuf,
    /// Label identifying the modern chip
    pub chip_label: String,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            preferred: None,
            allow_simulation: true,
            sysfs_root: PathBuf::from("/sys/class/gpio"),
            dev_root: PathBuf::from("/dev"),
            chip_label: MODERN_CHIP_LABEL.to_string(),
        }
    }
}

/// Probe for a provider: modern chip first, then legacy sysfs, then simulation
pub fn probe(policy: &SelectionPolicy) -> BackendKind {
    if policy.dev_root.join("gpiochip0").exists()
        && modern::find_chip(&policy.sysfs_root, &policy.chip_label).is_some()
    {
        BackendKind::Modern
    } else if policy.sysfs_root.join("export").exists() {
        BackendKind::Legacy
    } else {
        BackendKind::Simulated
    }
}

static PROBED: OnceLock<BackendKind> = OnceLock::new();

/// Provider kind for this process. The probe runs once; later calls reuse it.
pub fn select(policy: &SelectionPolicy) -> Result<BackendKind> {
    let kind = match policy.preferred {
        Some(kind) => kind,
        None => *PROBED.get_or_init(|| {
            let kind = probe(policy);
            info!("GPIO probe selected {} provider", kind);
            kind
        }),
    };

    if kind == BackendKind::Simulated && !policy.allow_simulation {
        return Err(TankError::ResourceUnavailable(
            "no GPIO hardware found and simulation is disallowed".into(),
        ));
    }
    Ok(kind)
}

struct Shared {
    provider: Box<dyn GpioProvider>,
    pwm: Mutex<Vec<Arc<Mutex<pwm::PwmSlot>>>>,
    released: AtomicBool,
    claim: Mutex<Option<HardwareClaim>>,
}

/// Owned handle to the pin controller. Cloning shares the same handle;
/// drivers hold clones, the tank controller releases it.
#[derive(Clone)]
pub struct Backend {
    shared: Arc<Shared>,
}

impl Backend {
    /// Select a provider per `policy` and open it
    pub fn open(policy: &SelectionPolicy) -> Result<Self> {
        let kind = select(policy)?;
        let backend = match kind {
            BackendKind::Modern => {
                let claim = HardwareClaim::acquire()?;
                let provider = ChipGpio::open(&policy.sysfs_root, &policy.chip_label)?;
                Self::with_claim(Box::new(provider), Some(claim))
            }
            BackendKind::Legacy => {
                let claim = HardwareClaim::acquire()?;
                let provider = LegacyGpio::open(&policy.sysfs_root)?;
                Self::with_claim(Box::new(provider), Some(claim))
            }
            BackendKind::Simulated => {
                warn!("No GPIO library available - running in simulation mode");
                Self::from_provider(Box::new(SimulatedGpio::new()))
            }
        };
        info!("Opened {} GPIO backend", kind);
        Ok(backend)
    }

    /// Open a fresh simulated backend and return its event log
    pub fn simulated() -> (Self, SimLog) {
        let provider = SimulatedGpio::new();
        let log = provider.log();
        (Self::from_provider(Box::new(provider)), log)
    }

    /// Wrap an already opened provider
    pub fn from_provider(provider: Box<dyn GpioProvider>) -> Self {
        Self::with_claim(provider, None)
    }

    fn with_claim(provider: Box<dyn GpioProvider>, claim: Option<HardwareClaim>) -> Self {
        Self {
            shared: Arc::new(Shared {
                provider,
                pwm: Mutex::new(Vec::new()),
                released: AtomicBool::new(false),
                claim: Mutex::new(claim),
            }),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.shared.provider.kind()
    }

    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_released() {
            Err(TankError::UseAfterRelease)
        } else {
            Ok(())
        }
    }

    pub(crate) fn provider(&self) -> &dyn GpioProvider {
        self.shared.provider.as_ref()
    }

    /// Claim `pin` as an output, driven LOW
    pub fn output(&self, pin: Pin) -> Result<OutputPin> {
        self.ensure_open()?;
        self.provider().configure(pin, PinMode::Output)?;
        let mut out = OutputPin {
            pin,
            backend: self.clone(),
            released: false,
        };
        out.set(Level::Low)?;
        Ok(out)
    }

    /// Claim `pin` as a PWM output at `frequency` Hz. The channel is tracked
    /// so [`Backend::release`] can stop it.
    pub fn pwm(&self, pin: Pin, frequency: u32) -> Result<PwmChannel> {
        self.ensure_open()?;
        self.provider().configure(pin, PinMode::Output)?;
        let output = match self.provider().pwm(pin, frequency) {
            Ok(output) => output,
            Err(e) => {
                let _ = self.provider().free(pin);
                return Err(e);
            }
        };
        let slot = Arc::new(Mutex::new(pwm::PwmSlot::new(output)));
        self.shared.pwm.lock().push(Arc::clone(&slot));
        debug!("PWM channel on pin {} at {}Hz registered", pin, frequency);
        Ok(PwmChannel::new(pin, frequency, slot, self.clone()))
    }

    pub(crate) fn forget_pwm(&self, slot: &Arc<Mutex<pwm::PwmSlot>>) {
        self.shared.pwm.lock().retain(|s| !Arc::ptr_eq(s, slot));
    }

    /// Number of PWM channels still registered against this handle
    pub fn pwm_count(&self) -> usize {
        self.shared.pwm.lock().len()
    }

    /// Stop every outstanding PWM channel, then close the handle. Runs once;
    /// a second call fails with `UseAfterRelease`.
    pub fn release(&self) -> Result<()> {
        if self.shared.released.swap(true, Ordering::SeqCst) {
            return Err(TankError::UseAfterRelease);
        }

        let outstanding: Vec<_> = self.shared.pwm.lock().drain(..).collect();
        if !outstanding.is_empty() {
            info!("Stopping {} outstanding PWM channel(s)", outstanding.len());
        }
        for slot in outstanding {
            if let Err(e) = slot.lock().stop() {
                warn!("Failed to stop PWM channel during release: {}", e);
            }
        }

        let closed = self.provider().close();
        self.shared.claim.lock().take();
        closed?;
        info!("Released {} GPIO backend", self.kind());
        Ok(())
    }
}

/// A claimed digital output
pub struct OutputPin {
    pin: Pin,
    backend: Backend,
    released: bool,
}

impl OutputPin {
    pub fn pin(&self) -> Pin {
        self.pin
    }

    pub fn set(&mut self, level: Level) -> Result<()> {
        self.backend.ensure_open()?;
        debug!("pin {} -> {}", self.pin, level);
        self.backend.provider().write(self.pin, level)
    }

    /// Drive LOW and give the pin back to the backend
    pub fn release(mut self) -> Result<()> {
        self.free()
    }

    fn free(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.backend.ensure_open()?;
        self.backend.provider().write(self.pin, Level::Low)?;
        self.backend.provider().free(self.pin)
    }
}

impl Drop for OutputPin {
    fn drop(&mut self) {
        if self.released || self.backend.is_released() {
            return;
        }
        if let Err(e) = self.free() {
            warn!("Failed to free pin {} on drop: {}", self.pin, e);
        }
    }
}
