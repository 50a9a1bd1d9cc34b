// Defaults, pin maps and pin-map validation
use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{Result, TankError};

// H-bridge enable line frequency
pub const DEFAULT_PWM_FREQUENCY_HZ: u32 = 1000;

// Wheel duty cycle (%) used when a caller gives no speed
pub const DEFAULT_SPEED: u8 = 50;

// Turret stepper
pub const DEFAULT_STEPS_PER_REV: u32 = 200;
pub const DEFAULT_TURRET_SPEED: f64 = 500.0; // steps/s
pub const DEFAULT_STEP_DELAY: Duration = Duration::from_millis(2);

// Slice length for cancellable pauses
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

// Gpiochip label of the RP1 I/O controller (Raspberry Pi 5)
pub const MODERN_CHIP_LABEL: &str = "pinctrl-rp1";

/// Physical pin identifier (BCM / line offset)
pub type Pin = u32;

/// Pin map as it appears in the config file. Every field is optional here;
/// [`PinMap::validate`] decides what is actually required.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PinMap {
    #[serde(default)]
    pub mobility: Mobility,
    #[serde(default)]
    pub motors: Motors,
    #[serde(default)]
    pub pwm_frequency: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Mobility {
    pub left_wheels: Option<WheelBank>,
    pub right_wheels: Option<WheelBank>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WheelBank {
    #[serde(default)]
    pub pins: BankPins,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BankPins {
    pub ena: Option<Pin>,
    pub in1: Option<Pin>,
    pub in2: Option<Pin>,
    pub in3: Option<Pin>,
    pub in4: Option<Pin>,
    pub enb: Option<Pin>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Motors {
    pub camera_gimbal: Option<Gimbal>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Gimbal {
    #[serde(default)]
    pub pins: GimbalPins,
    #[serde(default)]
    pub params: GimbalParams,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GimbalPins {
    pub in1: Option<Pin>,
    pub in2: Option<Pin>,
    pub in3: Option<Pin>,
    pub in4: Option<Pin>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GimbalParams {
    pub steps_per_revolution: Option<u32>,
}

/// Pins of one H-bridge channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPins {
    pub enable: Pin,
    pub dir1: Pin,
    pub dir2: Pin,
}

/// Validated pins for one dual-channel driver. Channel B is decided here,
/// once; drivers never look at raw optional fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HBridgePins {
    pub channel_a: ChannelPins,
    pub channel_b: Option<ChannelPins>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepperPins {
    pub coils: [Pin; 4],
    pub steps_per_rev: u32,
}

/// Validated configuration handed to [`crate::tank::TankController`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TankConfig {
    pub left: HBridgePins,
    pub right: HBridgePins,
    pub turret: StepperPins,
    pub pwm_frequency: u32,
}

fn require(value: Option<Pin>, role: &str) -> Result<Pin> {
    value.ok_or_else(|| TankError::ConfigurationMissing {
        role: role.to_string(),
    })
}

impl BankPins {
    fn validate(&self, bank: &str) -> Result<HBridgePins> {
        let channel_a = ChannelPins {
            enable: require(self.ena, &format!("{bank}.ena"))?,
            dir1: require(self.in1, &format!("{bank}.in1"))?,
            dir2: require(self.in2, &format!("{bank}.in2"))?,
        };

        let channel_b = match (self.enb, self.in3, self.in4) {
            (Some(enable), Some(dir1), Some(dir2)) => Some(ChannelPins { enable, dir1, dir2 }),
            (None, None, None) => None,
            _ => {
                warn!(
                    "{} channel B is only partially wired (enb={:?}, in3={:?}, in4={:?}), ignoring it",
                    bank, self.enb, self.in3, self.in4
                );
                None
            }
        };

        Ok(HBridgePins {
            channel_a,
            channel_b,
        })
    }
}

impl PinMap {
    /// Resolve the raw map into a [`TankConfig`], failing on the first
    /// missing required pin
    pub fn validate(&self) -> Result<TankConfig> {
        let left = self
            .mobility
            .left_wheels
            .as_ref()
            .map(|bank| &bank.pins)
            .ok_or_else(|| missing("left_wheels"))?
            .validate("left_wheels")?;
        let right = self
            .mobility
            .right_wheels
            .as_ref()
            .map(|bank| &bank.pins)
            .ok_or_else(|| missing("right_wheels"))?
            .validate("right_wheels")?;

        let gimbal = self
            .motors
            .camera_gimbal
            .as_ref()
            .ok_or_else(|| missing("camera_gimbal"))?;
        let coils = [
            require(gimbal.pins.in1, "camera_gimbal.in1")?,
            require(gimbal.pins.in2, "camera_gimbal.in2")?,
            require(gimbal.pins.in3, "camera_gimbal.in3")?,
            require(gimbal.pins.in4, "camera_gimbal.in4")?,
        ];
        let steps_per_rev = gimbal
            .params
            .steps_per_revolution
            .unwrap_or(DEFAULT_STEPS_PER_REV);

        let config = TankConfig {
            left,
            right,
            turret: StepperPins {
                coils,
                steps_per_rev,
            },
            pwm_frequency: self.pwm_frequency.unwrap_or(DEFAULT_PWM_FREQUENCY_HZ),
        };
        config.check()?;
        Ok(config)
    }
}

fn missing(role: &str) -> TankError {
    TankError::ConfigurationMissing {
        role: role.to_string(),
    }
}

impl HBridgePins {
    /// Every pin this driver claims, channel A first
    pub fn all(&self) -> Vec<Pin> {
        let mut pins = vec![
            self.channel_a.enable,
            self.channel_a.dir1,
            self.channel_a.dir2,
        ];
        if let Some(b) = self.channel_b {
            pins.extend([b.enable, b.dir1, b.dir2]);
        }
        pins
    }
}

impl TankConfig {
    /// Reject configurations that would claim a pin twice or never step
    pub fn check(&self) -> Result<()> {
        if self.turret.steps_per_rev == 0 {
            return Err(TankError::InvalidConfiguration(
                "steps_per_revolution must be non-zero".to_string(),
            ));
        }
        if self.pwm_frequency == 0 {
            return Err(TankError::InvalidConfiguration(
                "pwm_frequency must be non-zero".to_string(),
            ));
        }

        let mut owners: HashMap<Pin, &str> = HashMap::new();
        let claims = self
            .left
            .all()
            .into_iter()
            .map(|pin| (pin, "left_wheels"))
            .chain(self.right.all().into_iter().map(|pin| (pin, "right_wheels")))
            .chain(self.turret.coils.iter().map(|&pin| (pin, "camera_gimbal")));
        for (pin, owner) in claims {
            if let Some(previous) = owners.insert(pin, owner) {
                return Err(TankError::InvalidConfiguration(format!(
                    "pin {} assigned to both {} and {}",
                    pin, previous, owner
                )));
            }
        }
        Ok(())
    }
}
