// Dual-channel H-bridge driver (L298N style)
//
// Each channel is an enable line driven by PWM plus two direction pins.
// Channel B is optional and decided at construction; calls addressed to a
// missing channel are silent no-ops.

use tracing::{debug, info, warn};

use crate::backend::{Backend, Level, OutputPin, PwmChannel};
use crate::config::{ChannelPins, HBridgePins};
use crate::error::Result;

/// Channel selector on one H-bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    A,
    B,
}

/// Spin direction of a DC channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Forward,
    Backward,
    #[default]
    Stopped,
}

/// Observable state of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelState {
    pub direction: Direction,
    pub duty: u8,
}

struct HBridgeChannel {
    enable: PwmChannel,
    dir1: OutputPin,
    dir2: OutputPin,
    state: ChannelState,
}

impl HBridgeChannel {
    fn new(backend: &Backend, pins: ChannelPins, frequency: u32) -> Result<Self> {
        let dir1 = backend.output(pins.dir1)?;
        let dir2 = backend.output(pins.dir2)?;
        let mut enable = backend.pwm(pins.enable, frequency)?;
        enable.start(0)?;
        Ok(Self {
            enable,
            dir1,
            dir2,
            state: ChannelState::default(),
        })
    }

    // The pin being de-asserted is always written first, so a reversal
    // passes through "both LOW" and never "both HIGH". Duty follows the
    // direction pins.
    fn drive(&mut self, direction: Direction, duty: u8) -> Result<()> {
        let duty = duty.min(100);
        match direction {
            Direction::Forward => {
                self.dir2.set(Level::Low)?;
                self.dir1.set(Level::High)?;
            }
            Direction::Backward => {
                self.dir1.set(Level::Low)?;
                self.dir2.set(Level::High)?;
            }
            Direction::Stopped => {
                self.dir1.set(Level::Low)?;
                self.dir2.set(Level::Low)?;
            }
        }
        let duty = if direction == Direction::Stopped { 0 } else { duty };
        self.enable.change(duty)?;
        self.state = ChannelState { direction, duty };
        Ok(())
    }

    fn release(mut self) -> Result<()> {
        self.drive(Direction::Stopped, 0)?;
        self.enable.release()?;
        self.dir1.release()?;
        self.dir2.release()
    }
}

/// One H-bridge module driving up to two DC motors
pub struct DualMotorDriver {
    name: String,
    channel_a: HBridgeChannel,
    channel_b: Option<HBridgeChannel>,
}

impl DualMotorDriver {
    /// Claim the bridge's pins on `backend` and leave both channels stopped.
    /// Any failure drops (and frees) whatever was already claimed.
    pub fn new(name: &str, backend: &Backend, pins: HBridgePins, frequency: u32) -> Result<Self> {
        info!("Initializing H-bridge {} ({:?})", name, pins);
        let channel_a = HBridgeChannel::new(backend, pins.channel_a, frequency)?;
        let channel_b = pins
            .channel_b
            .map(|b| HBridgeChannel::new(backend, b, frequency))
            .transpose()?;
        if channel_b.is_none() {
            info!("{} has no channel B wired", name);
        }

        let mut driver = Self {
            name: name.to_string(),
            channel_a,
            channel_b,
        };
        driver.stop_all()?;
        Ok(driver)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `channel` was wired at construction
    pub fn has_channel(&self, channel: Channel) -> bool {
        match channel {
            Channel::A => true,
            Channel::B => self.channel_b.is_some(),
        }
    }

    fn channel_mut(&mut self, channel: Channel) -> Option<&mut HBridgeChannel> {
        match channel {
            Channel::A => Some(&mut self.channel_a),
            Channel::B => self.channel_b.as_mut(),
        }
    }

    fn drive(&mut self, channel: Channel, direction: Direction, speed: u8) -> Result<()> {
        if speed > 100 {
            warn!("{} speed {} clamped to 100", self.name, speed);
        }
        let name = self.name.clone();
        match self.channel_mut(channel) {
            Some(ch) => {
                debug!("{} channel {:?}: {:?} at {}%", name, channel, direction, speed.min(100));
                ch.drive(direction, speed)
            }
            None => {
                debug!("{} channel {:?} not wired, ignoring {:?}", name, channel, direction);
                Ok(())
            }
        }
    }

    /// Spin `channel` forward at `speed` percent
    pub fn forward(&mut self, channel: Channel, speed: u8) -> Result<()> {
        self.drive(channel, Direction::Forward, speed)
    }

    /// Spin `channel` backward at `speed` percent
    pub fn backward(&mut self, channel: Channel, speed: u8) -> Result<()> {
        self.drive(channel, Direction::Backward, speed)
    }

    /// Both direction pins LOW, duty 0
    pub fn stop(&mut self, channel: Channel) -> Result<()> {
        self.drive(channel, Direction::Stopped, 0)
    }

    pub fn stop_all(&mut self) -> Result<()> {
        self.stop(Channel::A)?;
        self.stop(Channel::B)
    }

    /// Current state of `channel`, `None` if it is not wired
    pub fn state(&self, channel: Channel) -> Option<ChannelState> {
        match channel {
            Channel::A => Some(self.channel_a.state),
            Channel::B => self.channel_b.as_ref().map(|ch| ch.state),
        }
    }

    /// Stop both channels, stop PWM and give every pin back
    pub fn release(self) -> Result<()> {
        info!("Releasing H-bridge {}", self.name);
        self.channel_a.release()?;
        if let Some(b) = self.channel_b {
            b.release()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        BackendKind, GpioProvider, PinEvent, PinMode, PwmOutput, SimLog, SimulatedGpio,
    };
    use crate::error::TankError;
    use proptest::prelude::*;
    use std::collections::HashMap;

    const FULL: HBridgePins = HBridgePins {
        channel_a: ChannelPins {
            enable: 12,
            dir1: 5,
            dir2: 6,
        },
        channel_b: Some(ChannelPins {
            enable: 18,
            dir1: 13,
            dir2: 19,
        }),
    };

    const A_ONLY: HBridgePins = HBridgePins {
        channel_a: FULL.channel_a,
        channel_b: None,
    };

    fn driver(pins: HBridgePins) -> (DualMotorDriver, SimLog, Backend) {
        let (backend, log) = Backend::simulated();
        let driver = DualMotorDriver::new("test", &backend, pins, 1000).unwrap();
        (driver, log, backend)
    }

    /// Replay the event log and fail if both direction pins were ever HIGH together
    fn assert_never_both_high(log: &SimLog, dir1: u32, dir2: u32) {
        let mut levels: HashMap<u32, Level> = HashMap::new();
        for event in log.events() {
            if let PinEvent::Write { pin, level } = event {
                levels.insert(pin, level);
                let both = levels.get(&dir1) == Some(&Level::High)
                    && levels.get(&dir2) == Some(&Level::High);
                assert!(!both, "pins {} and {} both HIGH", dir1, dir2);
            }
        }
    }

    #[test]
    fn test_new_claims_pins_and_starts_stopped() {
        let (driver, log, _backend) = driver(FULL);
        assert_eq!(log.claimed_count(), 6);
        assert_eq!(driver.state(Channel::A), Some(ChannelState::default()));
        assert_eq!(driver.state(Channel::B), Some(ChannelState::default()));
        assert!(log.pwm_running(12));
        assert_eq!(log.pwm_duty(12), Some(0));
    }

    #[test]
    fn test_forward_sets_pins_then_duty() {
        let (mut driver, log, _backend) = driver(FULL);
        log.clear_events();

        driver.forward(Channel::A, 50).unwrap();

        assert_eq!(log.level(5), Some(Level::High));
        assert_eq!(log.level(6), Some(Level::Low));
        assert_eq!(log.pwm_duty(12), Some(50));
        assert_eq!(
            driver.state(Channel::A),
            Some(ChannelState {
                direction: Direction::Forward,
                duty: 50
            })
        );
        // direction written before duty
        assert!(matches!(
            log.events().last(),
            Some(PinEvent::PwmDuty { pin: 12, duty: 50, .. })
        ));
    }

    #[test]
    fn test_backward_inverts_pins() {
        let (mut driver, log, _backend) = driver(FULL);
        driver.backward(Channel::B, 30).unwrap();
        assert_eq!(log.level(13), Some(Level::Low));
        assert_eq!(log.level(19), Some(Level::High));
        assert_eq!(log.pwm_duty(18), Some(30));
    }

    #[test]
    fn test_reversal_never_asserts_both_pins() {
        let (mut driver, log, _backend) = driver(FULL);
        driver.forward(Channel::A, 80).unwrap();
        driver.backward(Channel::A, 80).unwrap();
        driver.forward(Channel::A, 20).unwrap();
        assert_never_both_high(&log, 5, 6);
    }

    #[test]
    fn test_stop_all_clears_every_channel() {
        let (mut driver, log, _backend) = driver(FULL);
        driver.forward(Channel::A, 70).unwrap();
        driver.backward(Channel::B, 40).unwrap();

        driver.stop_all().unwrap();

        for ch in [Channel::A, Channel::B] {
            let state = driver.state(ch).unwrap();
            assert_eq!(state.direction, Direction::Stopped);
            assert_eq!(state.duty, 0);
        }
        for pin in [5, 6, 13, 19] {
            assert_eq!(log.level(pin), Some(Level::Low));
        }
        assert_eq!(log.pwm_duty(12), Some(0));
        assert_eq!(log.pwm_duty(18), Some(0));
    }

    #[test]
    fn test_missing_channel_b_is_noop() {
        let (mut driver, log, _backend) = driver(A_ONLY);
        assert_eq!(log.claimed_count(), 3);
        assert!(!driver.has_channel(Channel::B));
        log.clear_events();

        driver.forward(Channel::B, 60).unwrap();
        driver.backward(Channel::B, 60).unwrap();
        driver.stop(Channel::B).unwrap();

        assert!(log.events().is_empty());
        assert_eq!(driver.state(Channel::B), None);
    }

    #[test]
    fn test_speed_above_100_is_clamped() {
        let (mut driver, log, _backend) = driver(FULL);
        driver.forward(Channel::A, 250).unwrap();
        assert_eq!(driver.state(Channel::A).unwrap().duty, 100);
        assert_eq!(log.pwm_duty(12), Some(100));
    }

    #[test]
    fn test_release_frees_all_pins() {
        let (mut driver, log, backend) = driver(FULL);
        driver.forward(Channel::A, 50).unwrap();
        driver.release().unwrap();
        assert_eq!(log.claimed_count(), 0);
        assert_eq!(backend.pwm_count(), 0);
        assert!(!log.pwm_running(12));
    }

    /// Simulated provider that refuses to configure one pin
    struct RefusePin {
        inner: SimulatedGpio,
        refused: u32,
    }

    impl GpioProvider for RefusePin {
        fn kind(&self) -> BackendKind {
            BackendKind::Simulated
        }
        fn configure(&self, pin: u32, mode: PinMode) -> Result<()> {
            if pin == self.refused {
                return Err(TankError::ResourceUnavailable(format!("pin {} busy", pin)));
            }
            self.inner.configure(pin, mode)
        }
        fn write(&self, pin: u32, level: Level) -> Result<()> {
            self.inner.write(pin, level)
        }
        fn pwm(&self, pin: u32, frequency: u32) -> Result<Box<dyn PwmOutput>> {
            self.inner.pwm(pin, frequency)
        }
        fn free(&self, pin: u32) -> Result<()> {
            self.inner.free(pin)
        }
        fn close(&self) -> Result<()> {
            self.inner.close()
        }
    }

    #[test]
    fn test_failed_construction_frees_claimed_pins() {
        let inner = SimulatedGpio::new();
        let log = inner.log();
        let backend = Backend::from_provider(Box::new(RefusePin { inner, refused: 18 }));

        let result = DualMotorDriver::new("partial", &backend, FULL, 1000);

        assert!(matches!(result, Err(TankError::ResourceUnavailable(_))));
        assert_eq!(log.claimed_count(), 0);
        assert_eq!(backend.pwm_count(), 0);
    }

    #[test]
    fn test_construction_after_release_fails() {
        let (backend, log) = Backend::simulated();
        backend.release().unwrap();
        let result = DualMotorDriver::new("late", &backend, FULL, 1000);
        assert!(matches!(result, Err(TankError::UseAfterRelease)));
        assert_eq!(log.claimed_count(), 0);
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Forward(u8),
        Backward(u8),
        Stop,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..=100).prop_map(Op::Forward),
            (0u8..=100).prop_map(Op::Backward),
            Just(Op::Stop),
        ]
    }

    proptest! {
        #[test]
        fn direction_pins_are_exclusive(ops in proptest::collection::vec(op(), 1..40)) {
            let (mut driver, log, _backend) = driver(FULL);
            for op in ops {
                match op {
                    Op::Forward(s) => driver.forward(Channel::A, s).unwrap(),
                    Op::Backward(s) => driver.backward(Channel::A, s).unwrap(),
                    Op::Stop => driver.stop(Channel::A).unwrap(),
                }
                let state = driver.state(Channel::A).unwrap();
                if state.direction == Direction::Stopped {
                    prop_assert_eq!(state.duty, 0);
                }
            }
            assert_never_both_high(&log, 5, 6);

            driver.stop(Channel::A).unwrap();
            prop_assert_eq!(driver.state(Channel::A).unwrap(), ChannelState::default());
        }
    }
}
