//! Motor drive state for the rover.
//!
//! - `actuator`: the `MotorActuator` capability plus GPIO and logging backends
//! - `i2c`: a PCA9685-backed actuator
//!
//! `MotorDrive` holds the speed setting and turns high-level intents into
//! signed duty pairs for the actuator. It performs no I/O of its own.

pub mod actuator;
pub mod i2c;

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};

pub use actuator::{ActuatorError, HBridgeActuator, HBridgeSide, LogActuator, MotorActuator};
pub use i2c::Pca9685Actuator;

use crate::utils::math::mixing::{JoystickMixer, MixPolicy, DEFAULT_DEAD_ZONE};

/// Speed used when the process starts.
pub const DEFAULT_SPEED: u8 = 80;
/// Step used by `increase_speed` / `decrease_speed`.
pub const SPEED_STEP: u8 = 10;

/// Discrete drive intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
}

/// One drive request, either discrete or a differential duty pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriveCommand {
    Discrete(Direction),
    /// Signed duties in `[-100, 100]`, clamped before reaching the actuator.
    Differential { left: f32, right: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveConfig {
    pub default_speed: u8,
    pub dead_zone: f32,
    pub policy: MixPolicy,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            default_speed: DEFAULT_SPEED,
            dead_zone: DEFAULT_DEAD_ZONE,
            policy: MixPolicy::default(),
        }
    }
}

impl DriveConfig {
    pub fn new(
        default_speed: Option<u8>,
        dead_zone: Option<f32>,
        policy: Option<MixPolicy>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            default_speed: default_speed.unwrap_or(defaults.default_speed).min(100),
            dead_zone: dead_zone.unwrap_or(defaults.dead_zone),
            policy: policy.unwrap_or(defaults.policy),
        }
    }
}

/// Current speed setting plus the actuator it drives.
pub struct MotorDrive {
    /// Percent, always within `0..=100`.
    speed: u8,
    mixer: JoystickMixer,
    actuator: Box<dyn MotorActuator>,
}

impl MotorDrive {
    pub fn new(
        actuator: impl MotorActuator,
        config: DriveConfig,
    ) -> Self {
        Self {
            speed: config.default_speed.min(100),
            mixer: JoystickMixer::new(config.dead_zone, config.policy),
            actuator: Box::new(actuator),
        }
    }

    pub fn speed(&self) -> u8 {
        self.speed
    }

    pub fn mixer(&self) -> &JoystickMixer {
        &self.mixer
    }

    /// Store `pct` clamped to `0..=100` and return the stored value.
    pub fn set_speed(
        &mut self,
        pct: i64,
    ) -> u8 {
        self.speed = pct.clamp(0, 100) as u8;
        self.speed
    }

    pub fn increase_speed(
        &mut self,
        step: u8,
    ) -> u8 {
        self.set_speed(i64::from(self.speed) + i64::from(step))
    }

    pub fn decrease_speed(
        &mut self,
        step: u8,
    ) -> u8 {
        self.set_speed(i64::from(self.speed) - i64::from(step))
    }

    /// Execute a drive request and return the duty pair that was applied.
    pub fn apply(
        &mut self,
        command: DriveCommand,
    ) -> (f32, f32) {
        match command {
            DriveCommand::Discrete(direction) => self.apply_discrete(direction),
            DriveCommand::Differential { left, right } => self.apply_differential(left, right),
        }
    }

    pub fn apply_discrete(
        &mut self,
        direction: Direction,
    ) -> (f32, f32) {
        let s = f32::from(self.speed);
        let duties = match direction {
            Direction::Forward => (s, s),
            Direction::Backward => (-s, -s),
            Direction::Left => (-s, s),
            Direction::Right => (s, -s),
            Direction::Stop => {
                self.stop();
                return (0.0, 0.0);
            }
        };
        self.actuate(duties)
    }

    /// Clamp both duties into `[-100, 100]` and drive each side by its sign.
    pub fn apply_differential(
        &mut self,
        left_duty: f32,
        right_duty: f32,
    ) -> (f32, f32) {
        self.actuate((
            actuator::clamp_duty(left_duty),
            actuator::clamp_duty(right_duty),
        ))
    }

    /// Mix a stick position at the current speed and drive with the result.
    pub fn apply_joystick(
        &mut self,
        x: f32,
        y: f32,
    ) -> (f32, f32) {
        let (left, right) = self.mixer.duties(x, y, self.speed);
        self.apply_differential(left, right)
    }

    /// Zero the duties and release the direction outputs.
    pub fn stop(&mut self) {
        if let Err(error) = self.actuator.stop() {
            tracing::error!(%error, "motor stop failed");
        }
    }

    fn actuate(
        &mut self,
        (left, right): (f32, f32),
    ) -> (f32, f32) {
        if let Err(error) = self.actuator.drive(left, right) {
            tracing::error!(%error, left, right, "motor drive failed");
        }
        (left, right)
    }
}

/// Shared handle to the single `MotorDrive`.
///
/// The lock is only ever held for synchronous actuator calls, never across an
/// `.await`, so the cleanup path can always take it.
#[derive(Clone)]
pub struct DriveHandle {
    inner: Arc<Mutex<MotorDrive>>,
}

impl DriveHandle {
    pub fn new(drive: MotorDrive) -> Self {
        Self {
            inner: Arc::new(Mutex::new(drive)),
        }
    }

    /// Lock the drive. A poisoned lock is recovered: the state is plain data
    /// and stopping the motors must still be possible after a panic.
    pub fn lock(&self) -> MutexGuard<'_, MotorDrive> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn speed(&self) -> u8 {
        self.lock().speed()
    }

    pub fn stop(&self) {
        self.lock().stop();
    }

    /// Pulse each side forward at `duty` for `pulse`, then stop.
    pub async fn self_test(
        &self,
        duty: f32,
        pulse: Duration,
    ) {
        tracing::info!(duty, ?pulse, "running motor self-test");

        tracing::info!("self-test: left motor forward");
        self.lock().apply_differential(duty, 0.0);
        tokio::time::sleep(pulse).await;

        tracing::info!("self-test: right motor forward");
        self.lock().apply_differential(0.0, duty);
        tokio::time::sleep(pulse).await;

        self.stop();
        tracing::info!("self-test complete");
    }
}
