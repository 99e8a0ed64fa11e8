//! Motor actuation backends.
//!
//! `MotorActuator` is the seam between the drive state and the motor driver.
//! Duties are signed percentages in `[-100, 100]`: the sign selects the
//! direction wiring of that side, the magnitude sets the PWM duty.

use embedded_hal::{digital::OutputPin, pwm::SetDutyCycle};

/// Failure reported by an actuator backend.
#[derive(Debug, thiserror::Error)]
#[error("actuator fault: {0}")]
pub struct ActuatorError(pub String);

impl ActuatorError {
    pub fn from_debug<E: core::fmt::Debug>(error: E) -> Self {
        Self(format!("{error:?}"))
    }
}

/// Capability to move the two sides of a differential-drive base.
pub trait MotorActuator: Send + 'static {
    /// Drive both sides with signed duties in `[-100, 100]`.
    fn drive(
        &mut self,
        left_duty: f32,
        right_duty: f32,
    ) -> Result<(), ActuatorError>;

    /// Zero both duties and release all direction outputs.
    fn stop(&mut self) -> Result<(), ActuatorError>;
}

/// Direction wiring selected for one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Forward,
    Reverse,
}

/// Clamp a signed duty into `[-100, 100]`. NaN becomes 0.
pub fn clamp_duty(duty: f32) -> f32 {
    if duty.is_nan() {
        0.0
    } else {
        duty.clamp(-100.0, 100.0)
    }
}

/// Split a signed duty into wiring direction and magnitude (percent).
///
/// `inverted` flips the wiring for motors mounted or wired backwards.
pub fn split_duty(
    duty: f32,
    inverted: bool,
) -> (Rotation, f32) {
    let duty = clamp_duty(duty);
    let rotation = if (duty >= 0.0) != inverted {
        Rotation::Forward
    } else {
        Rotation::Reverse
    };
    (rotation, duty.abs())
}

/// Actuator that only logs. Used when no motor driver is attached.
#[derive(Debug, Default)]
pub struct LogActuator {
    last: Option<(f32, f32)>,
}

impl LogActuator {
    pub fn last(&self) -> Option<(f32, f32)> {
        self.last
    }
}

impl MotorActuator for LogActuator {
    fn drive(
        &mut self,
        left_duty: f32,
        right_duty: f32,
    ) -> Result<(), ActuatorError> {
        let left = split_duty(left_duty, false);
        let right = split_duty(right_duty, false);
        tracing::info!(?left, ?right, "motor drive");
        self.last = Some((clamp_duty(left_duty), clamp_duty(right_duty)));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ActuatorError> {
        tracing::info!("motor stop");
        self.last = Some((0.0, 0.0));
        Ok(())
    }
}

/// One side of an L298N-style H-bridge: two direction inputs and a PWM enable.
pub struct HBridgeSide<P, E> {
    in1: P,
    in2: P,
    enable: E,
    inverted: bool,
}

impl<P, E> HBridgeSide<P, E>
where
    P: OutputPin,
    E: SetDutyCycle,
{
    pub fn new(
        in1: P,
        in2: P,
        enable: E,
    ) -> Self {
        Self {
            in1,
            in2,
            enable,
            inverted: false,
        }
    }

    /// Swap the forward/backward wiring of this side.
    pub fn inverted(mut self) -> Self {
        self.inverted = !self.inverted;
        self
    }

    fn apply(
        &mut self,
        duty: f32,
    ) -> Result<(), ActuatorError> {
        let (rotation, magnitude) = split_duty(duty, self.inverted);
        match rotation {
            Rotation::Forward => {
                self.in1.set_high().map_err(ActuatorError::from_debug)?;
                self.in2.set_low().map_err(ActuatorError::from_debug)?;
            }
            Rotation::Reverse => {
                self.in1.set_low().map_err(ActuatorError::from_debug)?;
                self.in2.set_high().map_err(ActuatorError::from_debug)?;
            }
        }
        self.enable
            .set_duty_cycle_percent(magnitude.round() as u8)
            .map_err(ActuatorError::from_debug)
    }

    fn release(&mut self) -> Result<(), ActuatorError> {
        self.enable
            .set_duty_cycle_fully_off()
            .map_err(ActuatorError::from_debug)?;
        self.in1.set_low().map_err(ActuatorError::from_debug)?;
        self.in2.set_low().map_err(ActuatorError::from_debug)
    }

    pub fn into_parts(self) -> (P, P, E) {
        (self.in1, self.in2, self.enable)
    }
}

/// H-bridge motor driver wired straight to GPIO direction pins and PWM
/// enables.
pub struct HBridgeActuator<P, E> {
    left: HBridgeSide<P, E>,
    right: HBridgeSide<P, E>,
}

impl<P, E> HBridgeActuator<P, E>
where
    P: OutputPin,
    E: SetDutyCycle,
{
    pub fn new(
        left: HBridgeSide<P, E>,
        right: HBridgeSide<P, E>,
    ) -> Self {
        Self { left, right }
    }

    pub fn into_parts(self) -> (HBridgeSide<P, E>, HBridgeSide<P, E>) {
        (self.left, self.right)
    }
}

impl<P, E> MotorActuator for HBridgeActuator<P, E>
where
    P: OutputPin + Send + 'static,
    E: SetDutyCycle + Send + 'static,
{
    fn drive(
        &mut self,
        left_duty: f32,
        right_duty: f32,
    ) -> Result<(), ActuatorError> {
        self.left.apply(left_duty)?;
        self.right.apply(right_duty)
    }

    fn stop(&mut self) -> Result<(), ActuatorError> {
        self.left.release()?;
        self.right.release()
    }
}
