//! PCA9685-backed motor actuation for the rover.
//!
//! The two H-bridge channels are driven through a PCA9685 I2C PWM expander:
//! per side one *phase* channel selects the direction and one *enable* channel
//! carries the 12-bit duty.

use embedded_hal::i2c::I2c;
use pwm_pca9685::{Address as PwmAddress, Channel, Pca9685};

use super::actuator::{split_duty, ActuatorError, MotorActuator, Rotation};

/// Default I2C address of the PWM expander.
pub const DEFAULT_PWM_ADDRESS: u8 = 0x40;

/// Full-scale value of a PCA9685 channel.
const MAX_DUTY: u16 = 4095;

/// High-level driver for the two drive motors behind a PCA9685.
pub struct Pca9685Actuator<I2C> {
    pwm: Pca9685<I2C>,
    /// `(phase, enable)` per side, left first.
    motor_channels: [(Channel, Channel); 2],
    inverted: [bool; 2],
}

impl<I2C, E> Pca9685Actuator<I2C>
where
    I2C: I2c<Error = E>,
    E: core::fmt::Debug,
{
    /// Create the actuator on `i2c` at `address`, left motor on C0/C1 and
    /// right motor on C2/C3.
    pub fn new(
        i2c: I2C,
        address: u8,
    ) -> Result<Self, ActuatorError> {
        let pwm = Pca9685::new(i2c, PwmAddress::from(address)).map_err(ActuatorError::from_debug)?;
        Ok(Self {
            pwm,
            motor_channels: [(Channel::C0, Channel::C1), (Channel::C2, Channel::C3)],
            inverted: [false, false],
        })
    }

    /// Override the `(phase, enable)` channel pairs, left first.
    pub fn with_channels(
        mut self,
        left: (Channel, Channel),
        right: (Channel, Channel),
    ) -> Self {
        self.motor_channels = [left, right];
        self
    }

    /// Swap the forward/backward wiring per side.
    pub fn with_inverted(
        mut self,
        left: bool,
        right: bool,
    ) -> Self {
        self.inverted = [left, right];
        self
    }

    /// Enable the oscillator and set the prescale for ~60 Hz.
    pub fn configure(&mut self) -> Result<(), ActuatorError> {
        self.pwm.enable().map_err(ActuatorError::from_debug)?;
        tracing::info!("PWM enabled");
        self.pwm
            .set_prescale(100)
            .map_err(ActuatorError::from_debug)?;
        tracing::info!("PWM prescale set to 60Hz");
        Ok(())
    }

    /// Put the expander to sleep. Outputs stay at their last value.
    pub fn disable(&mut self) -> Result<(), ActuatorError> {
        self.pwm.disable().map_err(ActuatorError::from_debug)
    }

    /// Release the underlying bus.
    pub fn destroy(self) -> I2C {
        self.pwm.destroy()
    }

    fn apply_side(
        &mut self,
        index: usize,
        duty: f32,
    ) -> Result<(), ActuatorError> {
        let (phase_channel, enable_channel) = self.motor_channels[index];
        let (rotation, magnitude) = split_duty(duty, self.inverted[index]);
        let phase = match rotation {
            Rotation::Forward => 0,
            Rotation::Reverse => MAX_DUTY,
        };
        let enable = (magnitude / 100.0 * f32::from(MAX_DUTY)) as u16;

        self.pwm
            .set_channel_on_off(phase_channel, 0, phase)
            .map_err(ActuatorError::from_debug)?;
        self.pwm
            .set_channel_on_off(enable_channel, 0, enable)
            .map_err(ActuatorError::from_debug)
    }
}

impl<I2C, E> MotorActuator for Pca9685Actuator<I2C>
where
    I2C: I2c<Error = E> + Send + 'static,
    E: core::fmt::Debug,
{
    fn drive(
        &mut self,
        left_duty: f32,
        right_duty: f32,
    ) -> Result<(), ActuatorError> {
        self.apply_side(0, left_duty)?;
        self.apply_side(1, right_duty)
    }

    fn stop(&mut self) -> Result<(), ActuatorError> {
        for index in 0..self.motor_channels.len() {
            let (phase_channel, enable_channel) = self.motor_channels[index];
            self.pwm
                .set_channel_on_off(enable_channel, 0, 0)
                .map_err(ActuatorError::from_debug)?;
            self.pwm
                .set_channel_on_off(phase_channel, 0, 0)
                .map_err(ActuatorError::from_debug)?;
        }
        Ok(())
    }
}
