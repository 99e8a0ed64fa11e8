//! Joystick mixing for a two-motor differential-drive base.
//!
//! `JoystickMixer` turns a stick position `(x, y)` into a pair of normalized
//! side commands `(left, right)` in `[-1, 1]`, which the drive state scales by
//! the current speed.
//!
//! # Example
//! ```rust
//! use rover_core::utils::math::mixing::{JoystickMixer, MixPolicy};
//! let mixer = JoystickMixer::new(0.05, MixPolicy::Clamp);
//! assert_eq!(mixer.mix(1.0, 0.0), (1.0, -1.0));
//! ```

use core::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Default dead-zone radius around the stick centre.
pub const DEFAULT_DEAD_ZONE: f32 = 0.05;

/// How combined forward + turn inputs are brought back into `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixPolicy {
    /// Clamp each side independently. Full forward + full turn saturates the
    /// outer wheel and changes the turn ratio.
    Clamp,
    /// Divide both sides by `max(|left|, |right|, 1)`, keeping the turn ratio.
    #[default]
    Scale,
}

impl fmt::Display for MixPolicy {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            MixPolicy::Clamp => f.write_str("clamp"),
            MixPolicy::Scale => f.write_str("scale"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown mix policy `{0}` (expected `clamp` or `scale`)")]
pub struct UnknownPolicy(String);

impl FromStr for MixPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clamp" => Ok(MixPolicy::Clamp),
            "scale" => Ok(MixPolicy::Scale),
            other => Err(UnknownPolicy(other.to_owned())),
        }
    }
}

/// Maps stick positions to normalized differential side commands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JoystickMixer {
    /// Radius of the centre region treated as exactly zero.
    dead_zone: f32,
    policy: MixPolicy,
}

impl Default for JoystickMixer {
    fn default() -> Self {
        Self::new(DEFAULT_DEAD_ZONE, MixPolicy::default())
    }
}

impl JoystickMixer {
    /// Instantiate with a dead-zone radius and a normalization policy.
    pub fn new(
        dead_zone: f32,
        policy: MixPolicy,
    ) -> Self {
        Self {
            dead_zone: sanitize(dead_zone).abs(),
            policy,
        }
    }

    pub fn dead_zone(&self) -> f32 {
        self.dead_zone
    }

    pub fn policy(&self) -> MixPolicy {
        self.policy
    }

    /// Mix a stick position into `(left, right)`, each in `[-1, 1]`.
    ///
    /// Inputs are clamped to `[-1, 1]` first. Positions with
    /// `x² + y² < dead_zone²` produce exactly `(0, 0)`.
    pub fn mix(
        &self,
        x: f32,
        y: f32,
    ) -> (f32, f32) {
        let x = sanitize(x).clamp(-1.0, 1.0);
        let y = sanitize(y).clamp(-1.0, 1.0);

        if x * x + y * y < self.dead_zone * self.dead_zone {
            return (0.0, 0.0);
        }

        let left = y + x;
        let right = y - x;

        match self.policy {
            MixPolicy::Clamp => (left.clamp(-1.0, 1.0), right.clamp(-1.0, 1.0)),
            MixPolicy::Scale => {
                let max = left.abs().max(right.abs()).max(1.0);
                (left / max, right / max)
            }
        }
    }

    /// Mix a stick position and scale it by `speed` (percent), giving signed
    /// duties in `[-speed, speed]`.
    pub fn duties(
        &self,
        x: f32,
        y: f32,
        speed: u8,
    ) -> (f32, f32) {
        let (left, right) = self.mix(x, y);
        let speed = f32::from(speed);
        (left * speed, right * speed)
    }
}

/// Round to one decimal place for reporting.
pub fn round_tenth(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

fn sanitize(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v
    }
}
