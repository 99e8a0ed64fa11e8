//! Math utilities for the rover.
//!
//! This module provides joystick-to-differential-drive mixing.

pub mod mixing;
