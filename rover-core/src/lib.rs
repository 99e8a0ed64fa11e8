//! Core control and camera-streaming logic for a two-motor differential-drive
//! rover.
//!
//! The binary that wires this crate to a socket lives in `rover-app/rover-pi`.

pub mod utils;
