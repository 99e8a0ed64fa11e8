//! Utility re-exports for the rover.
//!
//! - `connection`: wire protocol, per-connection command sessions and the HTTP
//!   / WebSocket server
//! - `controllers`: motor drive state and actuator backends
//! - `camera`: still capture, the MJPEG frame demuxer and the stream session
//! - `math`: joystick mixing for differential drive
//! - `frontend`: the embedded viewer page

pub mod camera;
pub mod connection;
pub mod controllers;
pub(crate) mod frontend;
pub mod math;

pub use connection::server::run as serve;
pub use controllers::{DriveHandle, MotorDrive};
pub use math::mixing::JoystickMixer as mixer;
