//! Camera access for the rover.
//!
//! - `demux`: splits a raw MJPEG byte stream into complete JPEG frames
//! - `still`: one-shot image capture
//! - `stream`: the per-connection video stream session and its subprocess

pub mod demux;
pub mod still;
pub mod stream;

use serde::{Deserialize, Serialize};

pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;
pub const DEFAULT_FRAMERATE: u32 = 15;
pub const DEFAULT_QUALITY: u32 = 80;

/// Video stream parameters handed to the capture process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// JPEG quality, `0..=100`.
    pub quality: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            framerate: DEFAULT_FRAMERATE,
            quality: DEFAULT_QUALITY,
        }
    }
}

impl StreamConfig {
    /// Build a config from optional wire fields, filling in defaults.
    pub fn from_parts(
        width: Option<u32>,
        height: Option<u32>,
        framerate: Option<u32>,
        quality: Option<u32>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            width: width.unwrap_or(defaults.width),
            height: height.unwrap_or(defaults.height),
            framerate: framerate.unwrap_or(defaults.framerate),
            quality: quality.unwrap_or(defaults.quality),
        }
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.width == 0 || self.height == 0 {
            return Err("width and height must be positive");
        }
        if self.framerate == 0 {
            return Err("framerate must be positive");
        }
        if self.quality > 100 {
            return Err("quality must be within 0..=100");
        }
        Ok(())
    }
}
