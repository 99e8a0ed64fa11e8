//! JSON wire protocol for the control connection.
//!
//! Inbound messages look like `{"command": "<name>", ...fields}`; every one is
//! answered with a [`Reply`] carrying `"status": "ok" | "error"`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::camera::{still::CaptureRequest, StreamConfig};

/// Speed used by a `speed` command without a `value`.
pub const DEFAULT_SPEED_VALUE: f64 = 75.0;

/// Errors a command can produce. All but `ConnectionClosed` are reported to
/// the sender as an error reply and the session carries on.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Malformed message or missing/invalid field.
    #[error("{0}")]
    Protocol(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("stream already running")]
    StreamConflict,
    /// Capture or stream backend missing or failed to launch.
    #[error("{0}")]
    SubprocessUnavailable(String),
    /// Sending to the peer failed mid-stream.
    #[error("send failed: {0}")]
    TransientIo(String),
    #[error("connection closed")]
    ConnectionClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamAction {
    Start,
    Stop,
}

/// Every command the session understands, tagged by `command`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
    Speed {
        #[serde(default)]
        value: Option<f64>,
    },
    SpeedUp {
        #[serde(default)]
        step: Option<u8>,
    },
    SpeedDown {
        #[serde(default)]
        step: Option<u8>,
    },
    Joystick {
        #[serde(default)]
        x: f32,
        #[serde(default)]
        y: f32,
    },
    Capture {
        #[serde(default)]
        width: Option<u32>,
        #[serde(default)]
        height: Option<u32>,
        #[serde(default)]
        quality: Option<u32>,
    },
    Stream {
        action: StreamAction,
        #[serde(default)]
        width: Option<u32>,
        #[serde(default)]
        height: Option<u32>,
        #[serde(default)]
        framerate: Option<u32>,
        #[serde(default)]
        quality: Option<u32>,
    },
}

impl ControlCommand {
    /// Every accepted `command` tag.
    pub const NAMES: &'static [&'static str] = &[
        "forward",
        "backward",
        "left",
        "right",
        "stop",
        "speed",
        "speed_up",
        "speed_down",
        "joystick",
        "capture",
        "stream",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::Forward => "forward",
            ControlCommand::Backward => "backward",
            ControlCommand::Left => "left",
            ControlCommand::Right => "right",
            ControlCommand::Stop => "stop",
            ControlCommand::Speed { .. } => "speed",
            ControlCommand::SpeedUp { .. } => "speed_up",
            ControlCommand::SpeedDown { .. } => "speed_down",
            ControlCommand::Joystick { .. } => "joystick",
            ControlCommand::Capture { .. } => "capture",
            ControlCommand::Stream { .. } => "stream",
        }
    }

    /// Capture parameters with defaults applied.
    pub fn capture_request(
        width: Option<u32>,
        height: Option<u32>,
        quality: Option<u32>,
    ) -> Result<CaptureRequest, CommandError> {
        let defaults = CaptureRequest::default();
        let request = CaptureRequest {
            width: width.unwrap_or(defaults.width),
            height: height.unwrap_or(defaults.height),
            quality: quality.unwrap_or(defaults.quality),
        };
        if request.width == 0 || request.height == 0 || request.quality > 100 {
            return Err(CommandError::Protocol("invalid capture parameters".into()));
        }
        Ok(request)
    }

    /// Stream parameters with defaults applied.
    pub fn stream_config(
        width: Option<u32>,
        height: Option<u32>,
        framerate: Option<u32>,
        quality: Option<u32>,
    ) -> Result<StreamConfig, CommandError> {
        let config = StreamConfig::from_parts(width, height, framerate, quality);
        config
            .validate()
            .map_err(|reason| CommandError::Protocol(format!("invalid stream config: {reason}")))?;
        Ok(config)
    }
}

/// A message that could not be turned into a [`ControlCommand`].
#[derive(Debug)]
pub struct Rejected {
    /// The `command` tag, when one could be read.
    pub command: Option<String>,
    pub error: CommandError,
}

/// Decode one inbound text message.
///
/// The tag is checked against [`ControlCommand::NAMES`] before the fields are
/// parsed, so an unknown command is told apart from a known command with bad
/// fields.
pub fn decode(text: &str) -> Result<ControlCommand, Rejected> {
    let value: Value = serde_json::from_str(text).map_err(|_| Rejected {
        command: None,
        error: CommandError::Protocol("invalid JSON".into()),
    })?;

    let name = match value.get("command").and_then(Value::as_str) {
        Some(name) if !name.is_empty() => name.to_owned(),
        _ => {
            return Err(Rejected {
                command: None,
                error: CommandError::Protocol("missing command".into()),
            })
        }
    };

    if !ControlCommand::NAMES.contains(&name.as_str()) {
        return Err(Rejected {
            error: CommandError::UnknownCommand(name.clone()),
            command: Some(name),
        });
    }

    serde_json::from_value(value).map_err(|error| Rejected {
        error: CommandError::Protocol(format!("invalid {name} command: {error}")),
        command: Some(name),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Error,
}

/// Acknowledgment sent for every inbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(flatten)]
    pub body: ReplyBody,
}

/// Command-specific reply fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReplyBody {
    Drive {
        speed: u8,
    },
    Joystick {
        speed: u8,
        left_motor: f32,
        right_motor: f32,
    },
    Stream {
        speed: u8,
        action: StreamAction,
        streaming: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        config: Option<StreamConfig>,
    },
    Capture {
        speed: u8,
        data: String,
        width: u32,
        height: u32,
    },
    Error {
        message: String,
    },
}

impl Reply {
    pub fn ok(
        command: &str,
        body: ReplyBody,
    ) -> Self {
        Self {
            status: Status::Ok,
            command: Some(command.to_owned()),
            body,
        }
    }

    pub fn error(
        command: Option<String>,
        error: &CommandError,
    ) -> Self {
        Self {
            status: Status::Error,
            command,
            body: ReplyBody::Error {
                message: error.to_string(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Streamed video frame: `{"type": "frame", "data": <base64>, "frame": n}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: String,
    pub frame: u64,
}

impl FrameMessage {
    pub fn new(
        jpeg: &[u8],
        frame: u64,
    ) -> Self {
        use base64::{engine::general_purpose::STANDARD, Engine};

        Self {
            kind: "frame",
            data: STANDARD.encode(jpeg),
            frame,
        }
    }
}
