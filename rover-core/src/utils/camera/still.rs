//! One-shot still capture.

use std::{io::ErrorKind, path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;
use tokio::process::Command;

use super::{DEFAULT_HEIGHT, DEFAULT_QUALITY, DEFAULT_WIDTH};

/// Wall-clock ceiling for one capture.
pub const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub width: u32,
    pub height: u32,
    pub quality: u32,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            quality: DEFAULT_QUALITY,
        }
    }
}

/// Result of a capture: base64 image data on success, a reason otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub width: u32,
    pub height: u32,
}

impl CaptureOutcome {
    pub fn captured(
        image: &[u8],
        request: CaptureRequest,
    ) -> Self {
        Self {
            success: true,
            data: Some(STANDARD.encode(image)),
            error: None,
            width: request.width,
            height: request.height,
        }
    }

    pub fn failed(
        error: impl Into<String>,
        request: CaptureRequest,
    ) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            width: request.width,
            height: request.height,
        }
    }
}

/// Anything that can take a single picture.
#[async_trait]
pub trait StillCamera: Send + Sync + 'static {
    async fn capture(
        &self,
        request: CaptureRequest,
    ) -> CaptureOutcome;
}

/// Still capture through `rpicam-still`, reading the JPEG from stdout.
#[derive(Debug, Clone)]
pub struct RpicamStill {
    program: PathBuf,
    leading: Vec<String>,
    timeout: Duration,
}

impl Default for RpicamStill {
    fn default() -> Self {
        Self::new("rpicam-still")
    }
}

impl RpicamStill {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading: Vec::new(),
            timeout: CAPTURE_TIMEOUT,
        }
    }

    /// Arguments placed before the capture arguments, e.g. a wrapper script.
    pub fn with_leading_args<I, S>(
        mut self,
        args: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn args(request: &CaptureRequest) -> Vec<String> {
        vec![
            "-o".into(),
            "-".into(),
            "--width".into(),
            request.width.to_string(),
            "--height".into(),
            request.height.to_string(),
            "--quality".into(),
            request.quality.to_string(),
            "--encoding".into(),
            "jpg".into(),
            "--nopreview".into(),
            // give the sensor a second to settle
            "--timeout".into(),
            "1000".into(),
        ]
    }
}

#[async_trait]
impl StillCamera for RpicamStill {
    async fn capture(
        &self,
        request: CaptureRequest,
    ) -> CaptureOutcome {
        let args = Self::args(&request);
        tracing::info!(
            program = %self.program.display(),
            width = request.width,
            height = request.height,
            quality = request.quality,
            "capturing image"
        );
        tracing::debug!(?args, "still capture arguments");

        let mut command = Command::new(&self.program);
        command
            .args(&self.leading)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Err(_) => {
                tracing::error!(timeout = ?self.timeout, "camera capture timed out");
                return CaptureOutcome::failed("capture timed out", request);
            }
            Ok(Err(error)) if error.kind() == ErrorKind::NotFound => {
                tracing::error!(program = %self.program.display(), "still capture program not found");
                return CaptureOutcome::failed(
                    format!("{} not found", self.program.display()),
                    request,
                );
            }
            Ok(Err(error)) => {
                tracing::error!(%error, "capture error");
                return CaptureOutcome::failed(error.to_string(), request);
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            tracing::error!(status = ?output.status, %stderr, "still capture failed");
            let reason = if stderr.is_empty() {
                "capture failed".to_owned()
            } else {
                stderr
            };
            return CaptureOutcome::failed(reason, request);
        }

        if output.stdout.is_empty() {
            return CaptureOutcome::failed("capture produced no data", request);
        }

        let outcome = CaptureOutcome::captured(&output.stdout, request);
        tracing::info!(
            bytes = output.stdout.len(),
            encoded = outcome.data.as_ref().map_or(0, String::len),
            "image captured"
        );
        outcome
    }
}
