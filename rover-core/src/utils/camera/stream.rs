//! Video stream session.
//!
//! A [`StreamSession`] owns at most one video process per connection. The
//! process output is pumped through the frame demuxer by a separate task and
//! every frame is queued on the connection's [`Outbox`]. Stopping cancels the
//! pump and waits for it; the pump itself terminates and reaps the process.
//!
//! ```text
//! Idle --start--> Starting --spawned--> Running --stop | eof | send failure--> Stopping --reaped--> Idle
//! ```

use std::{
    io::{self, ErrorKind},
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStderr, ChildStdout, Command},
    sync::watch,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use super::{
    demux::{DemuxError, FrameDemuxer, FrameReader, Markers, DEFAULT_MAX_BUFFER},
    StreamConfig,
};
use crate::utils::connection::{
    outbox::Outbox,
    protocol::{CommandError, FrameMessage},
};

/// How long a video process gets to exit after SIGTERM.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);
/// Extra time granted to the pump on top of the stop timeout before it is aborted.
const REAP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Launch primitive for the video process.
///
/// The returned child must have stdout piped; stderr is optional.
pub trait VideoLauncher: Send + Sync + 'static {
    fn launch(
        &self,
        config: &StreamConfig,
    ) -> io::Result<Child>;
}

/// `rpicam-vid` writing MJPEG to stdout.
#[derive(Debug, Clone)]
pub struct RpicamVid {
    program: PathBuf,
    leading: Vec<String>,
}

impl Default for RpicamVid {
    fn default() -> Self {
        Self::new("rpicam-vid")
    }
}

impl RpicamVid {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading: Vec::new(),
        }
    }

    /// Arguments placed before the video arguments, e.g. a wrapper script.
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

    pub fn args(config: &StreamConfig) -> Vec<String> {
        vec![
            "-t".into(),
            "0".into(),
            "--width".into(),
            config.width.to_string(),
            "--height".into(),
            config.height.to_string(),
            "--framerate".into(),
            config.framerate.to_string(),
            "--quality".into(),
            config.quality.to_string(),
            "--codec".into(),
            "mjpeg".into(),
            "--nopreview".into(),
            "-o".into(),
            "-".into(),
        ]
    }
}

impl VideoLauncher for RpicamVid {
    fn launch(
        &self,
        config: &StreamConfig,
    ) -> io::Result<Child> {
        let args = Self::args(config);
        tracing::info!(
            program = %self.program.display(),
            width = config.width,
            height = config.height,
            framerate = config.framerate,
            quality = config.quality,
            "starting video process"
        );
        tracing::debug!(?args, "video process arguments");

        Command::new(&self.program)
            .args(&self.leading)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Tunables for stopping a stream and bounding its buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    pub stop_timeout: Duration,
    pub max_buffer: usize,
    pub markers: Markers,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            max_buffer: DEFAULT_MAX_BUFFER,
            markers: Markers::JPEG,
        }
    }
}

impl StreamLimits {
    pub fn new(
        stop_timeout: Option<Duration>,
        max_buffer: Option<usize>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            stop_timeout: stop_timeout.unwrap_or(defaults.stop_timeout),
            max_buffer: max_buffer.unwrap_or(defaults.max_buffer),
            markers: defaults.markers,
        }
    }

    /// Longest a stop may take: the SIGTERM window plus the pump's grace.
    pub fn stop_budget(&self) -> Duration {
        self.stop_timeout + REAP_GRACE
    }
}

/// A running video process and the frame reader over its stdout.
///
/// Dropping it kills the process; [`VideoProcess::terminate`] asks first.
pub struct VideoProcess {
    child: Child,
    frames: FrameReader<ChildStdout>,
}

impl VideoProcess {
    pub fn launch(
        launcher: &dyn VideoLauncher,
        config: &StreamConfig,
        limits: &StreamLimits,
    ) -> Result<Self, CommandError> {
        let mut child = launcher.launch(config).map_err(|error| {
            tracing::error!(%error, "failed to start video process");
            if error.kind() == ErrorKind::NotFound {
                CommandError::SubprocessUnavailable("video capture program not found".into())
            } else {
                CommandError::SubprocessUnavailable(format!("failed to start video process: {error}"))
            }
        })?;

        let Some(stdout) = child.stdout.take() else {
            // kill_on_drop reaps it
            return Err(CommandError::SubprocessUnavailable(
                "video process has no output pipe".into(),
            ));
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, child.id()));
        }

        let demuxer = FrameDemuxer::new(limits.markers).with_max_buffer(limits.max_buffer);
        Ok(Self {
            child,
            frames: FrameReader::new(stdout, demuxer),
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Next complete frame, `None` once the process closes its output.
    ///
    /// Cancel safe.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, DemuxError> {
        self.frames.next_frame().await
    }

    /// SIGTERM, wait up to `timeout`, then SIGKILL.
    pub async fn terminate(
        self,
        timeout: Duration,
    ) -> Option<ExitStatus> {
        let Self { mut child, frames } = self;
        drop(frames);
        terminate(&mut child, timeout).await
    }
}

async fn forward_stderr(
    stderr: ChildStderr,
    pid: Option<u32>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(?pid, %line, "video process stderr");
    }
}

/// Ask `child` to exit, escalating to a kill after `timeout`.
pub async fn terminate(
    child: &mut Child,
    timeout: Duration,
) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    if let Some(pid) = child.id() {
        // SAFETY: `pid` is our own child and has not been reaped yet, so it
        // still names that process.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            tracing::debug!(pid, error = %io::Error::last_os_error(), "SIGTERM failed");
        }
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(error)) => {
            tracing::warn!(%error, "failed to wait for video process");
            None
        }
        Err(_) => {
            tracing::warn!(?timeout, "video process ignored SIGTERM, killing it");
            match child.kill().await {
                Ok(()) => child.try_wait().ok().flatten(),
                Err(error) => {
                    tracing::error!(%error, "failed to kill video process");
                    None
                }
            }
        }
    }
}

/// Why a pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    Cancelled,
    SourceClosed,
    PeerGone,
    Overflow,
    SourceFailed,
}

struct ActivePump {
    cancel: CancellationToken,
    task: JoinHandle<PumpExit>,
    config: StreamConfig,
    pid: Option<u32>,
}

/// Per-connection owner of the video process.
pub struct StreamSession {
    launcher: Arc<dyn VideoLauncher>,
    outbox: Outbox,
    limits: StreamLimits,
    state: Arc<watch::Sender<StreamState>>,
    active: Option<ActivePump>,
}

impl StreamSession {
    pub fn new(
        launcher: Arc<dyn VideoLauncher>,
        outbox: Outbox,
        limits: StreamLimits,
    ) -> Self {
        let (state, _) = watch::channel(StreamState::Idle);
        Self {
            launcher,
            outbox,
            limits,
            state: Arc::new(state),
            active: None,
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == StreamState::Running
    }

    /// Observe state changes, including the pump stopping on its own.
    pub fn watch(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    /// Config of the running stream.
    pub fn config(&self) -> Option<StreamConfig> {
        self.live().map(|active| active.config)
    }

    pub fn process_id(&self) -> Option<u32> {
        self.live().and_then(|active| active.pid)
    }

    fn live(&self) -> Option<&ActivePump> {
        match self.state() {
            StreamState::Idle => None,
            _ => self.active.as_ref(),
        }
    }

    /// Launch the video process and start pumping frames.
    ///
    /// Returns as soon as the process is spawned.
    pub async fn start(
        &mut self,
        config: StreamConfig,
    ) -> Result<(), CommandError> {
        if matches!(self.state(), StreamState::Starting | StreamState::Running) {
            return Err(CommandError::StreamConflict);
        }
        // a pump that ended on its own, or is still winding down
        if let Some(active) = self.active.as_mut() {
            reap(active, self.limits.stop_budget()).await;
            self.active = None;
        }

        self.state.send_replace(StreamState::Starting);
        let process = match VideoProcess::launch(self.launcher.as_ref(), &config, &self.limits) {
            Ok(process) => process,
            Err(error) => {
                self.state.send_replace(StreamState::Idle);
                return Err(error);
            }
        };
        let pid = process.id();

        let cancel = CancellationToken::new();
        self.state.send_replace(StreamState::Running);
        let task = tokio::spawn(pump(
            process,
            self.outbox.clone(),
            cancel.clone(),
            self.state.clone(),
            self.limits.stop_timeout,
        ));
        tracing::info!(?pid, ?config, "video stream started");

        self.active = Some(ActivePump {
            cancel,
            task,
            config,
            pid,
        });
        Ok(())
    }

    /// Stop the stream and wait for the process to be reaped.
    ///
    /// Safe to call at any time; without a stream it does nothing. Cancel
    /// safe: if the future is dropped the pump stays owned here, and the next
    /// `stop` waits for it again.
    pub async fn stop(&mut self) -> Option<PumpExit> {
        let Some(active) = self.active.as_mut() else {
            self.state.send_replace(StreamState::Idle);
            return None;
        };

        self.state.send_replace(StreamState::Stopping);
        active.cancel.cancel();
        let exit = reap(active, self.limits.stop_budget()).await;
        self.active = None;
        self.state.send_replace(StreamState::Idle);
        exit
    }

    /// Cancel the pump without waiting. It still terminates the process.
    pub fn abandon(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
        }
    }
}

async fn reap(
    active: &mut ActivePump,
    budget: Duration,
) -> Option<PumpExit> {
    match tokio::time::timeout(budget, &mut active.task).await {
        Ok(Ok(exit)) => Some(exit),
        Ok(Err(error)) => {
            tracing::error!(%error, "stream pump failed");
            None
        }
        Err(_) => {
            // dropping the pump's Child kills the process
            tracing::warn!(?budget, pid = ?active.pid, "stream pump did not finish, aborting");
            active.task.abort();
            None
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.abandon();
    }
}

async fn pump(
    mut process: VideoProcess,
    outbox: Outbox,
    cancel: CancellationToken,
    state: Arc<watch::Sender<StreamState>>,
    stop_timeout: Duration,
) -> PumpExit {
    let mut sent: u64 = 0;

    let exit = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break PumpExit::Cancelled,
            next = process.next_frame() => next,
        };

        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => break PumpExit::SourceClosed,
            Err(DemuxError::Overflow { limit }) => {
                tracing::warn!(limit, "video stream produced no frame within the buffer limit");
                break PumpExit::Overflow;
            }
            Err(DemuxError::Io(error)) => {
                tracing::warn!(%error, "reading video process output failed");
                break PumpExit::SourceFailed;
            }
        };

        let message = FrameMessage::new(&frame, sent);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break PumpExit::Cancelled,
            result = outbox.send(&message) => result,
        };
        if let Err(error) = result {
            let error = frame_send_failure(error, sent);
            tracing::warn!(%error, "stopping stream");
            break PumpExit::PeerGone;
        }
        sent += 1;
    };

    state.send_replace(StreamState::Stopping);
    let status = process.terminate(stop_timeout).await;
    state.send_replace(StreamState::Idle);
    tracing::info!(?exit, ?status, frames = sent, "video stream stopped");
    exit
}

/// A frame that cannot be queued ends only the stream, never the session.
fn frame_send_failure(
    error: CommandError,
    frame: u64,
) -> CommandError {
    match error {
        CommandError::TransientIo(_) => error,
        other => CommandError::TransientIo(format!("frame {frame}: {other}")),
    }
}
