//! Per-connection command loop.
//!
//! A [`CommandSession`] decodes inbound messages, drives the motors or the
//! stream session, and queues one reply per message. Whatever ends the loop
//! (peer close, transport error, server shutdown, or the future being
//! dropped) the active stream is stopped first and the motors second.

use std::{fmt::Display, sync::Arc};

use futures_util::{Stream, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{
    outbox::Outbox,
    protocol::{self, CommandError, ControlCommand, Reply, ReplyBody, StreamAction},
};
use crate::utils::{
    camera::{
        still::StillCamera,
        stream::{StreamLimits, StreamSession, StreamState, VideoLauncher},
    },
    controllers::{Direction, DriveCommand, DriveHandle, SPEED_STEP},
    math::mixing::round_tenth,
};

/// A message read from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    PeerClosed,
    Shutdown,
    Transport(String),
}

pub struct CommandSession {
    drive: DriveHandle,
    stream: StreamSession,
    camera: Arc<dyn StillCamera>,
    outbox: Outbox,
    finished: bool,
}

impl CommandSession {
    pub fn new(
        drive: DriveHandle,
        launcher: Arc<dyn VideoLauncher>,
        camera: Arc<dyn StillCamera>,
        outbox: Outbox,
        limits: StreamLimits,
    ) -> Self {
        let stream = StreamSession::new(launcher, outbox.clone(), limits);
        Self {
            drive,
            stream,
            camera,
            outbox,
            finished: false,
        }
    }

    pub fn stream(&self) -> &StreamSession {
        &self.stream
    }

    /// Stream state of this connection, for outside observers.
    pub fn watch_stream(&self) -> watch::Receiver<StreamState> {
        self.stream.watch()
    }

    /// Decode and execute one message, producing its reply.
    pub async fn handle_text(
        &mut self,
        text: &str,
    ) -> Reply {
        let command = match protocol::decode(text) {
            Ok(command) => command,
            Err(rejected) => {
                tracing::warn!(error = %rejected.error, command = ?rejected.command, "rejected message");
                return Reply::error(rejected.command, &rejected.error);
            }
        };

        let name = command.name();
        tracing::info!(command = name, ?command, "command received");
        let reply = match self.dispatch(command).await {
            Ok(body) => Reply::ok(name, body),
            Err(error) => {
                tracing::warn!(command = name, %error, "command failed");
                Reply::error(Some(name.to_owned()), &error)
            }
        };
        tracing::debug!(?reply, "reply");
        reply
    }

    async fn dispatch(
        &mut self,
        command: ControlCommand,
    ) -> Result<ReplyBody, CommandError> {
        let body = match command {
            ControlCommand::Forward => self.discrete(Direction::Forward),
            ControlCommand::Backward => self.discrete(Direction::Backward),
            ControlCommand::Left => self.discrete(Direction::Left),
            ControlCommand::Right => self.discrete(Direction::Right),
            ControlCommand::Stop => self.discrete(Direction::Stop),
            ControlCommand::Speed { value } => {
                let value = value.unwrap_or(protocol::DEFAULT_SPEED_VALUE);
                let speed = self.drive.lock().set_speed(value as i64);
                ReplyBody::Drive { speed }
            }
            ControlCommand::SpeedUp { step } => {
                let speed = self.drive.lock().increase_speed(step.unwrap_or(SPEED_STEP));
                ReplyBody::Drive { speed }
            }
            ControlCommand::SpeedDown { step } => {
                let speed = self.drive.lock().decrease_speed(step.unwrap_or(SPEED_STEP));
                ReplyBody::Drive { speed }
            }
            ControlCommand::Joystick { x, y } => {
                let mut drive = self.drive.lock();
                let (left, right) = drive.apply_joystick(x, y);
                ReplyBody::Joystick {
                    speed: drive.speed(),
                    left_motor: round_tenth(left),
                    right_motor: round_tenth(right),
                }
            }
            ControlCommand::Capture {
                width,
                height,
                quality,
            } => {
                let request = ControlCommand::capture_request(width, height, quality)?;
                let outcome = self.camera.capture(request).await;
                match (outcome.success, outcome.data) {
                    (true, Some(data)) => ReplyBody::Capture {
                        speed: self.drive.speed(),
                        data,
                        width: outcome.width,
                        height: outcome.height,
                    },
                    _ => {
                        return Err(CommandError::SubprocessUnavailable(
                            outcome.error.unwrap_or_else(|| "capture failed".into()),
                        ))
                    }
                }
            }
            ControlCommand::Stream {
                action: StreamAction::Start,
                width,
                height,
                framerate,
                quality,
            } => {
                let config = ControlCommand::stream_config(width, height, framerate, quality)?;
                self.stream.start(config).await?;
                ReplyBody::Stream {
                    speed: self.drive.speed(),
                    action: StreamAction::Start,
                    streaming: true,
                    config: Some(config),
                }
            }
            ControlCommand::Stream {
                action: StreamAction::Stop,
                ..
            } => {
                self.stream.stop().await;
                ReplyBody::Stream {
                    speed: self.drive.speed(),
                    action: StreamAction::Stop,
                    streaming: false,
                    config: None,
                }
            }
        };
        Ok(body)
    }

    fn discrete(
        &self,
        direction: Direction,
    ) -> ReplyBody {
        let mut drive = self.drive.lock();
        drive.apply(DriveCommand::Discrete(direction));
        ReplyBody::Drive {
            speed: drive.speed(),
        }
    }

    /// Serve messages from `inbound` until the peer leaves or `shutdown` fires,
    /// then clean up.
    ///
    /// `shutdown` also interrupts a command in progress and a reply waiting
    /// for queue space, so cleanup never waits behind a slow capture or a
    /// stalled peer.
    pub async fn run<S, E>(
        mut self,
        mut inbound: S,
        shutdown: CancellationToken,
    ) -> SessionEnd
    where
        S: Stream<Item = Result<Inbound, E>> + Unpin,
        E: Display,
    {
        let end = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break SessionEnd::Shutdown,
                next = inbound.next() => next,
            };

            let reply = match next {
                None | Some(Ok(Inbound::Close)) => break SessionEnd::PeerClosed,
                Some(Err(error)) => {
                    tracing::warn!(%error, "connection error");
                    break SessionEnd::Transport(error.to_string());
                }
                Some(Ok(Inbound::Text(text))) => self.handle_until(&text, &shutdown).await,
                Some(Ok(Inbound::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => self.handle_until(&text, &shutdown).await,
                    Err(_) => {
                        let error = CommandError::Protocol("binary message is not UTF-8".into());
                        Some(Reply::error(None, &error))
                    }
                },
            };
            let Some(reply) = reply else {
                break SessionEnd::Shutdown;
            };

            let sent = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break SessionEnd::Shutdown,
                sent = self.outbox.send(&reply) => sent,
            };
            if sent.is_err() {
                break SessionEnd::PeerClosed;
            }
        };

        tracing::info!(?end, "session ending");
        self.shutdown().await;
        end
    }

    /// [`handle_text`](Self::handle_text), abandoned with `None` on shutdown.
    async fn handle_until(
        &mut self,
        text: &str,
        shutdown: &CancellationToken,
    ) -> Option<Reply> {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            reply = self.handle_text(text) => Some(reply),
        }
    }

    /// Stop the stream, then the motors. Runs once.
    pub async fn shutdown(&mut self) {
        if self.finished {
            return;
        }
        tracing::info!("stopping stream");
        self.stream.stop().await;
        tracing::info!("stopping motors");
        self.drive.stop();
        self.finished = true;
    }
}

impl Drop for CommandSession {
    fn drop(&mut self) {
        if !self.finished {
            tracing::info!("session dropped before cleanup, stopping stream and motors");
            self.stream.abandon();
            self.drive.stop();
        }
    }
}
