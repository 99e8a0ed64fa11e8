//! HTTP and WebSocket server.
//!
//! Routes:
//! - `GET /`: the viewer page
//! - `GET /ws`: WebSocket upgrade into a [`CommandSession`]
//! - `GET /status`: speed, connected sessions and their stream state
//! - `GET /stream.mjpg`: `multipart/x-mixed-replace` MJPEG, one video process
//!   per request

use std::{
    collections::HashMap,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    pin::pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo,
        Query,
        State,
    },
    http::{header, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{future, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{watch, Mutex},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{
    outbox::{Outbox, OUTBOX_CAPACITY},
    protocol::ControlCommand,
    session::{CommandSession, Inbound},
};
use crate::utils::{
    camera::{
        still::StillCamera,
        stream::{StreamLimits, StreamState, VideoLauncher, VideoProcess},
    },
    controllers::DriveHandle,
    frontend::HTML,
};

pub const DEFAULT_PORT: u16 = 8765;
/// Multipart boundary used by `/stream.mjpg`.
pub const MJPEG_BOUNDARY: &str = "frame";
/// How long queued replies may take to flush after a session ends.
const WRITER_LINGER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// A connected WebSocket client.
#[derive(Clone, Debug)]
pub struct SessionState {
    pub label: Option<String>,
    pub peer: SocketAddr,
    pub connected_at: Instant,
    stream: watch::Receiver<StreamState>,
}

/// What `/status` reports per client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub peer: SocketAddr,
    pub connected_secs: u64,
    pub stream: StreamState,
}

/// Connected clients, keyed by a server-assigned id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<u64, SessionState>>,
}

impl SessionRegistry {
    /// Registers a client and returns its id.
    pub async fn create_session(
        &self,
        label: Option<String>,
        peer: SocketAddr,
        stream: watch::Receiver<StreamState>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.sessions.lock().await.insert(
            id,
            SessionState {
                label,
                peer,
                connected_at: Instant::now(),
                stream,
            },
        );
        id
    }

    pub async fn get_session(
        &self,
        id: u64,
    ) -> Option<SessionState> {
        self.sessions.lock().await.get(&id).cloned()
    }

    /// Returns true if a session was removed.
    pub async fn remove_session(
        &self,
        id: u64,
    ) -> bool {
        self.sessions.lock().await.remove(&id).is_some()
    }

    pub async fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let mut list: Vec<SessionSnapshot> = self
            .sessions
            .lock()
            .await
            .iter()
            .map(|(id, session)| SessionSnapshot {
                id: *id,
                label: session.label.clone(),
                peer: session.peer,
                connected_secs: session.connected_at.elapsed().as_secs(),
                stream: *session.stream.borrow(),
            })
            .collect();
        list.sort_by_key(|session| session.id);
        list
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Everything the handlers share.
pub struct AppState {
    pub drive: DriveHandle,
    pub launcher: Arc<dyn VideoLauncher>,
    pub camera: Arc<dyn StillCamera>,
    pub limits: StreamLimits,
    pub sessions: SessionRegistry,
    /// Cancelled when the process is shutting down; every session and MJPEG
    /// stream watches it.
    pub shutdown: CancellationToken,
    /// Tracks WebSocket session tasks so shutdown can wait for their cleanup.
    pub tracker: TaskTracker,
}

impl AppState {
    pub fn new(
        drive: DriveHandle,
        launcher: Arc<dyn VideoLauncher>,
        camera: Arc<dyn StillCamera>,
        limits: StreamLimits,
    ) -> Self {
        Self {
            drive,
            launcher,
            camera,
            limits,
            sessions: SessionRegistry::default(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }
}

pub type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/status", get(status))
        .route("/stream.mjpg", get(mjpeg))
        .with_state(state)
}

/// Bind `config` and serve until `stop` is cancelled.
pub async fn run(
    config: ServerConfig,
    state: SharedState,
    stop: CancellationToken,
) -> io::Result<()> {
    let listener = TcpListener::bind(config.addr()).await?;
    tracing::info!("Starting server at http://{}", listener.local_addr()?);
    serve_on(listener, state, stop).await
}

/// Serve on an already bound listener until `stop` is cancelled.
pub async fn serve_on(
    listener: TcpListener,
    state: SharedState,
    stop: CancellationToken,
) -> io::Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { stop.cancelled().await })
    .await
}

async fn index() -> Html<&'static str> {
    Html(HTML)
}

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    session: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let label = params.session.filter(|label| !label.is_empty());
    ws.on_upgrade(move |socket| {
        let tracker = state.tracker.clone();
        tracker.track_future(handle_socket(socket, state, peer, label))
    })
}

async fn handle_socket(
    socket: WebSocket,
    state: SharedState,
    peer: SocketAddr,
    label: Option<String>,
) {
    let (mut sender, receiver) = socket.split();
    let (outbox, mut outgoing) = Outbox::channel(OUTBOX_CAPACITY);

    // single writer: replies and frames leave through here only
    let mut writer = tokio::spawn(async move {
        while let Some(text) = outgoing.recv().await {
            if let Err(error) = sender.send(Message::Text(text)).await {
                tracing::debug!(%error, "websocket send failed");
                return;
            }
        }
        let _ = sender.close().await;
    });

    let session = CommandSession::new(
        state.drive.clone(),
        state.launcher.clone(),
        state.camera.clone(),
        outbox,
        state.limits,
    );
    let id = state
        .sessions
        .create_session(label.clone(), peer, session.watch_stream())
        .await;
    tracing::info!(id, %peer, ?label, "client connected");

    let inbound = pin!(receiver.filter_map(|message| {
        future::ready(match message {
            Ok(Message::Text(text)) => Some(Ok(Inbound::Text(text))),
            Ok(Message::Binary(data)) => Some(Ok(Inbound::Binary(data))),
            Ok(Message::Close(reason)) => {
                tracing::debug!(?reason, "websocket close frame");
                Some(Ok(Inbound::Close))
            }
            // answered by axum
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
            Err(error) => Some(Err(error)),
        })
    }));

    let end = session.run(inbound, state.shutdown.clone()).await;

    if tokio::time::timeout(WRITER_LINGER, &mut writer).await.is_err() {
        writer.abort();
    }
    state.sessions.remove_session(id).await;
    tracing::info!(id, %peer, ?end, "client disconnected");
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub speed: u8,
    pub streaming: bool,
    pub sessions: Vec<SessionSnapshot>,
}

async fn status(State(state): State<SharedState>) -> Json<StatusReport> {
    let sessions = state.sessions.list_sessions().await;
    Json(StatusReport {
        speed: state.drive.speed(),
        streaming: sessions
            .iter()
            .any(|session| session.stream == StreamState::Running),
        sessions,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct MjpegParams {
    width: Option<u32>,
    height: Option<u32>,
    framerate: Option<u32>,
    quality: Option<u32>,
}

async fn mjpeg(
    Query(params): Query<MjpegParams>,
    State(state): State<SharedState>,
) -> Response {
    let config = match ControlCommand::stream_config(
        params.width,
        params.height,
        params.framerate,
        params.quality,
    ) {
        Ok(config) => config,
        Err(error) => return (StatusCode::BAD_REQUEST, error.to_string()).into_response(),
    };

    let process = match VideoProcess::launch(state.launcher.as_ref(), &config, &state.limits) {
        Ok(process) => process,
        Err(error) => {
            return (StatusCode::SERVICE_UNAVAILABLE, error.to_string()).into_response()
        }
    };
    tracing::info!(pid = ?process.id(), ?config, "mjpeg client attached");

    let shutdown = state.shutdown.clone();
    let stop_timeout = state.limits.stop_timeout;
    // dropping the body drops the process, which kills it
    let parts = futures_util::stream::unfold(process, move |mut process| {
        let shutdown = shutdown.clone();
        async move {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                next = process.next_frame() => Some(next),
            };
            match next {
                Some(Ok(Some(frame))) => Some((Ok::<_, io::Error>(multipart_part(&frame)), process)),
                other => {
                    if let Some(Err(error)) = other {
                        tracing::warn!(%error, "mjpeg stream failed");
                    }
                    process.terminate(stop_timeout).await;
                    tracing::info!("mjpeg stream ended");
                    None
                }
            }
        }
    });

    (
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}"),
            ),
            (header::CACHE_CONTROL, "no-cache".to_owned()),
        ],
        Body::from_stream(parts),
    )
        .into_response()
}

/// One multipart body part wrapping a JPEG frame.
pub fn multipart_part(frame: &[u8]) -> Bytes {
    let head = format!(
        "--{MJPEG_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        frame.len()
    );
    let mut part = BytesMut::with_capacity(head.len() + frame.len() + 2);
    part.put_slice(head.as_bytes());
    part.put_slice(frame);
    part.put_slice(b"\r\n");
    part.freeze()
}
