//! Connection-level behaviour over a real listener.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rover_core::utils::{
    camera::{
        still::{CaptureOutcome, CaptureRequest, StillCamera},
        stream::{RpicamVid, StreamLimits, VideoLauncher},
    },
    connection::server::{serve_on, AppState, SharedState},
    controllers::{ActuatorError, DriveConfig, DriveHandle, MotorActuator, MotorDrive},
};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const FRAMES: &str = r"while :; do printf '\377\330abc\377\331'; sleep 0.05; done";
const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
struct Calls(Arc<Mutex<Vec<String>>>);

impl Calls {
    fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn last(&self) -> Option<String> {
        self.0.lock().unwrap().last().cloned()
    }
}

struct Recorder(Calls);

impl MotorActuator for Recorder {
    fn drive(
        &mut self,
        left_duty: f32,
        right_duty: f32,
    ) -> Result<(), ActuatorError> {
        self.0 .0.lock().unwrap().push(format!("drive {left_duty} {right_duty}"));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ActuatorError> {
        self.0 .0.lock().unwrap().push("stop".into());
        Ok(())
    }
}

struct NoCamera;

#[async_trait]
impl StillCamera for NoCamera {
    async fn capture(
        &self,
        request: CaptureRequest,
    ) -> CaptureOutcome {
        CaptureOutcome::failed("rpicam-still not found", request)
    }
}

struct Harness {
    addr: SocketAddr,
    state: SharedState,
    calls: Calls,
    stop: CancellationToken,
}

impl Harness {
    async fn start() -> Self {
        Self::with_video(FRAMES).await
    }

    /// Serve with `script` standing in for the video program.
    async fn with_video(script: &str) -> Self {
        let calls = Calls::default();
        let drive = DriveHandle::new(MotorDrive::new(Recorder(calls.clone()), DriveConfig::default()));
        let launcher: Arc<dyn VideoLauncher> =
            Arc::new(RpicamVid::new("sh").with_leading_args(["-c", script, "sh"]));
        let limits = StreamLimits::new(Some(Duration::from_millis(500)), None);
        let state = Arc::new(AppState::new(drive, launcher, Arc::new(NoCamera), limits));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = CancellationToken::new();
        tokio::spawn(serve_on(listener, state.clone(), stop.clone()));

        Self {
            addr,
            state,
            calls,
            stop,
        }
    }

    async fn connect(&self) -> Client {
        let (client, _) = connect_async(format!("ws://{}/ws?session=test", self.addr))
            .await
            .unwrap();
        client
    }

    async fn get(
        &self,
        path: &str,
    ) -> String {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        tokio::time::timeout(WAIT, stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
        self.stop.cancel();
    }
}

async fn send(
    client: &mut Client,
    message: Value,
) {
    client.send(Message::Text(message.to_string())).await.unwrap();
}

/// Next reply, skipping any stream frames; returns the frames seen too.
async fn reply_and_frames(client: &mut Client) -> (Value, Vec<Value>) {
    let mut frames = Vec::new();
    loop {
        let message = tokio::time::timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed")
            .unwrap();
        let Message::Text(text) = message else { continue };
        let value: Value = serde_json::from_str(&text).unwrap();
        if value["type"] == "frame" {
            frames.push(value);
        } else {
            return (value, frames);
        }
    }
}

async fn reply(client: &mut Client) -> Value {
    reply_and_frames(client).await.0
}

async fn next_frame(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = message {
            let value: Value = serde_json::from_str(&text).unwrap();
            if value["type"] == "frame" {
                return value;
            }
        }
    }
}

fn alive(pid: libc::pid_t) -> bool {
    // SAFETY: signal 0 only checks that the process exists.
    unsafe { libc::kill(pid, 0) == 0 }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_drive_scenario() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;

    send(&mut client, json!({"command": "forward"})).await;
    let ack = reply(&mut client).await;
    assert_eq!(ack, json!({"status": "ok", "command": "forward", "speed": 80}));

    send(&mut client, json!({"command": "speed", "value": 50})).await;
    assert_eq!(reply(&mut client).await["speed"], 50);

    send(&mut client, json!({"command": "joystick", "x": 1.0, "y": 0.0})).await;
    let ack = reply(&mut client).await;
    assert_eq!(ack["left_motor"], 50.0);
    assert_eq!(ack["right_motor"], -50.0);

    assert_eq!(harness.calls.snapshot(), ["drive 80 80", "drive 50 -50"]);

    client.close(None).await.unwrap();
    eventually(|| harness.calls.last().as_deref() == Some("stop")).await;
}

#[tokio::test]
async fn test_errors_keep_session_alive() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;

    client.send(Message::Text("{oops".into())).await.unwrap();
    assert_eq!(
        reply(&mut client).await,
        json!({"status": "error", "message": "invalid JSON"})
    );

    send(&mut client, json!({"command": "dance"})).await;
    let ack = reply(&mut client).await;
    assert_eq!(ack["message"], "unknown command: dance");

    send(&mut client, json!({"command": "capture"})).await;
    let ack = reply(&mut client).await;
    assert_eq!(ack["status"], "error");
    assert_eq!(ack["message"], "rpicam-still not found");

    client
        .send(Message::Binary(br#"{"command":"backward"}"#.to_vec()))
        .await
        .unwrap();
    let ack = reply(&mut client).await;
    assert_eq!(ack["command"], "backward");
    assert_eq!(ack["status"], "ok");
}

#[tokio::test]
async fn test_stream_frames_and_conflict() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;

    send(&mut client, json!({"command": "stream", "action": "start", "width": 320})).await;
    // the pump may get a frame out before the ack
    let (ack, mut frames) = reply_and_frames(&mut client).await;
    assert_eq!(ack["status"], "ok");
    assert_eq!(ack["streaming"], true);
    assert_eq!(ack["config"]["width"], 320);
    assert_eq!(ack["config"]["framerate"], 15);

    while frames.len() < 2 {
        frames.push(next_frame(&mut client).await);
    }
    assert_eq!(frames[0]["frame"], 0);
    assert_eq!(frames[0]["data"], "/9hhYmP/2Q==");
    assert_eq!(frames[1]["frame"], 1);

    send(&mut client, json!({"command": "stream", "action": "start"})).await;
    let ack = reply(&mut client).await;
    assert_eq!(ack["status"], "error");
    assert_eq!(ack["message"], "stream already running");

    let status = harness.get("/status").await;
    assert!(status.contains(r#""streaming":true"#), "{status}");

    send(&mut client, json!({"command": "stream", "action": "stop"})).await;
    let ack = reply(&mut client).await;
    assert_eq!(ack["streaming"], false);
    // still usable after stopping
    send(&mut client, json!({"command": "stop"})).await;
    assert_eq!(reply(&mut client).await["status"], "ok");
}

#[tokio::test]
async fn test_disconnect_mid_stream_cleans_up() {
    let pid_file = std::env::temp_dir().join(format!("rover-video-{}.pid", std::process::id()));
    let _ = std::fs::remove_file(&pid_file);
    let script = format!("echo $$ > '{}'; {FRAMES}", pid_file.display());
    let harness = Harness::with_video(&script).await;
    let mut client = harness.connect().await;

    send(&mut client, json!({"command": "forward"})).await;
    reply(&mut client).await;
    send(&mut client, json!({"command": "stream", "action": "start"})).await;
    reply(&mut client).await;
    next_frame(&mut client).await;
    assert_eq!(harness.state.sessions.len().await, 1);

    let pid: libc::pid_t = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let _ = std::fs::remove_file(&pid_file);
    assert!(alive(pid));

    drop(client);

    // the stream is reaped before the motors stop
    eventually(|| harness.calls.last().as_deref() == Some("stop")).await;
    assert!(!alive(pid));
    tokio::time::timeout(WAIT, async {
        while !harness.state.sessions.is_empty().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_sessions() {
    let harness = Harness::start().await;
    let mut client = harness.connect().await;
    send(&mut client, json!({"command": "left"})).await;
    reply(&mut client).await;

    harness.state.shutdown.cancel();
    harness.state.tracker.close();
    tokio::time::timeout(WAIT, harness.state.tracker.wait())
        .await
        .unwrap();

    assert_eq!(harness.calls.snapshot(), ["drive -80 80", "stop"]);
    // the server closes the socket once the session is gone
    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match client.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}

#[tokio::test]
async fn test_status_lists_sessions() {
    let harness = Harness::start().await;
    let _client = harness.connect().await;

    tokio::time::timeout(WAIT, async {
        while harness.state.sessions.is_empty().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let response = harness.get("/status").await;
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let status: Value = serde_json::from_str(body).unwrap();
    assert_eq!(status["speed"], 80);
    assert_eq!(status["streaming"], false);
    assert_eq!(status["sessions"][0]["label"], "test");
    assert_eq!(status["sessions"][0]["stream"], "idle");
}

#[tokio::test]
async fn test_index_page() {
    let harness = Harness::start().await;
    let response = harness.get("/").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("text/html"));
    assert!(response.contains("/ws?session="));
}

#[tokio::test]
async fn test_mjpeg_endpoint() {
    let harness = Harness::start().await;
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    stream
        .write_all(b"GET /stream.mjpg HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut received = Vec::new();
    let mut chunk = [0u8; 1024];
    tokio::time::timeout(WAIT, async {
        while !received.windows(2).any(|w| w == [0xFF, 0xD9]) {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed early");
            received.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .unwrap();

    let text = String::from_utf8_lossy(&received);
    assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
    assert!(text.contains("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 7\r\n\r\n"));
}

#[tokio::test]
async fn test_mjpeg_rejects_bad_config() {
    let harness = Harness::start().await;
    let response = harness.get("/stream.mjpg?quality=300").await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
}
