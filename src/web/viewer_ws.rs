//! Viewer WebSocket endpoint
//!
//! Serves one camera's MPEG-TS stream to a JSMpeg player:
//!
//! ```text
//! server -> client   binary  "jsmp" header (8 bytes, once)
//! server -> client   binary  MPEG-TS chunks, unmodified
//! server -> client   ping    liveness probe
//! client -> server   text    "--heartbeat--"  (answered with "--ping--")
//! ```
//!
//! Any client message counts as a liveness answer.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    response::Response,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::time::Duration;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::state::AppState;
use crate::stream::{Outbound, SessionHandle, ViewerEndpoint, ViewerSession};

/// Client keep-alive request
pub const HEARTBEAT_REQUEST: &str = "--heartbeat--";

/// Reply to [`HEARTBEAT_REQUEST`]
pub const HEARTBEAT_REPLY: &str = "--ping--";

/// How long a close frame may take once the hub dropped the viewer
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// `GET /stream/:name`
pub async fn stream_ws_handler(
    ws: WebSocketUpgrade,
    Path(camera): Path<String>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Result<Response> {
    let session = state.session(&camera)?;
    Ok(ws.on_upgrade(move |socket| serve_viewer(socket, session, remote_addr)))
}

/// State of a camera's dedicated listener
#[derive(Clone)]
pub struct CameraListenerState {
    pub app: Arc<AppState>,
    pub camera: String,
}

/// Any path on a camera's dedicated listener
pub async fn camera_listener_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(listener): State<CameraListenerState>,
) -> Result<Response> {
    let session = listener.app.session(&listener.camera)?;
    Ok(ws.on_upgrade(move |socket| serve_viewer(socket, session, remote_addr)))
}

/// Pump a viewer's outbound queue into the socket until either side ends
pub async fn serve_viewer(socket: WebSocket, session: SessionHandle, remote_addr: SocketAddr) {
    let ViewerSession {
        mut endpoint,
        guard,
    } = match session.join(remote_addr) {
        Ok(viewer) => viewer,
        Err(e) => {
            warn!(camera = %session.camera(), "Rejecting viewer {}: {}", remote_addr, e);
            return;
        }
    };

    let (sender, receiver) = socket.split();
    pump_viewer(session.camera(), &mut endpoint, sender, receiver).await;

    // Deregisters the viewer
    drop(guard);
}

/// Why [`pump_viewer`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    Terminated,
    QueueClosed,
    SendFailed,
    ClientClosed,
}

async fn pump_viewer<S, R, E>(
    camera: &str,
    endpoint: &mut ViewerEndpoint,
    mut sender: S,
    mut receiver: R,
) -> PumpEnd
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let viewer = endpoint.id.clone();

    let end = loop {
        tokio::select! {
            biased;

            _ = &mut endpoint.terminated => break PumpEnd::Terminated,

            outbound = endpoint.outbound.recv() => {
                let message = match outbound {
                    Some(Outbound::Binary(data)) => Message::Binary(data.to_vec()),
                    Some(Outbound::Ping) => Message::Ping(Vec::new()),
                    None => break PumpEnd::QueueClosed,
                };
                // A stalled peer must not outlive its removal from the hub
                tokio::select! {
                    biased;
                    _ = &mut endpoint.terminated => break PumpEnd::Terminated,
                    sent = sender.send(message) => {
                        if sent.is_err() {
                            debug!(camera = %camera, viewer = %viewer, "Send failed, client gone");
                            break PumpEnd::SendFailed;
                        }
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        endpoint.mark_alive();
                        if text == HEARTBEAT_REQUEST
                            && sender.send(Message::Text(HEARTBEAT_REPLY.to_string())).await.is_err()
                        {
                            break PumpEnd::SendFailed;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(camera = %camera, viewer = %viewer, "Viewer closed connection");
                        break PumpEnd::ClientClosed;
                    }
                    Some(Ok(_)) => endpoint.mark_alive(),
                    Some(Err(e)) => {
                        debug!(camera = %camera, viewer = %viewer, "WebSocket receive error: {}", e);
                        break PumpEnd::ClientClosed;
                    }
                }
            }
        }
    };

    if end == PumpEnd::Terminated {
        debug!(camera = %camera, viewer = %viewer, "Viewer terminated by hub");
        // Best effort; a stalled peer gets no close frame
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sender.send(Message::Close(None))).await;
    }
    end
}
