//! WebSocket handler for real-time event streaming
//!
//! This module provides a WebSocket endpoint at `/api/ws/events` that:
//! - Forwards session, viewer and muxer events to connected clients
//! - Supports topic-based event filtering
//! - Includes heartbeat (ping/pong) mechanism

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::SystemEvent;
use crate::state::AppState;

/// Client-to-server message
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload")]
enum ClientMessage {
    /// Subscribe to event topics
    #[serde(rename = "subscribe")]
    Subscribe { topics: Vec<String> },

    /// Unsubscribe from event topics
    #[serde(rename = "unsubscribe")]
    Unsubscribe { topics: Vec<String> },

    /// Ping (keep-alive)
    #[serde(rename = "ping")]
    Ping,
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut event_rx = state.events.subscribe();
    let mut shutdown_rx = state.shutdown_signal();

    // Nothing is sent until the client subscribes
    let mut subscribed_topics: Vec<String> = vec![];

    info!("Event WebSocket client connected");

    let mut heartbeat_interval = tokio::time::interval(std::time::Duration::from_secs(30));

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_client_message(&text, &mut subscribed_topics) {
                            warn!("Failed to handle client message: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Event WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket receive error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            event = event_rx.recv() => {
                match event {
                    Ok(event) => {
                        if should_send_event(&event, &subscribed_topics) {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if sender.send(Message::Text(json)).await.is_err() {
                                    warn!("Failed to send event to client, disconnecting");
                                    break;
                                }
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event WebSocket client lagged by {} events", n);
                        let error_event = SystemEvent::SystemError {
                            module: "events".to_string(),
                            severity: "warning".to_string(),
                            message: format!("Lagged by {} events", n),
                        };
                        if let Ok(json) = serde_json::to_string(&error_event) {
                            let _ = sender.send(Message::Text(json)).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Event bus closed");
                        break;
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            _ = heartbeat_interval.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    warn!("Failed to send ping, disconnecting");
                    break;
                }
            }
        }
    }
}

fn handle_client_message(text: &str, topics: &mut Vec<String>) -> Result<(), serde_json::Error> {
    let msg: ClientMessage = serde_json::from_str(text)?;

    match msg {
        ClientMessage::Subscribe { topics: new_topics } => {
            info!("Client subscribed to topics: {:?}", new_topics);
            *topics = new_topics;
        }
        ClientMessage::Unsubscribe {
            topics: remove_topics,
        } => {
            topics.retain(|t| !remove_topics.contains(t));
            info!("Client unsubscribed from topics: {:?}", remove_topics);
        }
        ClientMessage::Ping => {
            debug!("Received ping from client");
        }
    }

    Ok(())
}

/// Check if an event should be sent based on subscribed topics
fn should_send_event(event: &SystemEvent, topics: &[String]) -> bool {
    topics.iter().any(|topic| event.matches_topic(topic))
}
