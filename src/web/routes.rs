use axum::{
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::viewer_ws::{camera_listener_ws_handler, stream_ws_handler, CameraListenerState};
use super::ws::ws_handler;
use crate::state::AppState;

/// Create the main application router
///
/// Must be served with `into_make_service_with_connect_info::<SocketAddr>()`
/// so viewer endpoints can see the peer address.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/cameras", get(handlers::list_cameras))
        .route("/cameras/:name", get(handlers::get_camera))
        .route("/cameras/:name/restart", post(handlers::restart_camera))
        // WebSocket endpoint for real-time events
        .route("/ws/events", any(ws_handler));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/stream/:name", get(stream_ws_handler))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Router for a camera's dedicated port: a viewer WebSocket on any path
pub fn create_camera_router(state: Arc<AppState>, camera: &str) -> Router {
    Router::new()
        .fallback(camera_listener_ws_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(CameraListenerState {
            app: state,
            camera: camera.to_string(),
        })
}
