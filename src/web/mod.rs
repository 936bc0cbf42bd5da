mod handlers;
mod routes;
mod viewer_ws;
mod ws;

pub use routes::{create_camera_router, create_router};
pub use viewer_ws::{serve_viewer, stream_ws_handler, HEARTBEAT_REPLY, HEARTBEAT_REQUEST};
pub use ws::ws_handler;
