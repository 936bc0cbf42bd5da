//! Utility modules

pub mod net;

pub use net::{bind_camera_listener, bind_tcp_listener, describe_bind_error};
