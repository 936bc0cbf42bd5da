//! jsmpeg-relay - Lazy ffmpeg to WebSocket relay for JSMpeg players
//!
//! This crate starts one ffmpeg process per camera when the first viewer
//! connects, fans its MPEG-TS output out to every viewer socket and stops
//! the process after an idle grace period once the last viewer leaves.

pub mod config;
pub mod error;
pub mod events;
pub mod state;
pub mod stream;
pub mod utils;
pub mod web;

pub use error::{AppError, Result};
