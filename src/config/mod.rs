//! Configuration
//!
//! `AppConfig` is read from a JSON file and cached by `ConfigStore`.

mod schema;
mod store;

pub use schema::{AppConfig, CameraConfig, StreamConfig, WebConfig};
pub use store::ConfigStore;
