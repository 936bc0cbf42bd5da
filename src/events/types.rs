//! System event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};

/// System event enumeration
///
/// Serialized as:
/// ```json
/// {
///   "event": "session.state_changed",
///   "data": { "camera": "front-door", "state": "active" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    /// Coordinator moved to a new lifecycle state
    #[serde(rename = "session.state_changed")]
    SessionStateChanged {
        camera: String,
        /// "idle", "starting", "active", "stopping"
        state: String,
    },

    /// The admission gate refused to start a session
    #[serde(rename = "session.admission_denied")]
    AdmissionDenied { camera: String },

    #[serde(rename = "viewer.connected")]
    ViewerConnected {
        camera: String,
        viewer_id: String,
        remote_addr: String,
        total: usize,
    },

    #[serde(rename = "viewer.disconnected")]
    ViewerDisconnected {
        camera: String,
        viewer_id: String,
        /// "closed" or "heartbeat_timeout"
        reason: String,
        total: usize,
    },

    #[serde(rename = "muxer.started")]
    MuxerStarted {
        camera: String,
        pid: Option<u32>,
        args: Vec<String>,
    },

    /// Transcoder process terminated
    #[serde(rename = "muxer.exited")]
    MuxerExited {
        camera: String,
        code: Option<i32>,
        signal: Option<i32>,
        /// Exit code 1 (error severity)
        abnormal: bool,
    },

    /// Output dimensions parsed from transcoder diagnostics
    #[serde(rename = "muxer.dimensions_detected")]
    DimensionsDetected {
        camera: String,
        width: u16,
        height: u16,
    },

    #[serde(rename = "system.error")]
    SystemError {
        /// Module that generated the error: "muxer", "listener", "session"
        module: String,
        /// Severity: "warning", "error"
        severity: String,
        message: String,
    },
}

impl SystemEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::SessionStateChanged { .. } => "session.state_changed",
            Self::AdmissionDenied { .. } => "session.admission_denied",
            Self::ViewerConnected { .. } => "viewer.connected",
            Self::ViewerDisconnected { .. } => "viewer.disconnected",
            Self::MuxerStarted { .. } => "muxer.started",
            Self::MuxerExited { .. } => "muxer.exited",
            Self::DimensionsDetected { .. } => "muxer.dimensions_detected",
            Self::SystemError { .. } => "system.error",
        }
    }

    /// Check if event name matches a topic pattern
    ///
    /// Supports wildcards:
    /// - `*` matches all events
    /// - `muxer.*` matches all muxer events
    /// - `muxer.exited` matches exact event
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if topic.ends_with(".*") {
            let prefix = topic.trim_end_matches(".*");
            event_name.starts_with(prefix)
        } else {
            event_name == topic
        }
    }
}
