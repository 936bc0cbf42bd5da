//! Lazy MPEG-TS relay
//!
//! Each camera gets one session coordinator that starts an ffmpeg muxer when
//! the first viewer connects and stops it after an idle grace period once the
//! last viewer leaves.
//!
//! # Components
//!
//! - `SessionRegistry` - Camera name to session map plus the admission gate
//! - `SessionCoordinator` - Per-camera state machine (Idle/Starting/Active/Stopping)
//! - `BroadcastHub` - Viewer set and fan-out of muxer output
//! - `FfmpegLauncher` - Transcoder process supervision
//! - `StreamFrameHeader` - 8-byte `jsmp` header sent before media

pub mod admission;
pub mod coordinator;
pub mod header;
pub mod hub;
pub mod muxer;
pub mod registry;

pub use admission::{gate_for_limit, AdmissionGate, AllowAll, CappedAdmission};
pub use coordinator::{
    SessionCoordinator, SessionHandle, SessionSettings, SessionSnapshot, SessionState, ViewerGuard,
    ViewerSession,
};
pub use header::{StreamFrameHeader, HEADER_LEN, STREAM_MAGIC_BYTES};
pub use hub::{BroadcastHub, BroadcastReport, Outbound, ViewerConnection, ViewerEndpoint, ViewerInfo};
pub use muxer::{FfmpegLauncher, MuxerCommand, MuxerEvent, MuxerHandle, MuxerLauncher};
pub use registry::SessionRegistry;
