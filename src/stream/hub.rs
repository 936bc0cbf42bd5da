//! Per-camera viewer set and media fan-out
//!
//! The hub is owned by its session coordinator and only mutated from the
//! coordinator task. Each viewer is split in two halves:
//!
//! - [`ViewerConnection`], kept here: the sending side of the viewer's
//!   bounded outbound queue plus its liveness flag.
//! - [`ViewerEndpoint`], handed to the socket task: the receiving side of
//!   the queue, the same liveness flag and a termination signal.
//!
//! Dropping a `ViewerConnection` terminates the socket, so removing a viewer
//! from the hub is all it takes to disconnect it.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::header::StreamFrameHeader;

/// Viewer identifier (UUID string)
pub type ViewerId = String;

/// Message queued for a viewer socket
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Binary frame: the stream header or a media chunk
    Binary(Bytes),
    /// WebSocket ping (liveness probe)
    Ping,
}

/// Hub-side half of a viewer
#[derive(Debug)]
pub struct ViewerConnection {
    id: ViewerId,
    remote_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    alive: Arc<AtomicBool>,
    outbound: mpsc::Sender<Outbound>,
    /// Set while the queue rejects media, so a slow viewer is logged once
    lagging: bool,
    _terminate: oneshot::Sender<()>,
}

/// Socket-side half of a viewer
#[derive(Debug)]
pub struct ViewerEndpoint {
    pub id: ViewerId,
    pub outbound: mpsc::Receiver<Outbound>,
    /// Resolves when the hub drops the viewer
    pub terminated: oneshot::Receiver<()>,
    alive: Arc<AtomicBool>,
}

impl ViewerEndpoint {
    /// Record client activity (pong or any message)
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }
}

impl ViewerConnection {
    /// Create both halves of a viewer with an outbound queue of `queue_depth`
    pub fn new(remote_addr: SocketAddr, queue_depth: usize) -> (Self, ViewerEndpoint) {
        let id = uuid::Uuid::new_v4().to_string();
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_depth.max(1));
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let alive = Arc::new(AtomicBool::new(true));

        let connection = Self {
            id: id.clone(),
            remote_addr,
            connected_at: Utc::now(),
            alive: alive.clone(),
            outbound: outbound_tx,
            lagging: false,
            _terminate: terminate_tx,
        };
        let endpoint = ViewerEndpoint {
            id,
            outbound: outbound_rx,
            terminated: terminate_rx,
            alive,
        };
        (connection, endpoint)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> ViewerInfo {
        ViewerInfo {
            id: self.id.clone(),
            remote_addr: self.remote_addr.to_string(),
            connected_at: self.connected_at,
            alive: self.is_alive(),
        }
    }
}

/// Viewer description for snapshots and the API
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ViewerInfo {
    pub id: ViewerId,
    pub remote_addr: String,
    pub connected_at: DateTime<Utc>,
    pub alive: bool,
}

/// Why a viewer did not receive a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Outbound queue at capacity
    NotReady,
    /// Socket task already gone
    Closed,
}

/// Outcome of one broadcast
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub skipped: Vec<(ViewerId, SkipReason)>,
}

/// Fan-out point for one camera
#[derive(Debug)]
pub struct BroadcastHub {
    camera: String,
    header: StreamFrameHeader,
    viewers: HashMap<ViewerId, ViewerConnection>,
}

impl BroadcastHub {
    pub fn new(camera: impl Into<String>, header: StreamFrameHeader) -> Self {
        Self {
            camera: camera.into(),
            header,
            viewers: HashMap::new(),
        }
    }

    pub fn header(&self) -> StreamFrameHeader {
        self.header
    }

    /// Header sent to viewers accepted from now on
    pub fn set_header(&mut self, header: StreamFrameHeader) {
        self.header = header;
    }

    pub fn len(&self) -> usize {
        self.viewers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.viewers.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.viewers.contains_key(id)
    }

    /// Register a viewer and queue the stream header as its first message
    ///
    /// Returns the new viewer count.
    pub fn accept(&mut self, viewer: ViewerConnection) -> usize {
        if self.header.is_unknown() {
            warn!(
                camera = %self.camera,
                "Stream size unknown, sending empty header to {}",
                viewer.remote_addr
            );
        }

        viewer.alive.store(true, Ordering::Relaxed);
        if viewer
            .outbound
            .try_send(Outbound::Binary(self.header.encode()))
            .is_err()
        {
            debug!(camera = %self.camera, viewer = %viewer.id, "Header not queued, viewer already gone");
        }

        info!(
            camera = %self.camera,
            viewer = %viewer.id,
            "New WebSocket connection from {}",
            viewer.remote_addr
        );
        self.viewers.insert(viewer.id.clone(), viewer);
        self.viewers.len()
    }

    /// Deregister a viewer; dropping the returned connection closes its socket
    pub fn remove(&mut self, id: &str) -> Option<ViewerConnection> {
        let viewer = self.viewers.remove(id)?;
        debug!(
            camera = %self.camera,
            viewer = %id,
            "Viewer removed ({} remaining)",
            self.viewers.len()
        );
        Some(viewer)
    }

    /// Queue `data` for every viewer that has room
    ///
    /// Viewers that cannot take the chunk are skipped and reported; a
    /// failing viewer never aborts the broadcast.
    pub fn broadcast(&mut self, data: &Bytes) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for viewer in self.viewers.values_mut() {
            match viewer.outbound.try_send(Outbound::Binary(data.clone())) {
                Ok(()) => {
                    if viewer.lagging {
                        viewer.lagging = false;
                        debug!(camera = %self.camera, viewer = %viewer.id, "Viewer caught up");
                    }
                    report.delivered += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if !viewer.lagging {
                        viewer.lagging = true;
                        warn!(
                            camera = %self.camera,
                            viewer = %viewer.id,
                            "Viewer not ready, dropping media until it catches up"
                        );
                    }
                    report.skipped.push((viewer.id.clone(), SkipReason::NotReady));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(camera = %self.camera, viewer = %viewer.id, "Viewer socket closed, skipping");
                    report.skipped.push((viewer.id.clone(), SkipReason::Closed));
                }
            }
        }

        report
    }

    /// Run one liveness round
    ///
    /// Viewers that have not answered since the previous round are removed
    /// and returned; everyone else is marked pending and pinged.
    pub fn heartbeat(&mut self) -> Vec<ViewerConnection> {
        let dead: Vec<ViewerId> = self
            .viewers
            .values()
            .filter(|viewer| !viewer.alive.swap(false, Ordering::Relaxed))
            .map(|viewer| viewer.id.clone())
            .collect();

        let removed: Vec<ViewerConnection> = dead
            .iter()
            .filter_map(|id| self.viewers.remove(id))
            .collect();
        for viewer in &removed {
            info!(
                camera = %self.camera,
                viewer = %viewer.id,
                "Terminating unresponsive viewer {}",
                viewer.remote_addr
            );
        }

        for viewer in self.viewers.values() {
            // A full queue means the viewer is not reading; it will fail
            // the next round unless it answers
            let _ = viewer.outbound.try_send(Outbound::Ping);
        }

        removed
    }

    /// Drop every viewer, closing their sockets
    pub fn close_all(&mut self) -> usize {
        let count = self.viewers.len();
        self.viewers.clear();
        if count > 0 {
            debug!(camera = %self.camera, "Closed {} viewer connections", count);
        }
        count
    }

    /// Viewers ordered by connection time
    pub fn viewer_infos(&self) -> Vec<ViewerInfo> {
        let mut infos: Vec<ViewerInfo> = self.viewers.values().map(ViewerConnection::info).collect();
        infos.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }
}
