//! Per-camera session state machine
//!
//! Every camera runs one coordinator task. Viewer joins and leaves, muxer
//! output, heartbeat ticks and the idle deadline are all handled inside that
//! task, so transitions for one camera never interleave.
//!
//! ```text
//!            first viewer (admitted)           first stdout chunk
//!   Idle ------------------------------> Starting ---------------> Active
//!    ^                                      |                       |
//!    |       exit before data / abnormal    |     idle deadline     |
//!    +--------------------------------------+   (still 0 viewers)   |
//!    |                                                              v
//!    +---------------------- exit ------------------------------ Stopping
//! ```

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::admission::AdmissionGate;
use super::header::StreamFrameHeader;
use super::hub::{BroadcastHub, ViewerConnection, ViewerEndpoint, ViewerId, ViewerInfo};
use super::muxer::{ExitInfo, MuxerCommand, MuxerEvent, MuxerHandle, MuxerLauncher, MuxerMessage};
use crate::config::{CameraConfig, StreamConfig};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};

/// Muxer events buffered between the supervisor and the coordinator
const MUXER_EVENT_CAPACITY: usize = 256;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopping => "stopping",
        }
    }

    /// A muxer is running and not being stopped
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Starting | Self::Active)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing and sizing of one session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub ffmpeg_path: String,
    pub idle_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub viewer_queue_depth: usize,
}

impl SessionSettings {
    pub fn for_camera(camera: &CameraConfig, defaults: &StreamConfig) -> Self {
        Self {
            ffmpeg_path: defaults.ffmpeg_path.clone(),
            idle_timeout: camera.idle_timeout(defaults),
            heartbeat_interval: defaults.heartbeat_interval(),
            viewer_queue_depth: defaults.viewer_queue_depth,
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub camera: String,
    pub state: SessionState,
    pub viewers: Vec<ViewerInfo>,
    pub dimensions: Option<(u16, u16)>,
    pub muxer_pid: Option<u32>,
    pub idle_pending: bool,
    pub started_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    /// Snapshot of a camera whose session was never created
    pub fn idle(camera: &CameraConfig) -> Self {
        Self {
            camera: camera.name.clone(),
            state: SessionState::Idle,
            viewers: Vec::new(),
            dimensions: camera.dimensions(),
            muxer_pid: None,
            idle_pending: false,
            started_at: None,
        }
    }
}

enum SessionCommand {
    Join { viewer: ViewerConnection },
    Leave { id: ViewerId },
    Restart,
    Snapshot { reply: oneshot::Sender<SessionSnapshot> },
    Shutdown { done: oneshot::Sender<()> },
}

/// Cloneable handle to a running coordinator
#[derive(Clone)]
pub struct SessionHandle {
    camera: String,
    commands: mpsc::UnboundedSender<SessionCommand>,
    queue_depth: usize,
}

/// Everything a socket task needs to serve one viewer
pub struct ViewerSession {
    pub endpoint: ViewerEndpoint,
    pub guard: ViewerGuard,
}

/// Deregisters its viewer when dropped
pub struct ViewerGuard {
    id: ViewerId,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl ViewerGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        let id = std::mem::take(&mut self.id);
        let _ = self.commands.send(SessionCommand::Leave { id });
    }
}

impl SessionHandle {
    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn unavailable(&self) -> AppError {
        AppError::ServiceUnavailable(format!("Session for camera '{}' is shut down", self.camera))
    }

    /// Register a new viewer
    ///
    /// The header is already queued on the returned endpoint when the
    /// coordinator processes the join.
    pub fn join(&self, remote_addr: SocketAddr) -> Result<ViewerSession> {
        let (viewer, endpoint) = ViewerConnection::new(remote_addr, self.queue_depth);
        let id = endpoint.id.clone();
        self.commands
            .send(SessionCommand::Join { viewer })
            .map_err(|_| self.unavailable())?;

        Ok(ViewerSession {
            endpoint,
            guard: ViewerGuard {
                id,
                commands: self.commands.clone(),
            },
        })
    }

    /// Stop the current muxer; attached viewers get a fresh one
    pub fn restart(&self) -> Result<()> {
        self.commands
            .send(SessionCommand::Restart)
            .map_err(|_| self.unavailable())
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Snapshot { reply })
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.unavailable())
    }

    /// Kill the muxer, close all viewers and end the coordinator task
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(SessionCommand::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// State owned by one camera's coordinator task
pub struct SessionCoordinator {
    camera: CameraConfig,
    settings: SessionSettings,
    state: SessionState,
    hub: BroadcastHub,
    muxer: Option<MuxerHandle>,
    generation: u64,
    idle_deadline: Option<Instant>,
    /// A viewer arrived while stopping; start again after the exit
    restart_pending: bool,
    admitted: bool,
    dimensions: Option<(u16, u16)>,
    started_at: Option<DateTime<Utc>>,
    launcher: Arc<dyn MuxerLauncher>,
    admission: Arc<dyn AdmissionGate>,
    events: Arc<EventBus>,
    muxer_tx: mpsc::Sender<MuxerMessage>,
}

impl SessionCoordinator {
    /// Spawn the coordinator task for `camera`
    pub fn spawn(
        camera: CameraConfig,
        settings: SessionSettings,
        launcher: Arc<dyn MuxerLauncher>,
        admission: Arc<dyn AdmissionGate>,
        events: Arc<EventBus>,
    ) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (muxer_tx, muxer_rx) = mpsc::channel(MUXER_EVENT_CAPACITY);

        let dimensions = camera.dimensions();
        let header = dimensions.map(StreamFrameHeader::from).unwrap_or_default();
        let handle = SessionHandle {
            camera: camera.name.clone(),
            commands: command_tx,
            queue_depth: settings.viewer_queue_depth,
        };

        let coordinator = Self {
            hub: BroadcastHub::new(camera.name.clone(), header),
            camera,
            settings,
            state: SessionState::Idle,
            muxer: None,
            generation: 0,
            idle_deadline: None,
            restart_pending: false,
            admitted: false,
            dimensions,
            started_at: None,
            launcher,
            admission,
            events,
            muxer_tx,
        };
        tokio::spawn(coordinator.run(command_rx, muxer_rx));

        handle
    }

    fn name(&self) -> &str {
        &self.camera.name
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut muxer_rx: mpsc::Receiver<MuxerMessage>,
    ) {
        let period = self.settings.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(camera = %self.name(), "Session coordinator started");

        loop {
            let idle_deadline = self.idle_deadline;
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown { done }) => {
                        self.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(message) = muxer_rx.recv() => self.handle_muxer(message),
                _ = heartbeat.tick() => self.heartbeat(),
                _ = sleep_until_deadline(idle_deadline), if idle_deadline.is_some() => {
                    self.idle_deadline_reached();
                }
            }
        }

        debug!(camera = %self.name(), "Session coordinator stopped");
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Join { viewer } => self.on_join(viewer),
            SessionCommand::Leave { id } => self.on_leave(&id),
            SessionCommand::Restart => self.on_restart(),
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the run loop
            SessionCommand::Shutdown { .. } => {}
        }
    }

    fn on_join(&mut self, viewer: ViewerConnection) {
        let viewer_id = viewer.id().to_string();
        let remote_addr = viewer.remote_addr().to_string();
        let total = self.hub.accept(viewer);

        self.events.publish(SystemEvent::ViewerConnected {
            camera: self.name().to_string(),
            viewer_id,
            remote_addr,
            total,
        });

        if self.idle_deadline.take().is_some() {
            info!(camera = %self.name(), "Viewer returned, idle stop cancelled");
        }

        match self.state {
            SessionState::Idle => self.try_start(),
            SessionState::Stopping => {
                debug!(camera = %self.name(), "Viewer joined while stopping, restart queued");
                self.restart_pending = true;
            }
            SessionState::Starting | SessionState::Active => {}
        }
    }

    fn on_leave(&mut self, id: &str) {
        // Already gone if the heartbeat removed it
        if self.hub.remove(id).is_none() {
            return;
        }
        self.events.publish(SystemEvent::ViewerDisconnected {
            camera: self.name().to_string(),
            viewer_id: id.to_string(),
            reason: "closed".to_string(),
            total: self.hub.len(),
        });
        self.after_viewer_removed();
    }

    fn after_viewer_removed(&mut self) {
        if !self.hub.is_empty() {
            return;
        }

        if self.state.is_running() && self.idle_deadline.is_none() {
            let timeout = self.settings.idle_timeout;
            info!(
                camera = %self.name(),
                "No viewers left, stopping stream in {}s",
                timeout.as_secs()
            );
            self.idle_deadline = Some(Instant::now() + timeout);
        } else if self.state == SessionState::Stopping {
            self.restart_pending = false;
        }
    }

    fn on_restart(&mut self) {
        match self.state {
            SessionState::Idle => {
                if !self.hub.is_empty() {
                    self.try_start();
                }
            }
            SessionState::Starting | SessionState::Active => {
                info!(camera = %self.name(), "Restarting stream");
                self.idle_deadline = None;
                self.restart_pending = !self.hub.is_empty();
                self.stop_muxer();
            }
            SessionState::Stopping => {
                self.restart_pending = !self.hub.is_empty();
            }
        }
    }

    fn try_start(&mut self) {
        if !self.admission.request_session(self.name()) {
            warn!(camera = %self.name(), "Session not admitted, viewers will only get the header");
            self.events.publish(SystemEvent::AdmissionDenied {
                camera: self.name().to_string(),
            });
            return;
        }
        self.admitted = true;

        self.generation += 1;
        let command = MuxerCommand::for_camera(&self.camera, &self.settings.ffmpeg_path);
        info!(
            camera = %self.name(),
            "Starting stream for {} viewer(s)",
            self.hub.len()
        );

        match self
            .launcher
            .launch(&command, self.generation, self.muxer_tx.clone())
        {
            Ok(handle) => {
                self.events.publish(SystemEvent::MuxerStarted {
                    camera: self.name().to_string(),
                    pid: handle.pid(),
                    args: command.args,
                });
                self.muxer = Some(handle);
                self.started_at = Some(Utc::now());
                self.set_state(SessionState::Starting);
            }
            Err(e) => {
                error!(camera = %self.name(), "Failed to start stream: {}", e);
                self.events.publish(SystemEvent::SystemError {
                    module: "muxer".to_string(),
                    severity: "error".to_string(),
                    message: e.to_string(),
                });
                self.release_admission();
            }
        }
    }

    fn stop_muxer(&mut self) {
        if let Some(muxer) = &self.muxer {
            muxer.stop();
            self.set_state(SessionState::Stopping);
        }
    }

    fn handle_muxer(&mut self, message: MuxerMessage) {
        let current = self.muxer.as_ref().map(MuxerHandle::generation);
        if current != Some(message.generation) {
            debug!(
                camera = %self.name(),
                "Ignoring event from stale muxer generation {}",
                message.generation
            );
            return;
        }

        match message.event {
            MuxerEvent::Data(chunk) => self.on_data(chunk),
            MuxerEvent::Dimensions { width, height } => self.on_dimensions(width, height),
            MuxerEvent::Exited(exit) => self.on_exit(exit),
        }
    }

    fn on_data(&mut self, chunk: Bytes) {
        if self.state == SessionState::Starting {
            self.set_state(SessionState::Active);
        }
        self.hub.broadcast(&chunk);
    }

    fn on_dimensions(&mut self, width: u16, height: u16) {
        // Configured values win over detected ones
        let width = self.camera.width.unwrap_or(width);
        let height = self.camera.height.unwrap_or(height);
        if self.dimensions == Some((width, height)) {
            return;
        }

        debug!(camera = %self.name(), "Detected stream size {}x{}", width, height);
        self.dimensions = Some((width, height));
        self.hub.set_header(StreamFrameHeader::new(width, height));
        self.events.publish(SystemEvent::DimensionsDetected {
            camera: self.name().to_string(),
            width,
            height,
        });
    }

    fn on_exit(&mut self, exit: ExitInfo) {
        let previous = self.state;
        self.muxer = None;
        self.idle_deadline = None;
        self.started_at = None;
        self.release_admission();

        self.events.publish(SystemEvent::MuxerExited {
            camera: self.name().to_string(),
            code: exit.code,
            signal: exit.signal,
            abnormal: exit.is_abnormal(),
        });

        if exit.is_abnormal() {
            self.restart_pending = false;
            self.events.publish(SystemEvent::SystemError {
                module: "muxer".to_string(),
                severity: "error".to_string(),
                message: format!("Stream for '{}' exited with error ({})", self.name(), exit),
            });
        } else if previous != SessionState::Stopping {
            warn!(camera = %self.name(), "Stream ended unexpectedly ({})", exit);
        }

        self.set_state(SessionState::Idle);

        if std::mem::take(&mut self.restart_pending) && !self.hub.is_empty() {
            self.try_start();
        }
    }

    fn heartbeat(&mut self) {
        let removed = self.hub.heartbeat();
        if removed.is_empty() {
            return;
        }

        let total = self.hub.len();
        for viewer in removed {
            self.events.publish(SystemEvent::ViewerDisconnected {
                camera: self.name().to_string(),
                viewer_id: viewer.id().to_string(),
                reason: "heartbeat_timeout".to_string(),
                total,
            });
        }
        self.after_viewer_removed();
    }

    fn idle_deadline_reached(&mut self) {
        self.idle_deadline = None;
        if !self.hub.is_empty() || !self.state.is_running() {
            debug!(camera = %self.name(), "Idle deadline no longer applies");
            return;
        }

        info!(camera = %self.name(), "Stopping idle stream");
        self.stop_muxer();
    }

    fn release_admission(&mut self) {
        if std::mem::take(&mut self.admitted) {
            self.admission.close_session(&self.camera.name);
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!(camera = %self.name(), "Session {} -> {}", self.state, state);
        self.state = state;
        self.events.publish(SystemEvent::SessionStateChanged {
            camera: self.name().to_string(),
            state: state.to_string(),
        });
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            camera: self.name().to_string(),
            state: self.state,
            viewers: self.hub.viewer_infos(),
            dimensions: self.dimensions,
            muxer_pid: self.muxer.as_ref().and_then(MuxerHandle::pid),
            idle_pending: self.idle_deadline.is_some(),
            started_at: self.started_at,
        }
    }

    fn shutdown(&mut self) {
        self.idle_deadline = None;
        self.restart_pending = false;
        if let Some(muxer) = self.muxer.take() {
            muxer.kill();
        }
        self.started_at = None;
        self.release_admission();
        self.hub.close_all();
        self.set_state(SessionState::Idle);
        info!(camera = %self.name(), "Session shut down");
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::stream::admission::{AllowAll, CappedAdmission};
    use crate::stream::hub::Outbound;
    use crate::stream::muxer::StopSignal;
    use parking_lot::Mutex;
    use tokio::sync::broadcast;

    pub(crate) struct FakeLaunch {
        pub command: MuxerCommand,
        pub generation: u64,
        pub events: mpsc::Sender<MuxerMessage>,
        pub control: mpsc::UnboundedReceiver<StopSignal>,
    }

    /// Records launches instead of spawning processes
    #[derive(Default)]
    pub(crate) struct FakeLauncher {
        pub launches: Mutex<Vec<FakeLaunch>>,
        pub fail: std::sync::atomic::AtomicBool,
    }

    impl FakeLauncher {
        pub fn count(&self) -> usize {
            self.launches.lock().len()
        }

        pub async fn emit(&self, index: usize, event: MuxerEvent) {
            let (events, generation) = {
                let launches = self.launches.lock();
                (launches[index].events.clone(), launches[index].generation)
            };
            events
                .send(MuxerMessage { generation, event })
                .await
                .expect("coordinator alive");
        }

        pub fn signals(&self, index: usize) -> Vec<StopSignal> {
            let mut launches = self.launches.lock();
            std::iter::from_fn(|| launches[index].control.try_recv().ok()).collect()
        }
    }

    impl MuxerLauncher for FakeLauncher {
        fn launch(
            &self,
            command: &MuxerCommand,
            generation: u64,
            events: mpsc::Sender<MuxerMessage>,
        ) -> Result<MuxerHandle> {
            if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(AppError::Spawn {
                    camera: command.camera.clone(),
                    binary: command.binary.clone(),
                    reason: "No such file or directory".to_string(),
                });
            }
            let (control_tx, control_rx) = mpsc::unbounded_channel();
            self.launches.lock().push(FakeLaunch {
                command: command.clone(),
                generation,
                events,
                control: control_rx,
            });
            Ok(MuxerHandle::new(generation, Some(4000 + generation as u32), control_tx))
        }
    }

    fn camera(name: &str) -> CameraConfig {
        CameraConfig {
            name: name.to_string(),
            source: vec!["-i".to_string(), format!("rtsp://{}/stream", name)],
            ..Default::default()
        }
    }

    fn settings(heartbeat_secs: u64) -> SessionSettings {
        SessionSettings {
            ffmpeg_path: "ffmpeg".to_string(),
            idle_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            viewer_queue_depth: 16,
        }
    }

    struct Fixture {
        handle: SessionHandle,
        launcher: Arc<FakeLauncher>,
        events: broadcast::Receiver<SystemEvent>,
    }

    fn spawn_with(camera: CameraConfig, settings: SessionSettings, admission: Arc<dyn AdmissionGate>) -> Fixture {
        let launcher = Arc::new(FakeLauncher::default());
        let bus = Arc::new(EventBus::new());
        let events = bus.subscribe();
        let handle = SessionCoordinator::spawn(camera, settings, launcher.clone(), admission, bus);
        Fixture {
            handle,
            launcher,
            events,
        }
    }

    fn spawn_default(name: &str) -> Fixture {
        // Long heartbeat so silent test viewers are not reaped
        spawn_with(camera(name), settings(3600), Arc::new(AllowAll))
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 20], port))
    }

    pub(crate) async fn wait_for<F>(rx: &mut broadcast::Receiver<SystemEvent>, pred: F) -> SystemEvent
    where
        F: Fn(&SystemEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                match rx.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) => continue,
                    Err(e) => panic!("event bus closed: {}", e),
                }
            }
        })
        .await
        .expect("event in time")
    }

    fn is_state(event: &SystemEvent, wanted: &str) -> bool {
        matches!(event, SystemEvent::SessionStateChanged { state, .. } if state == wanted)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_viewer_starts_muxer_once() {
        let fx = spawn_default("front-door");

        let _a = fx.handle.join(addr(5000)).unwrap();
        let _b = fx.handle.join(addr(5001)).unwrap();
        let _c = fx.handle.join(addr(5002)).unwrap();
        let snapshot = fx.handle.snapshot().await.unwrap();

        assert_eq!(fx.launcher.count(), 1);
        assert_eq!(snapshot.state, SessionState::Starting);
        assert_eq!(snapshot.viewers.len(), 3);
        assert_eq!(snapshot.muxer_pid, Some(4001));

        let args = fx.launcher.launches.lock()[0].command.args.join(" ");
        assert!(args.contains("-f mpegts -codec:v mpeg1video"));
        assert!(args.ends_with(" -"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_chunk_activates_and_reaches_viewers() {
        let mut fx = spawn_default("front-door");
        let mut viewer = fx.handle.join(addr(5000)).unwrap();
        fx.handle.snapshot().await.unwrap();

        fx.launcher
            .emit(0, MuxerEvent::Data(Bytes::from_static(b"\x47\x40\x11\x10")))
            .await;
        wait_for(&mut fx.events, |e| is_state(e, "active")).await;

        let header = viewer.endpoint.outbound.recv().await.unwrap();
        assert_eq!(header, Outbound::Binary(StreamFrameHeader::unknown().encode()));
        assert_eq!(
            viewer.endpoint.outbound.recv().await.unwrap(),
            Outbound::Binary(Bytes::from_static(b"\x47\x40\x11\x10"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_front_door_abnormal_exit() {
        let mut fx = spawn_default("front-door");
        let mut first = fx.handle.join(addr(5000)).unwrap();
        fx.handle.snapshot().await.unwrap();

        fx.launcher
            .emit(0, MuxerEvent::Dimensions { width: 1280, height: 720 })
            .await;
        let event = wait_for(&mut fx.events, |e| {
            matches!(e, SystemEvent::DimensionsDetected { .. })
        })
        .await;
        assert_eq!(
            event,
            SystemEvent::DimensionsDetected {
                camera: "front-door".to_string(),
                width: 1280,
                height: 720,
            }
        );

        // Viewers joining after detection get the real size
        let mut second = fx.handle.join(addr(5001)).unwrap();
        assert_eq!(
            second.endpoint.outbound.recv().await.unwrap(),
            Outbound::Binary(StreamFrameHeader::new(1280, 720).encode())
        );

        fx.launcher
            .emit(0, MuxerEvent::Exited(ExitInfo { code: Some(1), signal: None }))
            .await;
        let exited = wait_for(&mut fx.events, |e| matches!(e, SystemEvent::MuxerExited { .. })).await;
        assert!(matches!(exited, SystemEvent::MuxerExited { abnormal: true, .. }));
        wait_for(&mut fx.events, |e| {
            matches!(e, SystemEvent::SystemError { severity, .. } if severity == "error")
        })
        .await;
        wait_for(&mut fx.events, |e| is_state(e, "idle")).await;

        let snapshot = fx.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Idle);
        assert_eq!(snapshot.viewers.len(), 2);
        assert_eq!(snapshot.dimensions, Some((1280, 720)));
        assert!(snapshot.muxer_pid.is_none());
        assert!(matches!(
            first.endpoint.terminated.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
        // No automatic retry
        assert_eq!(fx.launcher.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_within_grace_keeps_muxer() {
        let mut fx = spawn_default("front-door");
        let viewer = fx.handle.join(addr(5000)).unwrap();
        fx.handle.snapshot().await.unwrap();
        fx.launcher.emit(0, MuxerEvent::Data(Bytes::from_static(b"ts"))).await;
        wait_for(&mut fx.events, |e| is_state(e, "active")).await;

        drop(viewer);
        assert!(fx.handle.snapshot().await.unwrap().idle_pending);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let _back = fx.handle.join(addr(5001)).unwrap();
        let snapshot = fx.handle.snapshot().await.unwrap();
        assert!(!snapshot.idle_pending);

        tokio::time::sleep(Duration::from_secs(120)).await;
        let snapshot = fx.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Active);
        assert!(fx.launcher.signals(0).is_empty());
        assert_eq!(fx.launcher.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_viewers_then_idle_stop() {
        let mut fx = spawn_default("front-door");
        let first = fx.handle.join(addr(5000)).unwrap();
        let second = fx.handle.join(addr(5001)).unwrap();
        fx.handle.snapshot().await.unwrap();
        fx.launcher.emit(0, MuxerEvent::Data(Bytes::from_static(b"ts"))).await;
        wait_for(&mut fx.events, |e| is_state(e, "active")).await;

        drop(first);
        let snapshot = fx.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.viewers.len(), 1);
        assert!(!snapshot.idle_pending);

        drop(second);
        let snapshot = fx.handle.snapshot().await.unwrap();
        assert!(snapshot.viewers.is_empty());
        assert!(snapshot.idle_pending);

        let start = Instant::now();
        wait_for(&mut fx.events, |e| is_state(e, "stopping")).await;
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(fx.launcher.signals(0), vec![StopSignal::Terminate]);

        // Nothing else is sent while waiting for the exit
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(fx.launcher.signals(0).is_empty());

        fx.launcher
            .emit(0, MuxerEvent::Exited(ExitInfo { code: None, signal: Some(15) }))
            .await;
        wait_for(&mut fx.events, |e| is_state(e, "idle")).await;
        assert_eq!(fx.launcher.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_applies_while_starting() {
        let mut fx = spawn_default("garage");
        let viewer = fx.handle.join(addr(5000)).unwrap();
        fx.handle.snapshot().await.unwrap();
        drop(viewer);

        wait_for(&mut fx.events, |e| is_state(e, "stopping")).await;
        assert_eq!(fx.launcher.signals(0), vec![StopSignal::Terminate]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_while_stopping_restarts_after_exit() {
        let mut fx = spawn_default("front-door");
        let viewer = fx.handle.join(addr(5000)).unwrap();
        fx.handle.snapshot().await.unwrap();
        drop(viewer);
        wait_for(&mut fx.events, |e| is_state(e, "stopping")).await;

        let _late = fx.handle.join(addr(5001)).unwrap();
        let snapshot = fx.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Stopping);
        assert_eq!(fx.launcher.count(), 1);

        fx.launcher
            .emit(0, MuxerEvent::Exited(ExitInfo { code: Some(255), signal: None }))
            .await;
        wait_for(&mut fx.events, |e| matches!(e, SystemEvent::MuxerStarted { .. })).await;

        assert_eq!(fx.launcher.count(), 2);
        assert_eq!(fx.launcher.launches.lock()[1].generation, 2);

        // Output of the previous muxer is ignored
        fx.launcher.emit(0, MuxerEvent::Data(Bytes::from_static(b"old"))).await;
        let snapshot = fx.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Starting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_removes_unresponsive_viewer() {
        let mut fx = spawn_with(camera("porch"), settings(10), Arc::new(AllowAll));
        let mut viewer = fx.handle.join(addr(5000)).unwrap();
        let start = Instant::now();

        let event = wait_for(&mut fx.events, |e| {
            matches!(e, SystemEvent::ViewerDisconnected { .. })
        })
        .await;
        assert!(matches!(
            event,
            SystemEvent::ViewerDisconnected { ref reason, total: 0, .. } if reason == "heartbeat_timeout"
        ));
        assert!(start.elapsed() <= Duration::from_secs(20));

        assert!(matches!(
            viewer.endpoint.terminated.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
        assert!(fx.handle.snapshot().await.unwrap().idle_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_responsive_viewer_survives_heartbeats() {
        let fx = spawn_with(camera("porch"), settings(10), Arc::new(AllowAll));
        let viewer = fx.handle.join(addr(5000)).unwrap();

        // Answer halfway between probes
        tokio::time::sleep(Duration::from_secs(5)).await;
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            viewer.endpoint.mark_alive();
        }
        assert_eq!(fx.handle.snapshot().await.unwrap().viewers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_denied_keeps_viewer_idle() {
        let gate = Arc::new(CappedAdmission::new(1));
        let front = spawn_with(camera("front-door"), settings(3600), gate.clone());
        let mut garage = spawn_with(camera("garage"), settings(3600), gate.clone());

        let _a = front.handle.join(addr(5000)).unwrap();
        front.handle.snapshot().await.unwrap();

        let mut b = garage.handle.join(addr(5001)).unwrap();
        wait_for(&mut garage.events, |e| {
            matches!(e, SystemEvent::AdmissionDenied { .. })
        })
        .await;

        let snapshot = garage.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Idle);
        assert_eq!(snapshot.viewers.len(), 1);
        assert_eq!(garage.launcher.count(), 0);
        assert!(matches!(b.endpoint.outbound.try_recv(), Ok(Outbound::Binary(_))));
        assert!(b.endpoint.outbound.try_recv().is_err());
        assert_eq!(gate.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_failure_releases_admission() {
        let gate = Arc::new(CappedAdmission::new(1));
        let mut fx = spawn_with(camera("front-door"), settings(3600), gate.clone());
        fx.launcher
            .fail
            .store(true, std::sync::atomic::Ordering::Relaxed);

        let _viewer = fx.handle.join(addr(5000)).unwrap();
        wait_for(&mut fx.events, |e| matches!(e, SystemEvent::SystemError { .. })).await;

        let snapshot = fx.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Idle);
        assert_eq!(gate.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_command() {
        let mut fx = spawn_default("front-door");
        let _viewer = fx.handle.join(addr(5000)).unwrap();
        fx.handle.snapshot().await.unwrap();

        fx.handle.restart().unwrap();
        wait_for(&mut fx.events, |e| is_state(e, "stopping")).await;
        assert_eq!(fx.launcher.signals(0), vec![StopSignal::Terminate]);

        fx.launcher
            .emit(0, MuxerEvent::Exited(ExitInfo { code: Some(255), signal: None }))
            .await;
        wait_for(&mut fx.events, |e| matches!(e, SystemEvent::MuxerStarted { .. })).await;
        assert_eq!(fx.launcher.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_kills_muxer_and_closes_viewers() {
        let gate = Arc::new(CappedAdmission::new(4));
        let fx = spawn_with(camera("front-door"), settings(3600), gate.clone());
        let mut viewer = fx.handle.join(addr(5000)).unwrap();
        fx.handle.snapshot().await.unwrap();
        assert_eq!(gate.active_count(), 1);

        fx.handle.shutdown().await;

        assert_eq!(fx.launcher.signals(0), vec![StopSignal::Kill]);
        assert_eq!(gate.active_count(), 0);
        assert!(matches!(
            viewer.endpoint.terminated.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
        assert!(fx.handle.snapshot().await.is_err());
        assert!(fx.handle.join(addr(5001)).is_err());
    }
}
