//! Process-wide map of camera sessions

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::admission::{gate_for_limit, AdmissionGate};
use super::coordinator::{SessionCoordinator, SessionHandle, SessionSettings, SessionSnapshot};
use super::muxer::MuxerLauncher;
use crate::config::{CameraConfig, StreamConfig};
use crate::events::EventBus;

/// Owns one coordinator per camera and the shared admission gate
///
/// Sessions are created lazily on the first lookup and live until
/// [`SessionRegistry::shutdown_all`].
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    admission: Arc<dyn AdmissionGate>,
    launcher: Arc<dyn MuxerLauncher>,
    events: Arc<EventBus>,
    defaults: StreamConfig,
}

impl SessionRegistry {
    /// Registry whose gate follows `defaults.max_sessions`
    pub fn new(defaults: StreamConfig, launcher: Arc<dyn MuxerLauncher>, events: Arc<EventBus>) -> Self {
        let admission = gate_for_limit(defaults.max_sessions);
        Self::with_admission(defaults, admission, launcher, events)
    }

    pub fn with_admission(
        defaults: StreamConfig,
        admission: Arc<dyn AdmissionGate>,
        launcher: Arc<dyn MuxerLauncher>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            admission,
            launcher,
            events,
            defaults,
        }
    }

    /// Handle for `camera`, spawning its coordinator on first use
    pub fn get_or_create(&self, camera: &CameraConfig) -> SessionHandle {
        if let Some(handle) = self.get(&camera.name) {
            return handle;
        }

        let mut sessions = self.sessions.write();
        // Another caller may have won the race for the write lock
        if let Some(handle) = sessions.get(&camera.name).filter(|h| !h.is_closed()) {
            return handle.clone();
        }

        let handle = SessionCoordinator::spawn(
            camera.clone(),
            SessionSettings::for_camera(camera, &self.defaults),
            self.launcher.clone(),
            self.admission.clone(),
            self.events.clone(),
        );
        info!(camera = %camera.name, "Session created");
        sessions.insert(camera.name.clone(), handle.clone());
        handle
    }

    /// Existing live session for `name`
    pub fn get(&self, name: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .get(name)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    pub fn request_admission(&self, camera: &str) -> bool {
        self.admission.request_session(camera)
    }

    pub fn release_admission(&self, camera: &str) {
        self.admission.close_session(camera)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Snapshots of all live sessions, sorted by camera name
    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        let handles: Vec<SessionHandle> = self.sessions.read().values().cloned().collect();

        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(snapshot) = handle.snapshot().await {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by(|a, b| a.camera.cmp(&b.camera));
        snapshots
    }

    /// Kill every muxer and close every viewer, skipping idle timers
    pub async fn shutdown_all(&self) {
        let handles: Vec<SessionHandle> = self.sessions.write().drain().map(|(_, h)| h).collect();
        if handles.is_empty() {
            return;
        }

        info!("Shutting down {} session(s)", handles.len());
        futures::future::join_all(handles.iter().map(|handle| handle.shutdown())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::admission::CappedAdmission;
    use crate::stream::coordinator::tests::FakeLauncher;
    use crate::stream::coordinator::SessionState;
    use crate::stream::muxer::StopSignal;
    use std::net::SocketAddr;

    fn camera(name: &str) -> CameraConfig {
        CameraConfig {
            name: name.to_string(),
            source: vec!["-i".to_string(), format!("rtsp://{}/stream", name)],
            ..Default::default()
        }
    }

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    fn registry(launcher: Arc<FakeLauncher>) -> SessionRegistry {
        SessionRegistry::new(StreamConfig::default(), launcher, Arc::new(EventBus::new()))
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let registry = registry(Arc::new(FakeLauncher::default()));
        let a = registry.get_or_create(&camera("front-door"));
        let b = registry.get_or_create(&camera("front-door"));
        registry.get_or_create(&camera("garage"));

        assert_eq!(a.camera(), b.camera());
        assert_eq!(registry.len(), 2);
        assert!(registry.get("front-door").is_some());
        assert!(registry.get("porch").is_none());
    }

    #[tokio::test]
    async fn test_handles_share_one_coordinator() {
        let launcher = Arc::new(FakeLauncher::default());
        let registry = registry(launcher.clone());

        let _a = registry.get_or_create(&camera("front-door")).join(addr()).unwrap();
        let _b = registry.get_or_create(&camera("front-door")).join(addr()).unwrap();

        let snapshots = registry.snapshots().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].viewers.len(), 2);
        assert_eq!(snapshots[0].state, SessionState::Starting);
        assert_eq!(launcher.count(), 1);
    }

    #[tokio::test]
    async fn test_admission_delegates_to_gate() {
        let registry = SessionRegistry::with_admission(
            StreamConfig::default(),
            Arc::new(CappedAdmission::new(1)),
            Arc::new(FakeLauncher::default()),
            Arc::new(EventBus::new()),
        );

        assert!(registry.request_admission("front-door"));
        assert!(!registry.request_admission("garage"));
        registry.release_admission("front-door");
        assert!(registry.request_admission("garage"));
    }

    #[tokio::test]
    async fn test_shutdown_all_kills_every_muxer() {
        let launcher = Arc::new(FakeLauncher::default());
        let registry = registry(launcher.clone());

        let _a = registry.get_or_create(&camera("front-door")).join(addr()).unwrap();
        let _b = registry.get_or_create(&camera("garage")).join(addr()).unwrap();
        assert_eq!(registry.snapshots().await.len(), 2);

        registry.shutdown_all().await;

        assert!(registry.is_empty());
        assert_eq!(launcher.signals(0), vec![StopSignal::Kill]);
        assert_eq!(launcher.signals(1), vec![StopSignal::Kill]);
        assert!(registry.snapshots().await.is_empty());
    }
}
