use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::ConfigStore;
use crate::error::{AppError, Result};
use crate::events::EventBus;
use crate::stream::{SessionHandle, SessionRegistry};

/// Application-wide state shared across handlers
///
/// All session operations go through `registry`; coordinators are created
/// on demand for cameras present in the configuration.
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// Camera sessions and admission accounting
    pub registry: Arc<SessionRegistry>,
    /// Event bus for real-time notifications
    pub events: Arc<EventBus>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(
        config: ConfigStore,
        registry: Arc<SessionRegistry>,
        events: Arc<EventBus>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            events,
            shutdown_tx,
        })
    }

    /// Session for a configured camera, created on first use
    pub fn session(&self, camera: &str) -> Result<SessionHandle> {
        let config = self.config.get();
        let camera = config
            .camera(camera)
            .ok_or_else(|| AppError::NotFound(format!("Camera '{}'", camera)))?;
        Ok(self.registry.get_or_create(camera))
    }

    /// Subscribe to shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}
