//! Admission gate deciding whether a camera may start a session

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Global policy hook consulted before a muxer is started
///
/// `close_session` is called exactly once for every `request_session` that
/// returned `true`.
pub trait AdmissionGate: Send + Sync {
    fn request_session(&self, camera: &str) -> bool;
    fn close_session(&self, camera: &str);
}

/// Grants every request
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AdmissionGate for AllowAll {
    fn request_session(&self, _camera: &str) -> bool {
        true
    }

    fn close_session(&self, _camera: &str) {}
}

/// Caps the number of cameras running at the same time
pub struct CappedAdmission {
    max_sessions: usize,
    active: Mutex<HashSet<String>>,
}

impl CappedAdmission {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

impl AdmissionGate for CappedAdmission {
    fn request_session(&self, camera: &str) -> bool {
        let mut active = self.active.lock();
        if active.contains(camera) {
            return true;
        }
        if active.len() >= self.max_sessions {
            info!(
                camera = %camera,
                "Session refused: {}/{} sessions active",
                active.len(),
                self.max_sessions
            );
            return false;
        }
        active.insert(camera.to_string());
        debug!(camera = %camera, "Session admitted ({} active)", active.len());
        true
    }

    fn close_session(&self, camera: &str) {
        if self.active.lock().remove(camera) {
            debug!(camera = %camera, "Session slot released");
        }
    }
}

/// Gate matching a `max_sessions` setting (0 = unlimited)
pub fn gate_for_limit(max_sessions: usize) -> Arc<dyn AdmissionGate> {
    if max_sessions == 0 {
        Arc::new(AllowAll)
    } else {
        Arc::new(CappedAdmission::new(max_sessions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all() {
        let gate = AllowAll;
        assert!(gate.request_session("front-door"));
        gate.close_session("front-door");
    }

    #[test]
    fn test_capped_admission() {
        let gate = CappedAdmission::new(1);
        assert!(gate.request_session("front-door"));
        assert!(!gate.request_session("garage"));
        assert_eq!(gate.active_count(), 1);

        gate.close_session("front-door");
        assert_eq!(gate.active_count(), 0);
        assert!(gate.request_session("garage"));
    }

    #[test]
    fn test_close_unknown_is_noop() {
        let gate = CappedAdmission::new(2);
        gate.close_session("porch");
        assert_eq!(gate.active_count(), 0);
    }
}
