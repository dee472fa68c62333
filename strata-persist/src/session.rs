//! Per-instance bookkeeping of live documents.
//!
//! One [`SessionRegistry`] owns, per document: the set of active sessions,
//! the last persisted fingerprint, and the periodic snapshot timer. All
//! three are scoped to this process; another instance serving the same
//! document keeps its own.

use std::collections::{HashMap, HashSet};

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::fingerprint::{ChangeDetector, Fingerprint};

/// What [`SessionRegistry::release`] tore down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Released {
    pub sessions: usize,
    pub timer_cancelled: bool,
    pub fingerprint_dropped: bool,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, HashSet<Uuid>>,
    detector: ChangeDetector,
    timers: HashMap<String, JoinHandle<()>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    /// Register a session; returns the document's active session count.
    /// Registering the same session twice is a no-op.
    pub fn open_session(&mut self, page_id: &str, session_id: Uuid) -> usize {
        let sessions = self.sessions.entry(page_id.to_string()).or_default();
        sessions.insert(session_id);
        sessions.len()
    }

    /// Remove a session; returns how many remain for the document.
    pub fn close_session(&mut self, page_id: &str, session_id: Uuid) -> usize {
        let Some(sessions) = self.sessions.get_mut(page_id) else {
            return 0;
        };
        sessions.remove(&session_id);
        let remaining = sessions.len();
        if remaining == 0 {
            self.sessions.remove(page_id);
        }
        remaining
    }

    pub fn session_count(&self, page_id: &str) -> usize {
        self.sessions.get(page_id).map_or(0, HashSet::len)
    }

    // ─── Fingerprints ─────────────────────────────────────────────────

    /// See [`ChangeDetector::should_persist`].
    pub fn should_persist(&mut self, page_id: &str, state: &[u8]) -> bool {
        self.detector.should_persist(page_id, state)
    }

    /// Roll back the fingerprint recorded for a failed attempt.
    pub fn invalidate_fingerprint(&mut self, page_id: &str, state: &[u8]) {
        self.detector.invalidate(page_id, state);
    }

    pub fn fingerprint(&self, page_id: &str) -> Option<&Fingerprint> {
        self.detector.get(page_id)
    }

    pub fn fingerprint_count(&self) -> usize {
        self.detector.len()
    }

    // ─── Timers ───────────────────────────────────────────────────────

    /// Register the periodic timer for a document, aborting any previous one.
    pub fn install_timer(&mut self, page_id: &str, timer: JoinHandle<()>) {
        if let Some(previous) = self.timers.insert(page_id.to_string(), timer) {
            previous.abort();
        }
    }

    pub fn cancel_timer(&mut self, page_id: &str) -> bool {
        match self.timers.remove(page_id) {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    pub fn has_timer(&self, page_id: &str) -> bool {
        self.timers.contains_key(page_id)
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    // ─── Teardown ─────────────────────────────────────────────────────

    /// Forget everything held for a document.
    pub fn release(&mut self, page_id: &str) -> Released {
        Released {
            sessions: self.sessions.remove(page_id).map_or(0, |s| s.len()),
            timer_cancelled: self.cancel_timer(page_id),
            fingerprint_dropped: self.detector.forget(page_id),
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_session_counting() {
        let mut registry = SessionRegistry::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(registry.open_session("doc", a), 1);
        assert_eq!(registry.open_session("doc", a), 1);
        assert_eq!(registry.open_session("doc", b), 2);
        assert_eq!(registry.open_session("other", a), 1);

        assert_eq!(registry.close_session("doc", a), 1);
        assert_eq!(registry.close_session("doc", b), 0);
        assert_eq!(registry.session_count("doc"), 0);
        assert_eq!(registry.session_count("other"), 1);
        assert!(!registry.sessions.contains_key("doc"));

        // unknown session on unknown document
        assert_eq!(registry.close_session("missing", a), 0);
    }

    #[tokio::test]
    async fn test_timers_cancel_independently() {
        let mut registry = SessionRegistry::new();
        let forever = || tokio::spawn(tokio::time::sleep(Duration::from_secs(3600)));

        registry.install_timer("a", forever());
        registry.install_timer("b", forever());
        assert_eq!(registry.timer_count(), 2);

        assert!(registry.cancel_timer("a"));
        assert!(!registry.cancel_timer("a"));
        assert!(!registry.has_timer("a"));
        assert!(registry.has_timer("b"));
    }

    #[tokio::test]
    async fn test_release_drops_everything() {
        let mut registry = SessionRegistry::new();
        registry.open_session("doc", Uuid::new_v4());
        registry.should_persist("doc", b"state");
        registry.install_timer("doc", tokio::spawn(async {}));

        let released = registry.release("doc");
        assert_eq!(
            released,
            Released {
                sessions: 1,
                timer_cancelled: true,
                fingerprint_dropped: true
            }
        );
        assert!(registry.fingerprint("doc").is_none());
        assert_eq!(registry.fingerprint_count(), 0);
        assert_eq!(registry.release("doc"), Released::default());
    }
}
