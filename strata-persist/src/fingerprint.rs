//! Change detection by content fingerprint.
//!
//! A fingerprint is the SHA-256 digest of a document's full binary state.
//! Entries live in process memory only and are scoped to the lifetime of a
//! document's sessions.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

/// Fixed-length content digest.
pub type Fingerprint = [u8; 32];

/// SHA-256 of `state`.
pub fn fingerprint(state: &[u8]) -> Fingerprint {
    Sha256::digest(state).into()
}

/// Suppresses persistence of unchanged document state.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    last: HashMap<String, Fingerprint>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// `false` with no side effect when `state` matches the last recorded
    /// fingerprint; otherwise records the new fingerprint and returns `true`.
    pub fn should_persist(&mut self, document_id: &str, state: &[u8]) -> bool {
        let digest = fingerprint(state);
        match self.last.get(document_id) {
            Some(previous) if *previous == digest => false,
            _ => {
                self.last.insert(document_id.to_string(), digest);
                true
            }
        }
    }

    /// Drop the recorded fingerprint if it still equals the digest of `state`.
    ///
    /// Used when a persistence attempt failed after `should_persist` said yes.
    pub fn invalidate(&mut self, document_id: &str, state: &[u8]) {
        let digest = fingerprint(state);
        if self.last.get(document_id) == Some(&digest) {
            self.last.remove(document_id);
        }
    }

    pub fn forget(&mut self, document_id: &str) -> bool {
        self.last.remove(document_id).is_some()
    }

    pub fn get(&self, document_id: &str) -> Option<&Fingerprint> {
        self.last.get(document_id)
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        assert_eq!(fingerprint(b"state"), fingerprint(b"state"));
        assert_ne!(fingerprint(b"state"), fingerprint(b"state!"));
        assert_eq!(
            hex::encode(fingerprint(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_identical_state_is_suppressed() {
        let mut detector = ChangeDetector::new();
        assert!(detector.should_persist("doc", b"v1"));
        assert!(!detector.should_persist("doc", b"v1"));
        assert!(!detector.should_persist("doc", b"v1"));
        assert!(detector.should_persist("doc", b"v2"));
        assert!(detector.should_persist("doc", b"v1"));
    }

    #[test]
    fn test_documents_are_independent() {
        let mut detector = ChangeDetector::new();
        assert!(detector.should_persist("a", b"same"));
        assert!(detector.should_persist("b", b"same"));
        assert_eq!(detector.len(), 2);
    }

    #[test]
    fn test_forget_allows_repersist() {
        let mut detector = ChangeDetector::new();
        detector.should_persist("doc", b"v1");
        assert!(detector.forget("doc"));
        assert!(!detector.forget("doc"));
        assert!(detector.is_empty());
        assert!(detector.should_persist("doc", b"v1"));
    }

    #[test]
    fn test_invalidate_only_matching_digest() {
        let mut detector = ChangeDetector::new();
        detector.should_persist("doc", b"v2");

        detector.invalidate("doc", b"v1");
        assert!(detector.get("doc").is_some());

        detector.invalidate("doc", b"v2");
        assert!(detector.get("doc").is_none());
    }
}
