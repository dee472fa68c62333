//! Contract with the real-time sync engine.
//!
//! The engine owns live documents and their merge algorithm; this crate
//! only asks it for the current binary state, hands it state loaded from
//! storage, and decodes/encodes binary state into document handles.
//!
//! [`YrsEngine`] is the in-process implementation over Yrs documents:
//!
//! ```text
//! page_id ──► yrs::Doc ──encode_state──► Vec<u8> (update v1, full state)
//!                ▲
//!                └──── decode_state ◄── Vec<u8>
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::error::{DecodeError, EngineError};

/// Live document state provider.
#[async_trait]
pub trait SyncEngine: Send + Sync {
    /// Full binary state of a loaded document, `None` when not loaded.
    async fn current_state(&self, page_id: &str) -> Option<Vec<u8>>;

    /// Merge persisted state into the live document, loading it if needed.
    async fn load_state(&self, page_id: &str, state: &[u8]) -> Result<(), EngineError>;

    /// Drop the live document.
    async fn unload(&self, page_id: &str);
}

/// Decode binary state (Yrs update v1) into a fresh document handle.
pub fn decode_state(state: &[u8]) -> Result<Doc, DecodeError> {
    let update = Update::decode_v1(state).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    }
    Ok(doc)
}

/// Encode a document handle as its full binary state.
pub fn encode_state(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

/// Sync engine backed by in-memory Yrs documents.
#[derive(Default)]
pub struct YrsEngine {
    docs: RwLock<HashMap<String, Doc>>,
}

impl YrsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an incremental update from a client, creating the document if absent.
    pub async fn apply_update(&self, page_id: &str, update: &[u8]) -> Result<(), EngineError> {
        let rejected = |reason: String| EngineError::Rejected {
            page_id: page_id.to_string(),
            reason,
        };
        let update = Update::decode_v1(update).map_err(|e| rejected(e.to_string()))?;

        let mut docs = self.docs.write().await;
        let doc = docs.entry(page_id.to_string()).or_insert_with(Doc::new);
        let mut txn = doc.transact_mut();
        txn.apply_update(update).map_err(|e| rejected(e.to_string()))
    }

    pub async fn is_loaded(&self, page_id: &str) -> bool {
        self.docs.read().await.contains_key(page_id)
    }

    pub async fn loaded_count(&self) -> usize {
        self.docs.read().await.len()
    }
}

#[async_trait]
impl SyncEngine for YrsEngine {
    async fn current_state(&self, page_id: &str) -> Option<Vec<u8>> {
        let docs = self.docs.read().await;
        docs.get(page_id).map(encode_state)
    }

    async fn load_state(&self, page_id: &str, state: &[u8]) -> Result<(), EngineError> {
        self.apply_update(page_id, state).await
    }

    async fn unload(&self, page_id: &str) {
        self.docs.write().await.remove(page_id);
    }
}
