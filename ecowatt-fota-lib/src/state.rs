//! Persisted update progress and the store that keeps it.

use crate::digest::{DigestCheckpoint, ImageDigest};
use crate::error::StorageError;
use crate::manifest::UpdateManifest;
use serde::{Deserialize, Serialize};

/// Resumable progress record of an in-flight update.
///
/// Invariant: `next_chunk_index <= total_chunks`, `written <= size` and the
/// digest checkpoint covers exactly the `written` bytes. Records violating
/// it decode as absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateState {
    #[serde(rename = "target")]
    pub target_version: String,
    /// Next chunk not yet applied.
    #[serde(rename = "next")]
    pub next_chunk_index: u32,
    #[serde(rename = "total")]
    pub total_chunks: u32,
    pub size: u32,
    #[serde(rename = "chunk")]
    pub chunk_size: u32,
    #[serde(rename = "hash")]
    pub content_hash: String,
    pub iv: String,
    /// Plaintext bytes written to storage so far.
    pub written: u32,
    /// Running digest over the `written` bytes.
    pub digest: DigestCheckpoint,
}

impl UpdateState {
    /// Fresh record for `manifest`, starting at chunk 0.
    #[must_use]
    pub fn from_manifest(manifest: &UpdateManifest) -> Self {
        Self {
            target_version: manifest.version.clone(),
            next_chunk_index: 0,
            total_chunks: manifest.total_chunks,
            size: manifest.size,
            chunk_size: manifest.chunk_size,
            content_hash: manifest.content_hash.clone(),
            iv: manifest.iv.clone(),
            written: 0,
            digest: ImageDigest::new().checkpoint(),
        }
    }

    /// Whether this record describes the image published in `manifest`.
    #[must_use]
    pub fn matches(&self, manifest: &UpdateManifest) -> bool {
        self.target_version == manifest.version
            && self.content_hash.eq_ignore_ascii_case(&manifest.content_hash)
            && self.total_chunks == manifest.total_chunks
            && self.size == manifest.size
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.next_chunk_index == self.total_chunks
    }

    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.next_chunk_index <= self.total_chunks
            && self.written <= self.size
            && self.digest.length == u64::from(self.written)
            && ImageDigest::restore(&self.digest).is_some()
    }

    /// Serialize for storage.
    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(self).map_err(|e| StorageError::Backend(format!("encode state: {e}")))
    }

    /// Parse a stored record. Malformed or inconsistent records yield `None`.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let state: Self = match serde_json::from_slice(bytes) {
            Ok(state) => state,
            Err(e) => {
                log::warn!("FOTA: discarding unreadable state record: {e}");
                return None;
            }
        };
        if !state.is_consistent() {
            log::warn!(
                "FOTA: discarding inconsistent state record (next={}/{}, written={}/{})",
                state.next_chunk_index,
                state.total_chunks,
                state.written,
                state.size
            );
            return None;
        }
        Some(state)
    }
}

/// Durable home of the [`UpdateState`] record and the pending-boot marker.
///
/// Every mutating call must be durable before it returns.
pub trait StateStore {
    /// The stored record, or `None` if absent or not well-formed.
    fn load(&mut self) -> Option<UpdateState>;

    fn save(&mut self, state: &UpdateState) -> Result<(), StorageError>;

    /// Remove the record. Removing an absent record succeeds.
    fn clear(&mut self) -> Result<(), StorageError>;

    /// Record that a new image was committed and awaits boot confirmation.
    fn mark_pending_boot(&mut self) -> Result<(), StorageError>;

    fn is_pending_boot(&mut self) -> bool;

    fn clear_pending_boot(&mut self) -> Result<(), StorageError>;
}
