//! Error types for the FOTA engine.

use derive_more::{Display, From};

/// Failure talking to the update server.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum FetchError {
    /// The endpoint could not be reached or the connection broke.
    #[display("network error: {_0}")]
    Network(String),
    /// The server answered with something other than 200.
    #[display("unexpected HTTP status {_0}")]
    Status(u16),
    /// The body could not be decoded or was missing fields.
    #[display("malformed response: {_0}")]
    Malformed(String),
    /// The server returned a different chunk than the one requested.
    #[display("requested chunk {requested}, server sent {received}")]
    IndexMismatch {
        /// Index the device asked for.
        requested: u32,
        /// `chunk_number` in the response body.
        received: u32,
    },
}

impl std::error::Error for FetchError {}

/// Failure of the persistent state store or the program storage.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum StorageError {
    /// The storage backend reported an error.
    #[display("storage backend error: {_0}")]
    Backend(String),
    /// The image does not fit in the update slot.
    #[display("image of {requested} bytes exceeds slot of {capacity} bytes")]
    TooLarge {
        /// Bytes requested by `begin`.
        requested: u32,
        /// Bytes available in the slot.
        capacity: u32,
    },
    /// `write` accepted fewer bytes than it was given.
    #[display("short write: {written} of {expected} bytes")]
    ShortWrite {
        /// Bytes accepted.
        written: usize,
        /// Bytes offered.
        expected: usize,
    },
    /// An operation was issued without an open `begin`.
    #[display("no update in progress")]
    NotStarted,
}

impl std::error::Error for StorageError {}

/// Why an update cycle ended in `Aborted`.
#[derive(Debug, Clone, PartialEq, Eq, Display, From)]
pub enum FotaError {
    /// Manifest or chunk fetch failed; retried on the next cycle.
    #[display("network failure: {_0}")]
    #[from]
    Network(FetchError),
    /// The manifest violates its validity invariant.
    #[display("invalid manifest: {_0}")]
    ManifestInvalid(&'static str),
    /// The server answered a chunk request with another chunk.
    #[display("chunk index mismatch: requested {requested}, received {received}")]
    ChunkIndexMismatch {
        /// Index the device asked for.
        requested: u32,
        /// Index the server returned.
        received: u32,
    },
    /// A chunk failed MAC verification.
    #[display("authentication failure on chunk {index}")]
    Authentication {
        /// Index of the rejected chunk.
        index: u32,
    },
    /// The image digest does not match the manifest hash.
    #[display("image hash mismatch: expected {expected}, computed {actual}")]
    ImageIntegrity {
        /// Lowercase hex hash from the manifest.
        expected: String,
        /// Lowercase hex hash of the written plaintext.
        actual: String,
    },
    /// The written plaintext length disagrees with the manifest size.
    #[display("image size mismatch: expected {expected} bytes, got {actual}")]
    ImageSize {
        /// Size from the manifest.
        expected: u32,
        /// Bytes written (or about to be written).
        actual: u64,
    },
    /// The state store or the flash writer failed.
    #[display("storage failure: {_0}")]
    #[from]
    Storage(StorageError),
}

impl std::error::Error for FotaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Network(e) => Some(e),
            Self::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl FotaError {
    /// Whether the failure is transient: the next cycle is expected to
    /// succeed from where this one stopped.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::ChunkIndexMismatch { .. })
    }

    /// Whether the persisted progress record is left in place.
    #[must_use]
    pub fn preserves_progress(&self) -> bool {
        !matches!(
            self,
            Self::ImageIntegrity { .. } | Self::ImageSize { .. } | Self::Storage(_)
        )
    }
}
