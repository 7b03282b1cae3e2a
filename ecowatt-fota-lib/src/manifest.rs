//! Manifest, chunk and report wire types.

use crate::crypto::{IV_LEN, MAC_LEN};
use crate::digest::DIGEST_LEN;
use crate::error::FetchError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Descriptor of the currently published firmware image
/// (`GET {api}/manifest`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateManifest {
    /// Opaque version identifier, compared for equality only.
    pub version: String,
    /// Plaintext image size in bytes.
    pub size: u32,
    /// Nominal chunk size, for bookkeeping only.
    pub chunk_size: u32,
    /// Number of chunks composing the image.
    pub total_chunks: u32,
    /// Hex SHA-256 of the complete plaintext image.
    #[serde(rename = "hash")]
    pub content_hash: String,
    /// Hex base IV of the image.
    pub iv: String,
}

impl UpdateManifest {
    /// Check the manifest validity invariant.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.version.is_empty() {
            return Err("empty version");
        }
        if self.size == 0 {
            return Err("size is zero");
        }
        if self.total_chunks == 0 {
            return Err("total_chunks is zero");
        }
        if self.content_hash.len() != DIGEST_LEN * 2 || hex::decode(&self.content_hash).is_err() {
            return Err("hash is not 64 hex digits");
        }
        if self.iv.len() != IV_LEN * 2 || hex::decode(&self.iv).is_err() {
            return Err("iv is not 32 hex digits");
        }
        Ok(())
    }
}

/// Chunk as sent by the server (`GET {api}/chunk?version=..&n=..`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkResponse {
    pub chunk_number: u32,
    /// Hex 16-byte IV for this chunk.
    pub iv: String,
    /// Hex HMAC-SHA-256 tag.
    pub mac: String,
    /// Base64 ciphertext.
    pub data: String,
}

/// A decoded chunk, ready for verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u32,
    pub iv: [u8; IV_LEN],
    pub mac: [u8; MAC_LEN],
    pub ciphertext: Vec<u8>,
}

impl ChunkResponse {
    /// Decode hex and base64 fields and check the chunk number against the
    /// one that was requested.
    pub fn decode(self, requested: u32) -> Result<Chunk, FetchError> {
        if self.chunk_number != requested {
            return Err(FetchError::IndexMismatch {
                requested,
                received: self.chunk_number,
            });
        }

        let mut iv = [0u8; IV_LEN];
        hex::decode_to_slice(&self.iv, &mut iv)
            .map_err(|e| FetchError::Malformed(format!("chunk iv: {e}")))?;
        let mut mac = [0u8; MAC_LEN];
        hex::decode_to_slice(&self.mac, &mut mac)
            .map_err(|e| FetchError::Malformed(format!("chunk mac: {e}")))?;
        let ciphertext = BASE64
            .decode(self.data.as_bytes())
            .map_err(|e| FetchError::Malformed(format!("chunk data: {e}")))?;
        if ciphertext.is_empty() {
            return Err(FetchError::Malformed("chunk data is empty".to_string()));
        }

        Ok(Chunk {
            index: self.chunk_number,
            iv,
            mac,
            ciphertext,
        })
    }
}

impl Chunk {
    /// Encode back into the wire representation.
    #[must_use]
    pub fn to_response(&self) -> ChunkResponse {
        ChunkResponse {
            chunk_number: self.index,
            iv: hex::encode(self.iv),
            mac: hex::encode(self.mac),
            data: BASE64.encode(&self.ciphertext),
        }
    }
}

/// Progress status reported to `POST {api}/report`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    /// A chunk was verified, written and persisted.
    ChunkOk,
    /// The final image hash did not match.
    ShaFail,
    /// The image was committed; the device is about to reboot.
    Done,
}

/// Body of `POST {api}/report`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub device_id: String,
    pub status: ReportStatus,
    pub chunk: u32,
    pub version: String,
}

/// Body of `POST {api}/boot_ok`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootConfirm {
    pub device_id: String,
}
