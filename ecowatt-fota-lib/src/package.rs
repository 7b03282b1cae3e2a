//! Server-side preparation of a firmware image for chunked delivery.

use crate::crypto::{chunk_iv, FotaKeys, BLOCK_LEN, IV_LEN};
use crate::manifest::{Chunk, ChunkResponse, UpdateManifest};
use derive_more::Display;
use sha2::{Digest, Sha256};

/// Reasons an image cannot be packaged.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum PackageError {
    #[display("firmware image is empty")]
    EmptyImage,
    #[display("firmware image of {_0} bytes is too large")]
    TooLarge(usize),
    #[display("chunk size {_0} is not a non-zero multiple of 16")]
    BadChunkSize(u32),
}

impl std::error::Error for PackageError {}

/// A firmware image split into authenticated, encrypted chunks.
#[derive(Debug, Clone)]
pub struct FirmwarePackage {
    version: String,
    image: Vec<u8>,
    chunk_size: u32,
    base_iv: [u8; IV_LEN],
    content_hash: String,
    keys: FotaKeys,
}

impl FirmwarePackage {
    pub fn new(
        version: impl Into<String>,
        image: Vec<u8>,
        chunk_size: u32,
        base_iv: [u8; IV_LEN],
        keys: FotaKeys,
    ) -> Result<Self, PackageError> {
        if image.is_empty() {
            return Err(PackageError::EmptyImage);
        }
        if u32::try_from(image.len()).is_err() {
            return Err(PackageError::TooLarge(image.len()));
        }
        if chunk_size == 0 || chunk_size % BLOCK_LEN != 0 {
            return Err(PackageError::BadChunkSize(chunk_size));
        }
        let content_hash = hex::encode(Sha256::digest(&image));
        Ok(Self {
            version: version.into(),
            image,
            chunk_size,
            base_iv,
            content_hash,
            keys,
        })
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    #[must_use]
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    #[allow(clippy::cast_possible_truncation)] // length checked in new()
    fn size(&self) -> u32 {
        self.image.len() as u32
    }

    #[must_use]
    pub fn total_chunks(&self) -> u32 {
        self.size().div_ceil(self.chunk_size)
    }

    #[must_use]
    pub fn manifest(&self) -> UpdateManifest {
        UpdateManifest {
            version: self.version.clone(),
            size: self.size(),
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks(),
            content_hash: self.content_hash.clone(),
            iv: hex::encode(self.base_iv),
        }
    }

    /// Plaintext of chunk `index`, or `None` past the end.
    #[must_use]
    pub fn plaintext(&self, index: u32) -> Option<&[u8]> {
        self.image.chunks(self.chunk_size as usize).nth(index as usize)
    }

    /// Encrypted and authenticated chunk `index`, or `None` past the end.
    #[must_use]
    pub fn chunk(&self, index: u32) -> Option<Chunk> {
        let mut ciphertext = self.plaintext(index)?.to_vec();
        let iv = chunk_iv(&self.base_iv, index, self.chunk_size);
        self.keys.apply_keystream(&iv, &mut ciphertext);
        let mac = self.keys.chunk_mac(index, &iv, &ciphertext);
        Some(Chunk {
            index,
            iv,
            mac,
            ciphertext,
        })
    }

    /// Wire form of [`chunk`](Self::chunk).
    #[must_use]
    pub fn chunk_response(&self, index: u32) -> Option<ChunkResponse> {
        self.chunk(index).map(|chunk| chunk.to_response())
    }
}
