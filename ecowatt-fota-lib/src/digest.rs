//! Resumable SHA-256 over the plaintext image.
//!
//! `sha2::Sha256` cannot export its internal state, so a digest in progress
//! would be lost on reboot. [`ImageDigest`] drives the `sha2` block function
//! directly and keeps the chaining state, the unprocessed tail and the total
//! length in the open, which lets the orchestrator persist a
//! [`DigestCheckpoint`] next to each chunk's progress record.

use serde::{Deserialize, Serialize};
use sha2::compress256;
use sha2::digest::generic_array::GenericArray;

/// SHA-256 block size in bytes.
const BLOCK_LEN: usize = 64;

/// SHA-256 output size in bytes.
pub const DIGEST_LEN: usize = 32;

/// FIPS 180-4 initial hash value.
const INITIAL_STATE: [u32; 8] = [
    0x6a09_e667,
    0xbb67_ae85,
    0x3c6e_f372,
    0xa54f_f53a,
    0x510e_527f,
    0x9b05_688c,
    0x1f83_d9ab,
    0x5be0_cd19,
];

/// Serializable snapshot of an [`ImageDigest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestCheckpoint {
    /// Chaining state after the last full block.
    pub state: [u32; 8],
    /// Hex of the bytes not yet forming a full block.
    pub pending: String,
    /// Total bytes hashed so far.
    pub length: u64,
}

/// Running SHA-256 accumulator that can be checkpointed and restored.
#[derive(Debug, Clone)]
pub struct ImageDigest {
    state: [u32; 8],
    pending: Vec<u8>,
    length: u64,
}

impl Default for ImageDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageDigest {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: INITIAL_STATE,
            pending: Vec::with_capacity(BLOCK_LEN),
            length: 0,
        }
    }

    /// Bytes hashed so far.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.length += data.len() as u64;

        if !self.pending.is_empty() {
            let take = (BLOCK_LEN - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() < BLOCK_LEN {
                return;
            }
            let block = std::mem::take(&mut self.pending);
            self.compress(&block);
        }

        let mut blocks = data.chunks_exact(BLOCK_LEN);
        for block in &mut blocks {
            self.compress(block);
        }
        self.pending.extend_from_slice(blocks.remainder());
    }

    fn compress(&mut self, block: &[u8]) {
        compress256(
            &mut self.state,
            std::slice::from_ref(GenericArray::from_slice(block)),
        );
    }

    /// Apply the final padding and return the digest.
    #[must_use]
    pub fn finalize(mut self) -> [u8; DIGEST_LEN] {
        let bit_len = self.length.wrapping_mul(8);
        let mut tail = std::mem::take(&mut self.pending);
        tail.push(0x80);
        while tail.len() % BLOCK_LEN != BLOCK_LEN - 8 {
            tail.push(0);
        }
        tail.extend_from_slice(&bit_len.to_be_bytes());
        for block in tail.chunks_exact(BLOCK_LEN) {
            self.compress(block);
        }

        let mut out = [0u8; DIGEST_LEN];
        for (dst, word) in out.chunks_exact_mut(4).zip(self.state) {
            dst.copy_from_slice(&word.to_be_bytes());
        }
        out
    }

    /// Lowercase hex of [`finalize`](Self::finalize).
    #[must_use]
    pub fn finalize_hex(self) -> String {
        hex::encode(self.finalize())
    }

    #[must_use]
    pub fn checkpoint(&self) -> DigestCheckpoint {
        DigestCheckpoint {
            state: self.state,
            pending: hex::encode(&self.pending),
            length: self.length,
        }
    }

    /// Rebuild a digest from a checkpoint. Returns `None` if the checkpoint
    /// is internally inconsistent.
    #[must_use]
    pub fn restore(checkpoint: &DigestCheckpoint) -> Option<Self> {
        let pending = hex::decode(&checkpoint.pending).ok()?;
        if pending.len() as u64 != checkpoint.length % BLOCK_LEN as u64 {
            return None;
        }
        let mut restored = Self {
            state: checkpoint.state,
            pending: Vec::with_capacity(BLOCK_LEN),
            length: checkpoint.length,
        };
        restored.pending.extend_from_slice(&pending);
        Some(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    fn reference(data: &[u8]) -> [u8; DIGEST_LEN] {
        Sha256::digest(data).into()
    }

    #[test]
    fn empty_input() {
        assert_eq!(
            ImageDigest::new().finalize_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn abc() {
        let mut d = ImageDigest::new();
        d.update(b"abc");
        assert_eq!(
            d.finalize_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn matches_sha2_across_padding_boundaries() {
        let data: Vec<u8> = (0..=255u8).cycle().take(300).collect();
        for len in [55, 56, 63, 64, 65, 119, 120, 128, 300] {
            let mut d = ImageDigest::new();
            d.update(&data[..len]);
            assert_eq!(d.finalize(), reference(&data[..len]), "len {len}");
        }
    }

    #[test]
    fn uneven_updates() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
        let mut d = ImageDigest::new();
        for piece in data.chunks(37) {
            d.update(piece);
        }
        assert_eq!(d.length(), 1000);
        assert_eq!(d.finalize(), reference(&data));
    }

    #[test]
    fn checkpoint_restore_continues_digest() {
        let data: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
        let mut first = ImageDigest::new();
        first.update(&data[..173]);

        let json = serde_json::to_string(&first.checkpoint()).unwrap();
        let checkpoint: DigestCheckpoint = serde_json::from_str(&json).unwrap();
        let mut resumed = ImageDigest::restore(&checkpoint).expect("consistent checkpoint");
        resumed.update(&data[173..]);

        assert_eq!(resumed.finalize(), reference(&data));
    }

    #[test]
    fn restore_rejects_inconsistent_pending() {
        let mut d = ImageDigest::new();
        d.update(&[1, 2, 3]);
        let mut checkpoint = d.checkpoint();
        checkpoint.length = 4;
        assert!(ImageDigest::restore(&checkpoint).is_none());

        checkpoint.length = 3;
        checkpoint.pending = "zz".to_string();
        assert!(ImageDigest::restore(&checkpoint).is_none());
    }
}
