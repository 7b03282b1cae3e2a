//! Chunk authentication and decryption.
//!
//! Every chunk carries an HMAC-SHA-256 tag over
//! `index (u32 BE) || iv (16 bytes) || ciphertext`. The tag is checked before
//! anything else is done with the ciphertext. Decryption is AES-128 in CTR
//! mode with a 32-bit big-endian counter in the last four IV bytes; each
//! chunk's keystream starts at that chunk's own IV.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// AES key length in bytes.
pub const ENC_KEY_LEN: usize = 16;
/// HMAC key length in bytes.
pub const MAC_KEY_LEN: usize = 32;
/// IV length in bytes.
pub const IV_LEN: usize = 16;
/// HMAC-SHA-256 tag length in bytes.
pub const MAC_LEN: usize = 32;
/// AES block size; the CTR counter advances once per block.
pub const BLOCK_LEN: u32 = 16;

type Aes128Ctr32BE = ctr::Ctr32BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Shared secrets provisioned on both the device and the update server.
#[derive(Clone, PartialEq, Eq)]
pub struct FotaKeys {
    enc_key: [u8; ENC_KEY_LEN],
    mac_key: [u8; MAC_KEY_LEN],
}

impl std::fmt::Debug for FotaKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FotaKeys { .. }")
    }
}

impl FotaKeys {
    #[must_use]
    pub const fn new(enc_key: [u8; ENC_KEY_LEN], mac_key: [u8; MAC_KEY_LEN]) -> Self {
        Self { enc_key, mac_key }
    }

    /// Parse both keys from hex strings.
    pub fn from_hex(enc_key: &str, mac_key: &str) -> Result<Self, hex::FromHexError> {
        let mut enc = [0u8; ENC_KEY_LEN];
        let mut mac = [0u8; MAC_KEY_LEN];
        hex::decode_to_slice(enc_key, &mut enc)?;
        hex::decode_to_slice(mac_key, &mut mac)?;
        Ok(Self::new(enc, mac))
    }

    fn hmac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.mac_key).expect("HMAC accepts keys of any length")
    }

    /// Compute the tag for chunk `index`.
    #[must_use]
    pub fn chunk_mac(&self, index: u32, iv: &[u8; IV_LEN], ciphertext: &[u8]) -> [u8; MAC_LEN] {
        let mut mac = self.hmac();
        mac.update(&index.to_be_bytes());
        mac.update(iv);
        mac.update(ciphertext);
        mac.finalize().into_bytes().into()
    }

    /// Check `tag` against the chunk contents in constant time.
    #[must_use]
    pub fn verify_chunk(&self, index: u32, iv: &[u8; IV_LEN], ciphertext: &[u8], tag: &[u8]) -> bool {
        let mut mac = self.hmac();
        mac.update(&index.to_be_bytes());
        mac.update(iv);
        mac.update(ciphertext);
        mac.verify_slice(tag).is_ok()
    }

    /// XOR `data` with the keystream starting at `iv`. Encryption and
    /// decryption are the same operation.
    pub fn apply_keystream(&self, iv: &[u8; IV_LEN], data: &mut [u8]) {
        let mut cipher = Aes128Ctr32BE::new(&self.enc_key.into(), iv.into());
        cipher.apply_keystream(data);
    }
}

/// IV for chunk `index` of an image whose base IV is `base`: the 32-bit
/// counter is advanced past the blocks of all preceding chunks, so decrypting
/// chunks independently yields one continuous CTR stream.
#[must_use]
pub fn chunk_iv(base: &[u8; IV_LEN], index: u32, chunk_size: u32) -> [u8; IV_LEN] {
    #[allow(clippy::cast_possible_truncation)] // counter wraps at 32 bits
    let blocks = (u64::from(index) * u64::from(chunk_size) / u64::from(BLOCK_LEN)) as u32;
    let mut iv = *base;
    let counter = u32::from_be_bytes([base[12], base[13], base[14], base[15]]).wrapping_add(blocks);
    iv[12..].copy_from_slice(&counter.to_be_bytes());
    iv
}
