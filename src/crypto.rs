//! Symmetric primitives for the encrypted object layout.
//!
//! Every plaintext chunk is sealed independently with AES-256-GCM. The nonce
//! of chunk `i` is `prefix(7) || i (u32 BE) || last(1)`, so any chunk can be
//! opened on its own given the header, its index and the total ciphertext
//! length, and truncation at a chunk boundary is detected by the last flag.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::chunk::chunk_count;

pub const KEY_BYTES: usize = 32;
pub const NONCE_BYTES: usize = 12;
pub const NONCE_PREFIX_BYTES: usize = 7;
/// AES-GCM tag appended to every sealed chunk.
pub const MAC_BYTES: usize = 16;

const HEADER_VERSION: u8 = 1;
const HEADER_BYTES: usize = 1 + 4 + NONCE_PREFIX_BYTES;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key length {0}")]
    KeyLength(usize),
    #[error("malformed encryption header")]
    Header,
    #[error("authentication failed for chunk {0}")]
    Open(u32),
    #[error("sealing chunk {0} failed")]
    Seal(u32),
    #[error("ciphertext length {0} does not match header")]
    Layout(u64),
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Per-file content key. Zeroed when dropped and never serialized.
pub struct FileKey([u8; KEY_BYTES]);

impl FileKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_BYTES] = bytes
            .try_into()
            .map_err(|_| CryptoError::KeyLength(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new((&self.0).into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for FileKey {
    fn drop(&mut self) {
        self.0.fill(0);
    }
}

/// Key shared by every file of one collection; used only to wrap file keys.
#[derive(Clone)]
pub struct CollectionKey([u8; KEY_BYTES]);

impl CollectionKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_BYTES] = bytes
            .try_into()
            .map_err(|_| CryptoError::KeyLength(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let raw = STANDARD.decode(s.trim())?;
        Self::from_bytes(&raw)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new((&self.0).into())
    }
}

impl std::fmt::Debug for CollectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CollectionKey([redacted])")
    }
}

/// Information a peer needs to rebuild chunk boundaries and nonces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionHeader {
    pub nonce_prefix: [u8; NONCE_PREFIX_BYTES],
    pub chunk_size: u32,
}

impl EncryptionHeader {
    pub fn generate(chunk_size: u32) -> Self {
        let mut nonce_prefix = [0u8; NONCE_PREFIX_BYTES];
        OsRng.fill_bytes(&mut nonce_prefix);
        Self {
            nonce_prefix,
            chunk_size,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_BYTES] {
        let mut out = [0u8; HEADER_BYTES];
        out[0] = HEADER_VERSION;
        out[1..5].copy_from_slice(&self.chunk_size.to_be_bytes());
        out[5..].copy_from_slice(&self.nonce_prefix);
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CryptoError> {
        if raw.len() != HEADER_BYTES || raw[0] != HEADER_VERSION {
            return Err(CryptoError::Header);
        }
        let chunk_size = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]);
        if chunk_size == 0 {
            return Err(CryptoError::Header);
        }
        let mut nonce_prefix = [0u8; NONCE_PREFIX_BYTES];
        nonce_prefix.copy_from_slice(&raw[5..]);
        Ok(Self {
            nonce_prefix,
            chunk_size,
        })
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.encode())
    }

    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        Self::decode(&STANDARD.decode(s)?)
    }

    pub fn chunk_nonce(&self, index: u32, is_last: bool) -> [u8; NONCE_BYTES] {
        let mut nonce = [0u8; NONCE_BYTES];
        nonce[..NONCE_PREFIX_BYTES].copy_from_slice(&self.nonce_prefix);
        nonce[NONCE_PREFIX_BYTES..NONCE_PREFIX_BYTES + 4].copy_from_slice(&index.to_be_bytes());
        nonce[NONCE_BYTES - 1] = u8::from(is_last);
        nonce
    }
}

/// Ciphertext length of a file of `plaintext_len` bytes.
pub fn ciphertext_len(plaintext_len: u64, chunk_size: u32) -> u64 {
    plaintext_len + chunk_count(plaintext_len, chunk_size) * MAC_BYTES as u64
}

pub fn seal_chunk(
    cipher: &Aes256Gcm,
    nonce: &[u8; NONCE_BYTES],
    index: u32,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::Seal(index))
}

pub fn decrypt_chunk(
    key: &FileKey,
    header: &EncryptionHeader,
    index: u32,
    is_last: bool,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let nonce = header.chunk_nonce(index, is_last);
    key.cipher()
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| CryptoError::Open(index))
}

/// Decrypts a whole object laid out as consecutive sealed chunks.
pub fn decrypt_file(
    key: &FileKey,
    header: &EncryptionHeader,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let sealed = header.chunk_size as usize + MAC_BYTES;
    let total = ciphertext.len();
    if total == 0 {
        return Ok(Vec::new());
    }
    let count = total.div_ceil(sealed);
    let tail = total - (count - 1) * sealed;
    if tail <= MAC_BYTES {
        return Err(CryptoError::Layout(total as u64));
    }
    let mut out = Vec::with_capacity(total - count * MAC_BYTES);
    for (i, piece) in ciphertext.chunks(sealed).enumerate() {
        let plain = decrypt_chunk(key, header, i as u32, i + 1 == count, piece)?;
        out.extend_from_slice(&plain);
    }
    Ok(out)
}

/// A key or small blob sealed under another key with a random nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedBox {
    pub encrypted_data: String,
    pub nonce: String,
}

fn seal_random(cipher: &Aes256Gcm, plaintext: &[u8]) -> Result<SealedBox, CryptoError> {
    let mut nonce = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce);
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Seal(0))?;
    Ok(SealedBox {
        encrypted_data: STANDARD.encode(ct),
        nonce: STANDARD.encode(nonce),
    })
}

fn open_random(cipher: &Aes256Gcm, sealed: &SealedBox) -> Result<Vec<u8>, CryptoError> {
    let nonce = STANDARD.decode(&sealed.nonce)?;
    if nonce.len() != NONCE_BYTES {
        return Err(CryptoError::Header);
    }
    let ct = STANDARD.decode(&sealed.encrypted_data)?;
    cipher
        .decrypt(Nonce::from_slice(&nonce), ct.as_slice())
        .map_err(|_| CryptoError::Open(0))
}

pub fn wrap_file_key(key: &FileKey, collection_key: &CollectionKey) -> Result<SealedBox, CryptoError> {
    seal_random(&collection_key.cipher(), key.as_bytes())
}

pub fn unwrap_file_key(
    wrapped: &SealedBox,
    collection_key: &CollectionKey,
) -> Result<FileKey, CryptoError> {
    let raw = open_random(&collection_key.cipher(), wrapped)?;
    FileKey::from_bytes(&raw)
}

pub fn seal_metadata(key: &FileKey, plaintext: &[u8]) -> Result<SealedBox, CryptoError> {
    seal_random(&key.cipher(), plaintext)
}

pub fn open_metadata(key: &FileKey, sealed: &SealedBox) -> Result<Vec<u8>, CryptoError> {
    open_random(&key.cipher(), sealed)
}
