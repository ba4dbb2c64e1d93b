//! The `Crypter`: AES-256-GCM under the master key
//!
//! Blob format (binary):
//! ```text
//! [16 bytes: random IV][N bytes: ciphertext][16 bytes: GCM tag]
//! ```
//!
//! Blobs carry small metadata fields. File bodies go through the framed
//! stream format in [`crate::stream`].

use std::io::{Read, Write};
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aead::consts::U16;
use aes_gcm::Nonce;
use rand::RngCore;
use shroud_core::{ShroudError, ShroudResult};

use crate::kdf::MasterKey;
use crate::stream::{self, DEFAULT_CHUNK_SIZE};
use crate::{Cipher, IV_SIZE, KEY_SIZE, TAG_SIZE};

/// Authenticated encryption under one immutable master key.
///
/// Cheap to clone and safe to share across threads; every call mints a
/// fresh IV.
#[derive(Clone)]
pub struct Crypter {
    key: Arc<MasterKey>,
    chunk_size: usize,
}

impl Crypter {
    pub fn new(key: MasterKey) -> Self {
        Self {
            key: Arc::new(key),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Override the plaintext bytes carried per stream frame.
    ///
    /// Streams must be decrypted with the chunk size that encrypted them.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn master_key(&self) -> &MasterKey {
        &self.key
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Encrypt a small byte blob: `iv || ciphertext+tag`.
    pub fn encrypt_blob(&self, plaintext: &[u8]) -> ShroudResult<Vec<u8>> {
        seal(self.key.as_bytes(), &[], plaintext)
    }

    /// Decrypt a blob produced by [`Crypter::encrypt_blob`].
    pub fn decrypt_blob(&self, blob: &[u8]) -> ShroudResult<Vec<u8>> {
        open(self.key.as_bytes(), &[], blob)
    }

    /// Encrypt everything `reader` yields into `writer` as a sequence of
    /// frames. Returns the number of ciphertext bytes written.
    pub fn encrypt_stream<R: Read, W: Write>(&self, reader: R, writer: W) -> ShroudResult<u64> {
        stream::encrypt_frames(self.key.as_bytes(), self.chunk_size, reader, writer)
    }

    /// Inverse of [`Crypter::encrypt_stream`]. Returns plaintext bytes written.
    pub fn decrypt_stream<R: Read, W: Write>(&self, reader: R, writer: W) -> ShroudResult<u64> {
        stream::decrypt_frames(self.key.as_bytes(), self.chunk_size, reader, writer)
    }

    /// Ciphertext length of a stream carrying `plain_len` plaintext bytes.
    pub fn encrypted_len(&self, plain_len: u64) -> u64 {
        stream::encrypted_len(plain_len, self.chunk_size)
    }
}

impl std::fmt::Debug for Crypter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crypter")
            .field("key", &"[REDACTED]")
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

/// Encrypt `plaintext` under `key` with a fresh IV: `iv || ciphertext+tag`.
pub(crate) fn seal(key: &[u8; KEY_SIZE], aad: &[u8], plaintext: &[u8]) -> ShroudResult<Vec<u8>> {
    let cipher = Cipher::new(key.into());

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(
            Nonce::<U16>::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| ShroudError::Other(anyhow::anyhow!("encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(IV_SIZE + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `iv || ciphertext+tag`. A short input is a format error, a tag
/// mismatch is an authentication error.
pub(crate) fn open(key: &[u8; KEY_SIZE], aad: &[u8], sealed: &[u8]) -> ShroudResult<Vec<u8>> {
    if sealed.len() < IV_SIZE + TAG_SIZE {
        return Err(ShroudError::Format(format!(
            "ciphertext too short: {} bytes (minimum {})",
            sealed.len(),
            IV_SIZE + TAG_SIZE
        )));
    }

    let (iv, ciphertext) = sealed.split_at(IV_SIZE);
    let cipher = Cipher::new(key.into());

    cipher
        .decrypt(
            Nonce::<U16>::from_slice(iv),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| {
            ShroudError::Authentication("decryption failed: wrong key or corrupted data".into())
        })
}
