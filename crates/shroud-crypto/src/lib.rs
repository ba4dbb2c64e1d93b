//! shroud-crypto: client-side encryption for the shroud backup engine
//!
//! One random 256-bit master key protects everything that leaves the machine.
//! The master key is only ever persisted inside the keyfile, sealed under a
//! passphrase-derived key:
//!
//! ```text
//! Passphrase ──Argon2id(salt)──► KEK ──AES-256-GCM──► keyfile = salt(16) || iv(16) || ct+tag(48)
//!
//! Master Key (256-bit, random)
//!   ├── Blob AEAD:   iv(16) || ct+tag(16)                      (metadata fields)
//!   └── Stream AEAD: frame_i = iv(16) || ct_i+tag(16), AAD=i    (file bodies)
//! ```
//!
//! Content digests (`digest`) are salted BLAKE3, truncated to 20 bytes, and
//! never leave the client unencrypted.

pub mod crypter;
pub mod digest;
pub mod kdf;
pub mod keyfile;
pub mod stream;

pub use crypter::Crypter;
pub use digest::{digest_bytes, digest_file, Digest, DigestReader, DIGEST_LEN};
pub use kdf::{derive_key, KdfParams, MasterKey};
pub use keyfile::{open_keyfile, seal_keyfile, KEYFILE_LEN};
pub use stream::{encrypted_len, DEFAULT_CHUNK_SIZE};

/// Size of a master key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM IV as laid out on the wire
pub const IV_SIZE: usize = 16;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of the per-keyfile Argon2id salt
pub const SALT_SIZE: usize = 16;

/// AES-256-GCM with a 128-bit IV.
pub(crate) type Cipher = aes_gcm::AesGcm<aes_gcm::aes::Aes256, aes_gcm::aead::consts::U16>;
