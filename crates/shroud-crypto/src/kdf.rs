//! Key derivation: Argon2id passphrase → key-encryption key, plus the random master key

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use shroud_core::config::CryptoConfig;
use shroud_core::{ShroudError, ShroudResult};
use zeroize::Zeroize;

use crate::{KEY_SIZE, SALT_SIZE};

/// A 256-bit symmetric key. Used both for the master key and for
/// passphrase-derived key-encryption keys.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Draw a fresh master key from the OS-seeded CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id parameters for KDF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl From<&CryptoConfig> for KdfParams {
    fn from(cfg: &CryptoConfig) -> Self {
        Self {
            mem_cost_kib: cfg.argon2_mem_cost_kib,
            time_cost: cfg.argon2_time_cost,
            parallelism: cfg.argon2_parallelism,
        }
    }
}

/// Derive a 256-bit key from a passphrase and salt using Argon2id.
///
/// The salt is random per keyfile and stored in the clear at the front of it.
pub fn derive_key(
    passphrase: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> ShroudResult<MasterKey> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| ShroudError::Config(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| ShroudError::Other(anyhow::anyhow!("Argon2id KDF failed: {e}")))?;

    let derived = MasterKey::from_bytes(key);
    key.zeroize();
    Ok(derived)
}

#[cfg(test)]
pub(crate) fn fast_params() -> KdfParams {
    KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}
