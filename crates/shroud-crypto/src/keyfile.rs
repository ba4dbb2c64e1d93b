//! Keyfile: the master key sealed under a passphrase
//!
//! ```text
//! [16 bytes: Argon2id salt][16 bytes: IV][32 bytes: encrypted master key][16 bytes: tag]
//! ```
//!
//! Rotation re-seals the same master key under a new passphrase, so every
//! object uploaded under the old passphrase stays readable.

use rand::RngCore;
use secrecy::SecretString;
use shroud_core::{ShroudError, ShroudResult};
use zeroize::Zeroize;

use crate::crypter::{open, seal};
use crate::kdf::{derive_key, KdfParams, MasterKey};
use crate::{IV_SIZE, KEY_SIZE, SALT_SIZE, TAG_SIZE};

/// Exact byte length of a sealed keyfile.
pub const KEYFILE_LEN: usize = SALT_SIZE + IV_SIZE + KEY_SIZE + TAG_SIZE;

/// Seal `master` under `passphrase` with a fresh salt and IV.
pub fn seal_keyfile(
    master: &MasterKey,
    passphrase: &SecretString,
    params: &KdfParams,
) -> ShroudResult<Vec<u8>> {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);

    let kek = derive_key(passphrase, &salt, params)?;
    let sealed = seal(kek.as_bytes(), &[], master.as_bytes())?;

    let mut out = Vec::with_capacity(KEYFILE_LEN);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Recover the master key from a sealed keyfile.
///
/// A wrong passphrase and a corrupted keyfile are indistinguishable; both
/// surface as [`ShroudError::Authentication`].
pub fn open_keyfile(
    bytes: &[u8],
    passphrase: &SecretString,
    params: &KdfParams,
) -> ShroudResult<MasterKey> {
    if bytes.len() != KEYFILE_LEN {
        return Err(ShroudError::Format(format!(
            "keyfile has wrong size: {} bytes (expected {KEYFILE_LEN})",
            bytes.len()
        )));
    }

    let (salt_bytes, sealed) = bytes.split_at(SALT_SIZE);
    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(salt_bytes);

    let kek = derive_key(passphrase, &salt, params)?;
    let mut plaintext = open(kek.as_bytes(), &[], sealed).map_err(|e| match e {
        ShroudError::Authentication(_) => {
            ShroudError::Authentication("wrong passphrase or corrupted keyfile".into())
        }
        other => other,
    })?;

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&plaintext);
    plaintext.zeroize();

    let master = MasterKey::from_bytes(key);
    key.zeroize();
    Ok(master)
}
