//! Keyfile bootstrap and rotation against the remote store

use secrecy::SecretString;
use shroud_core::ShroudResult;
use shroud_crypto::{open_keyfile, seal_keyfile, KdfParams, MasterKey};
use shroud_storage::{Fields, ObjectStore};
use tracing::{info, warn};

use crate::metadata::KEYFILE_NAME;

/// Download and open the keyfile. A missing keyfile is `NotFound`.
pub async fn load_master_key(
    store: &dyn ObjectStore,
    passphrase: &SecretString,
    params: &KdfParams,
) -> ShroudResult<MasterKey> {
    let sealed = store.read_object(KEYFILE_NAME).await?;
    let master = open_keyfile(&sealed, passphrase, params)?;
    info!(bucket = store.bucket(), "opened keyfile");
    Ok(master)
}

/// Seal `master` under `passphrase` and upload it, replacing any existing keyfile.
pub async fn store_master_key(
    store: &dyn ObjectStore,
    master: &MasterKey,
    passphrase: &SecretString,
    params: &KdfParams,
) -> ShroudResult<()> {
    let sealed = seal_keyfile(master, passphrase, params)?;
    store
        .upload_small(KEYFILE_NAME, sealed, &Fields::new())
        .await?;
    Ok(())
}

/// Open the keyfile, or generate and upload a new master key when the
/// bucket has none. Returns the key and whether it was just created.
pub async fn load_or_create_master_key(
    store: &dyn ObjectStore,
    passphrase: &SecretString,
    params: &KdfParams,
) -> ShroudResult<(MasterKey, bool)> {
    match load_master_key(store, passphrase, params).await {
        Ok(master) => Ok((master, false)),
        Err(e) if e.is_not_found() => {
            warn!(bucket = store.bucket(), "no keyfile found, generating a new master key");
            let master = MasterKey::generate();
            store_master_key(store, &master, passphrase, params).await?;
            Ok((master, true))
        }
        Err(e) => Err(e),
    }
}
