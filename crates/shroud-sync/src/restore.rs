//! Restore path: rebuild the remote index and decrypt selected records
//!
//! Restore never overwrites: every destination is opened with
//! `create_new`, and a destination left behind by a failed decrypt is
//! removed.

use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use secrecy::SecretString;
use serde::Serialize;
use shroud_core::{ShroudError, ShroudResult};
use shroud_crypto::{digest_file, Crypter, KdfParams};
use shroud_storage::ObjectStore;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::index::RemoteIndex;
use crate::keyfile::load_master_key;
use crate::metadata::{IntrinsicMetadata, RemoteRecord};
use crate::stats::SyncStats;
use crate::task_failed;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    /// Records selected by the filter
    pub matched: u64,
    pub restored: u64,
    /// Plaintext bytes written
    pub bytes: u64,
}

pub struct Restorer {
    store: Arc<dyn ObjectStore>,
    crypter: Crypter,
    index: RemoteIndex,
    staging_dir: Option<PathBuf>,
}

impl Restorer {
    /// Open the keyfile and index the bucket. Unlike sync, a missing
    /// keyfile is an error: there is nothing to restore.
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        passphrase: &SecretString,
        kdf: &KdfParams,
        chunk_size: usize,
    ) -> ShroudResult<Self> {
        let master = load_master_key(store.as_ref(), passphrase, kdf).await?;
        let crypter = Crypter::new(master).with_chunk_size(chunk_size);
        let (index, _) =
            RemoteIndex::build(store.as_ref(), &crypter, false, &SyncStats::default()).await?;
        Ok(Self {
            store,
            crypter,
            index,
            staging_dir: None,
        })
    }

    /// Where downloaded ciphertext is staged (default: system temp dir).
    pub fn with_staging_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.staging_dir = dir;
        self
    }

    /// Every restorable record, in local-name order.
    pub fn records(&self) -> impl Iterator<Item = &RemoteRecord> {
        self.index.records()
    }

    pub fn record(&self, local_name: &str) -> Option<&RemoteRecord> {
        self.index.record(local_name)
    }

    /// Restore every record matching `predicate` to the path `locator`
    /// computes for it. Stops at the first failure.
    pub async fn restore_by_filter<P, L>(&self, predicate: P, locator: L) -> ShroudResult<RestoreReport>
    where
        P: Fn(&RemoteRecord) -> bool,
        L: Fn(&RemoteRecord) -> PathBuf,
    {
        let mut report = RestoreReport::default();
        for record in self.index.records().filter(|r| predicate(r)) {
            report.matched += 1;
            let dest = locator(record);
            let bytes = self.restore_record(record, &dest).await?;
            report.restored += 1;
            report.bytes += bytes;
        }
        info!(
            matched = report.matched,
            restored = report.restored,
            bytes = report.bytes,
            "restore complete"
        );
        Ok(report)
    }

    /// Restore the record named `local_name` to `dest`.
    pub async fn restore_single(&self, local_name: &str, dest: &Path) -> ShroudResult<u64> {
        let record = self
            .index
            .record(local_name)
            .ok_or_else(|| ShroudError::NotFound(format!("no remote record for {local_name}")))?;
        self.restore_record(record, dest).await
    }

    /// Download, decrypt and verify one record into a new file at `dest`.
    pub async fn restore_record(&self, record: &RemoteRecord, dest: &Path) -> ShroudResult<u64> {
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ShroudError::local_io(parent, e))?;
        }
        let out = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dest)
            .map_err(|e| ShroudError::local_io(dest, e))?;

        match self.fetch_into(&record.intrinsic, out, dest).await {
            Ok(bytes) => {
                info!(local = %record.local_name(), dest = %dest.display(), bytes, "restored");
                Ok(bytes)
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(dest).await {
                    warn!(dest = %dest.display(), "failed to remove partial restore: {rm}");
                }
                Err(e)
            }
        }
    }

    async fn fetch_into(
        &self,
        intrinsic: &IntrinsicMetadata,
        out: std::fs::File,
        dest: &Path,
    ) -> ShroudResult<u64> {
        let staging = match &self.staging_dir {
            Some(dir) => NamedTempFile::new_in(dir),
            None => NamedTempFile::new(),
        }?;

        let mut sink = tokio::fs::File::from_std(staging.reopen()?);
        let downloaded = self
            .store
            .download_by_id(&intrinsic.remote_id, &mut sink)
            .await?;
        sink.flush().await?;
        drop(sink);
        debug!(intrinsic = %intrinsic.remote_name, bytes = downloaded, "downloaded body");

        let crypter = self.crypter.clone();
        let expected = intrinsic.clone();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || -> ShroudResult<u64> {
            let reader = BufReader::new(staging.reopen()?);
            let written = crypter.decrypt_stream(reader, BufWriter::new(out))?;
            let digest = digest_file(&dest)?;
            if !expected.same_content(&digest, written) {
                return Err(ShroudError::Authentication(format!(
                    "content of {} does not match its recorded digest",
                    expected.remote_name
                )));
            }
            Ok(written)
        })
        .await
        .map_err(task_failed)?
    }
}
