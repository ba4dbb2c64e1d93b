//! Sync engine: keyfile bootstrap, then index, correlate, upload, delete
//!
//! One `run` mirrors a local tree into the bucket:
//!
//! 1. list and classify the bucket into a [`RemoteIndex`] (Phase A)
//! 2. walk the tree and correlate every file against it (Phase B)
//! 3. queue the upload plan and drain it with the worker pool
//! 4. with orphan deletion on: delete everything nothing live refers to,
//!    then cancel abandoned large uploads
//!
//! A failed run leaves the bucket with some subset of the planned uploads
//! and nothing deleted; re-running picks up where it stopped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use secrecy::SecretString;
use shroud_core::{ShroudConfig, ShroudResult};
use shroud_crypto::{Crypter, KdfParams, DEFAULT_CHUNK_SIZE};
use shroud_storage::ObjectStore;
use tracing::{debug, info, warn};

use crate::index::{DeletionSet, RemoteIndex};
use crate::keyfile::{load_or_create_master_key, store_master_key};
use crate::local::{walk_local, WalkConfig};
use crate::reconcile::Reconciler;
use crate::scheduler::{run_uploads, UploadOptions, UploadQueue};
use crate::stats::{ProgressFn, SyncPhase, SyncReport, SyncStats};
use crate::task_failed;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub kdf: KdfParams,
    /// Plaintext bytes per stream frame
    pub chunk_size: usize,
    pub workers: usize,
    pub delete_orphans: bool,
    pub skip_renames: bool,
    pub large_file_threshold: u64,
    pub staging_dir: Option<PathBuf>,
    pub walk: WalkConfig,
    /// Log scan progress every this many files
    pub progress_interval: u64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: 2,
            delete_orphans: false,
            skip_renames: false,
            large_file_threshold: 500_000_000,
            staging_dir: None,
            walk: WalkConfig::default(),
            progress_interval: 1000,
        }
    }
}

impl SyncOptions {
    pub fn from_config(cfg: &ShroudConfig) -> Self {
        Self {
            kdf: KdfParams::from(&cfg.crypto),
            chunk_size: cfg.sync.stream_chunk_size,
            workers: cfg.sync.workers,
            delete_orphans: cfg.sync.delete_orphans,
            skip_renames: cfg.sync.skip_renames,
            large_file_threshold: cfg.sync.large_file_threshold,
            staging_dir: cfg.sync.staging_dir.clone(),
            walk: WalkConfig::from(&cfg.sync),
            progress_interval: cfg.sync.progress_interval,
        }
    }

    fn upload_options(&self) -> UploadOptions {
        UploadOptions {
            workers: self.workers,
            skip_renames: self.skip_renames,
            large_file_threshold: self.large_file_threshold,
            staging_dir: self.staging_dir.clone(),
        }
    }
}

pub struct SyncEngine {
    store: Arc<dyn ObjectStore>,
    crypter: Crypter,
    options: SyncOptions,
    created_keyfile: bool,
    progress: Option<ProgressFn>,
}

impl SyncEngine {
    /// Open the bucket's keyfile with `passphrase`, creating one (and a new
    /// master key) if the bucket has none.
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        passphrase: &SecretString,
        options: SyncOptions,
    ) -> ShroudResult<Self> {
        let (master, created_keyfile) =
            load_or_create_master_key(store.as_ref(), passphrase, &options.kdf).await?;
        let crypter = Crypter::new(master).with_chunk_size(options.chunk_size);
        Ok(Self {
            store,
            crypter,
            options,
            created_keyfile,
            progress: None,
        })
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn crypter(&self) -> &Crypter {
        &self.crypter
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Whether `open` generated a fresh master key.
    pub fn created_keyfile(&self) -> bool {
        self.created_keyfile
    }

    /// Re-seal the master key under `new_passphrase` and replace the keyfile.
    pub async fn rotate_passphrase(&self, new_passphrase: &SecretString) -> ShroudResult<()> {
        store_master_key(
            self.store.as_ref(),
            self.crypter.master_key(),
            new_passphrase,
            &self.options.kdf,
        )
        .await?;
        info!(bucket = self.store.bucket(), "keyfile re-sealed under new passphrase");
        Ok(())
    }

    pub async fn run(&self, root: &Path) -> ShroudResult<SyncReport> {
        let opts = &self.options;
        if opts.skip_renames && opts.delete_orphans {
            warn!("skip_renames with delete_orphans: renamed files lose their remote name binding");
        }
        info!(
            root = %root.display(),
            bucket = self.store.bucket(),
            delete_orphans = opts.delete_orphans,
            workers = opts.workers,
            "starting sync"
        );

        let stats = Arc::new(SyncStats::default());
        self.emit(SyncPhase::Indexing, 0, self.store.bucket());
        let (index, deletions) =
            RemoteIndex::build(self.store.as_ref(), &self.crypter, opts.delete_orphans, &stats)
                .await?;

        let (plan, deletions) = {
            let root = root.to_path_buf();
            let walk = opts.walk.clone();
            let interval = opts.progress_interval;
            let progress = self.progress.clone();
            let stats = stats.clone();
            tokio::task::spawn_blocking(move || -> ShroudResult<_> {
                let locals = walk_local(&root, &walk)?;
                let mut reconciler =
                    Reconciler::new(&index, deletions, &stats).with_progress(interval, progress);
                for local in locals {
                    reconciler.correlate(local)?;
                }
                Ok(reconciler.finish())
            })
            .await
            .map_err(task_failed)??
        };

        let queue = Arc::new(UploadQueue::from_plan(plan));
        run_uploads(
            self.store.clone(),
            self.crypter.clone(),
            queue,
            opts.upload_options(),
            stats.clone(),
            self.progress.clone(),
        )
        .await?;

        if opts.delete_orphans {
            self.delete_orphans(&deletions, &stats).await?;
            self.cancel_incomplete(&stats).await?;
        }

        let report = stats.snapshot();
        info!(
            scanned = report.scanned,
            identity = report.identity_matches,
            content = report.content_matches,
            bodies = report.uploaded_bodies,
            namefiles = report.uploaded_namefiles,
            bytes = report.bytes_uploaded,
            deleted = report.deleted,
            local_errors = report.local_errors,
            "sync complete"
        );
        Ok(report)
    }

    async fn delete_orphans(&self, deletions: &DeletionSet, stats: &SyncStats) -> ShroudResult<()> {
        info!(orphans = deletions.len(), "deleting orphans");
        for (name, id) in deletions.iter() {
            match self.store.delete(name, id).await {
                Ok(()) => {
                    let n = SyncStats::incr(&stats.deleted);
                    debug!(object = %name, "deleted orphan");
                    self.emit(SyncPhase::Deleting, n, name);
                }
                Err(e) if e.is_not_found() => debug!(object = %name, "orphan already gone"),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn cancel_incomplete(&self, stats: &SyncStats) -> ShroudResult<()> {
        for obj in self.store.list_incomplete_large().await? {
            match self.store.delete(&obj.name, &obj.id).await {
                Ok(()) => {
                    SyncStats::incr(&stats.incomplete_cancelled);
                    info!(object = %obj.name, "cancelled incomplete large upload");
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn emit(&self, phase: SyncPhase, n: u64, msg: &str) {
        if let Some(cb) = &self.progress {
            cb(phase, n, msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shroud_core::config::SyncConfig;
    use shroud_storage::MemoryStore;

    #[test]
    fn options_follow_config() {
        let cfg = ShroudConfig {
            sync: SyncConfig {
                workers: 7,
                delete_orphans: true,
                large_file_threshold: 42,
                exclude_patterns: vec!["*.tmp".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        let opts = SyncOptions::from_config(&cfg);
        assert_eq!(opts.workers, 7);
        assert!(opts.delete_orphans);
        assert_eq!(opts.upload_options().large_file_threshold, 42);
        assert_eq!(opts.walk.exclude_patterns, vec!["*.tmp".to_string()]);
    }

    #[tokio::test]
    async fn open_creates_keyfile_once() {
        let store = Arc::new(MemoryStore::default());
        let opts = SyncOptions {
            kdf: KdfParams {
                mem_cost_kib: 1024,
                time_cost: 1,
                parallelism: 1,
            },
            ..Default::default()
        };
        let pass = SecretString::from("pass");

        let first = SyncEngine::open(store.clone(), &pass, opts.clone()).await.unwrap();
        assert!(first.created_keyfile());
        let second = SyncEngine::open(store.clone(), &pass, opts).await.unwrap();
        assert!(!second.created_keyfile());
        assert_eq!(
            first.crypter().master_key().as_bytes(),
            second.crypter().master_key().as_bytes()
        );
    }
}
