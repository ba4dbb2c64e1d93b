//! Upload scheduler: a pool of workers draining one shared priority queue
//!
//! The queue is filled completely before workers start. Smaller bodies go
//! first and namefile-only pairs sort ahead of everything. A single
//! `Terminal` entry sorts last; a worker that pops it pushes it back for
//! the next worker and exits.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use shroud_core::{ShroudError, ShroudResult};
use shroud_crypto::{Crypter, Digest, DigestReader};
use shroud_storage::ObjectStore;
use tempfile::NamedTempFile;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::local::LocalRecord;
use crate::metadata::{IntrinsicMetadata, NamefileMetadata};
use crate::stats::{ProgressFn, SyncPhase, SyncStats};
use crate::task_failed;

/// A new name binding to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamefileUpload {
    pub local_name: String,
    pub timestamp_ms: i64,
}

impl NamefileUpload {
    pub fn for_local(local: &LocalRecord) -> Self {
        Self {
            local_name: local.local_name.clone(),
            timestamp_ms: local.timestamp_ms,
        }
    }
}

/// A file body to encrypt and upload as a new intrinsic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyUpload {
    /// Plaintext size
    pub size: u64,
}

/// Everything planned for one piece of content.
#[derive(Debug)]
pub struct UploadPair {
    /// Body source (and the first name bound to it)
    pub local: Arc<LocalRecord>,
    /// Remote name of the intrinsic every namefile points at: an existing
    /// one for content matches, a freshly minted one when `body` is set
    pub intrinsic_name: String,
    pub body: Option<BodyUpload>,
    pub namefiles: Vec<NamefileUpload>,
    /// Other local files with the same content as `local`, in plan order.
    /// Each one also owns an entry in `namefiles` and can stand in as the
    /// body source when `local` cannot be read.
    pub duplicates: Vec<Arc<LocalRecord>>,
}

impl UploadPair {
    pub fn upload_size(&self) -> u64 {
        self.body.map(|b| b.size).unwrap_or(0)
    }
}

#[derive(Debug)]
pub enum QueueEntry {
    Pair(UploadPair),
    Terminal,
}

impl QueueEntry {
    fn sort_key(&self) -> (bool, u64, &str) {
        match self {
            QueueEntry::Pair(p) => (false, p.upload_size(), p.local.local_name.as_str()),
            QueueEntry::Terminal => (true, u64::MAX, ""),
        }
    }
}

// BinaryHeap pops the greatest entry, so the ordering is reversed: the
// smallest upload is "greatest" and Terminal is "least".
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.sort_key().cmp(&self.sort_key())
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for QueueEntry {}

/// The shared upload queue.
#[derive(Debug, Default)]
pub struct UploadQueue {
    heap: Mutex<BinaryHeap<QueueEntry>>,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue every pair followed by the terminal sentinel.
    pub fn from_plan(plan: Vec<UploadPair>) -> Self {
        let queue = Self::new();
        {
            let mut heap = queue.lock();
            heap.extend(plan.into_iter().map(QueueEntry::Pair));
            heap.push(QueueEntry::Terminal);
        }
        queue
    }

    fn lock(&self) -> MutexGuard<'_, BinaryHeap<QueueEntry>> {
        self.heap.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, entry: QueueEntry) {
        self.lock().push(entry);
    }

    pub fn pop(&self) -> Option<QueueEntry> {
        self.lock().pop()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Number of concurrent upload workers
    pub workers: usize,
    /// Drop namefile-only pairs instead of uploading them
    pub skip_renames: bool,
    /// Encrypted size above which a body goes through multipart upload
    pub large_file_threshold: u64,
    /// Directory for staged ciphertext (default: system temp dir)
    pub staging_dir: Option<PathBuf>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            skip_renames: false,
            large_file_threshold: 500_000_000,
            staging_dir: None,
        }
    }
}

/// Drain `queue` with `options.workers` concurrent workers.
///
/// The first worker error aborts the others and is returned.
pub async fn run_uploads(
    store: Arc<dyn ObjectStore>,
    crypter: Crypter,
    queue: Arc<UploadQueue>,
    options: UploadOptions,
    stats: Arc<SyncStats>,
    progress: Option<ProgressFn>,
) -> ShroudResult<()> {
    let workers = options.workers.max(1);
    info!(workers, queued = queue.len().saturating_sub(1), "starting upload workers");

    let mut set = JoinSet::new();
    for id in 0..workers {
        let worker = Worker {
            id,
            store: store.clone(),
            crypter: crypter.clone(),
            queue: queue.clone(),
            options: options.clone(),
            stats: stats.clone(),
            progress: progress.clone(),
        };
        set.spawn(async move { worker.run().await });
    }

    let mut first_err: Option<ShroudError> = None;
    while let Some(joined) = set.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => continue,
            Err(e) => Err(ShroudError::Other(anyhow::anyhow!("upload worker panicked: {e}"))),
        };
        if let Err(e) = result {
            if first_err.is_none() {
                error!("upload failed, stopping workers: {e}");
                set.abort_all();
                first_err = Some(e);
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct Worker {
    id: usize,
    store: Arc<dyn ObjectStore>,
    crypter: Crypter,
    queue: Arc<UploadQueue>,
    options: UploadOptions,
    stats: Arc<SyncStats>,
    progress: Option<ProgressFn>,
}

struct StagedBody {
    file: NamedTempFile,
    digest: Digest,
    encrypted_len: u64,
}

impl Worker {
    async fn run(self) -> ShroudResult<()> {
        loop {
            let Some(entry) = self.queue.pop() else {
                debug!(worker = self.id, "queue empty");
                return Ok(());
            };
            match entry {
                QueueEntry::Terminal => {
                    self.queue.push(QueueEntry::Terminal);
                    debug!(worker = self.id, "worker done");
                    return Ok(());
                }
                QueueEntry::Pair(pair) => self.upload_pair(pair).await?,
            }
        }
    }

    async fn upload_pair(&self, mut pair: UploadPair) -> ShroudResult<()> {
        if pair.body.is_none() && self.options.skip_renames {
            SyncStats::add(&self.stats.skipped_renames, pair.namefiles.len() as u64);
            debug!(local = %pair.local.local_name, "skipping namefile-only upload");
            return Ok(());
        }

        let mut namefiles = std::mem::take(&mut pair.namefiles);
        let staged = match pair.body {
            Some(_) => match self.stage_first_readable(&pair, &mut namefiles).await? {
                Some(staged) => Some(staged),
                None => return Ok(()),
            },
            None => None,
        };

        for namefile in &namefiles {
            self.upload_namefile(namefile, &pair.intrinsic_name).await?;
        }

        if let Some((source, staged)) = staged {
            self.upload_body(&pair.intrinsic_name, &source, staged).await?;
        }
        Ok(())
    }

    /// Stage the body from the first source that reads cleanly.
    ///
    /// A source that fails with `LocalIo` loses its own namefile and the
    /// next duplicate is tried. `None` once every source has failed.
    async fn stage_first_readable(
        &self,
        pair: &UploadPair,
        namefiles: &mut Vec<NamefileUpload>,
    ) -> ShroudResult<Option<(Arc<LocalRecord>, StagedBody)>> {
        let sources = std::iter::once(&pair.local).chain(pair.duplicates.iter());
        for source in sources {
            match self.stage_body(source.clone()).await {
                Ok(staged) => return Ok(Some((source.clone(), staged))),
                Err(e @ ShroudError::LocalIo { .. }) => {
                    SyncStats::incr(&self.stats.local_errors);
                    namefiles.retain(|n| n.local_name != source.local_name);
                    warn!(local = %source.local_name, "skipping upload: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn upload_namefile(&self, namefile: &NamefileUpload, intrinsic: &str) -> ShroudResult<()> {
        let name = NamefileMetadata::new_remote_name();
        let fields = NamefileMetadata::encode_fields(
            namefile.timestamp_ms,
            &namefile.local_name,
            intrinsic,
            &self.crypter,
        )?;
        self.store
            .upload_small(&name, NamefileMetadata::filler_body(), &fields)
            .await?;

        let n = SyncStats::incr(&self.stats.uploaded_namefiles);
        debug!(local = %namefile.local_name, %intrinsic, "uploaded namefile");
        if let Some(cb) = &self.progress {
            cb(SyncPhase::Uploading, n, &namefile.local_name);
        }
        Ok(())
    }

    /// Encrypt the body into a staging file on a blocking thread.
    ///
    /// The digest is taken over the same bytes that are encrypted and must
    /// agree with the one computed during correlation.
    async fn stage_body(&self, local: Arc<LocalRecord>) -> ShroudResult<StagedBody> {
        let crypter = self.crypter.clone();
        let staging_dir = self.options.staging_dir.clone();

        tokio::task::spawn_blocking(move || -> ShroudResult<StagedBody> {
            let expected = local.digest()?;
            let source = std::fs::File::open(&local.path)
                .map_err(|e| ShroudError::local_io(&local.path, e))?;

            let mut file = match &staging_dir {
                Some(dir) => NamedTempFile::new_in(dir),
                None => NamedTempFile::new(),
            }?;
            let mut reader = DigestReader::new(BufReader::new(source));
            let encrypted_len =
                crypter.encrypt_stream(&mut reader, BufWriter::new(file.as_file_mut()))?;

            let changed = encrypted_len != crypter.encrypted_len(local.size)
                || reader.digest() != expected;
            if changed {
                return Err(ShroudError::local_io(
                    &local.path,
                    std::io::Error::new(std::io::ErrorKind::Other, "file changed during sync"),
                ));
            }
            Ok(StagedBody {
                file,
                digest: expected,
                encrypted_len,
            })
        })
        .await
        .map_err(task_failed)?
    }

    async fn upload_body(
        &self,
        intrinsic_name: &str,
        source: &LocalRecord,
        staged: StagedBody,
    ) -> ShroudResult<()> {
        let fields = IntrinsicMetadata::encode_fields(&staged.digest, source.size, &self.crypter)?;
        let len = staged.encrypted_len;

        if len > self.options.large_file_threshold {
            let file = tokio::fs::File::from_std(staged.file.reopen()?);
            self.store
                .upload_large(intrinsic_name, Box::new(file), len, &fields)
                .await?;
            SyncStats::incr(&self.stats.large_uploads);
        } else {
            let body = tokio::fs::read(staged.file.path()).await?;
            self.store
                .upload_small(intrinsic_name, body, &fields)
                .await?;
        }

        if let Err(e) = staged.file.close() {
            warn!("failed to remove staging file: {e}");
        }

        let n = SyncStats::incr(&self.stats.uploaded_bodies);
        SyncStats::add(&self.stats.bytes_uploaded, len);
        info!(
            worker = self.id,
            local = %source.local_name,
            bytes = len,
            "uploaded body"
        );
        if let Some(cb) = &self.progress {
            cb(SyncPhase::Uploading, n, &source.local_name);
        }
        Ok(())
    }
}
