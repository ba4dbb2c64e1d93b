//! Run counters shared between the walker and upload workers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Which stage of a run a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Indexing,
    Scanning,
    Uploading,
    Deleting,
}

/// Progress callback type (phase, count so far, message)
pub type ProgressFn = Arc<dyn Fn(SyncPhase, u64, &str) + Send + Sync>;

#[derive(Debug, Default)]
pub struct SyncStats {
    pub remote_objects: AtomicU64,
    pub remote_records: AtomicU64,
    pub unrecognized: AtomicU64,
    pub scanned: AtomicU64,
    pub identity_matches: AtomicU64,
    pub content_matches: AtomicU64,
    pub deduplicated: AtomicU64,
    pub planned_bodies: AtomicU64,
    pub local_errors: AtomicU64,
    pub uploaded_namefiles: AtomicU64,
    pub uploaded_bodies: AtomicU64,
    pub large_uploads: AtomicU64,
    pub skipped_renames: AtomicU64,
    pub bytes_uploaded: AtomicU64,
    pub deleted: AtomicU64,
    pub incomplete_cancelled: AtomicU64,
}

impl SyncStats {
    pub fn incr(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncReport {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SyncReport {
            remote_objects: get(&self.remote_objects),
            remote_records: get(&self.remote_records),
            unrecognized: get(&self.unrecognized),
            scanned: get(&self.scanned),
            identity_matches: get(&self.identity_matches),
            content_matches: get(&self.content_matches),
            deduplicated: get(&self.deduplicated),
            planned_bodies: get(&self.planned_bodies),
            local_errors: get(&self.local_errors),
            uploaded_namefiles: get(&self.uploaded_namefiles),
            uploaded_bodies: get(&self.uploaded_bodies),
            large_uploads: get(&self.large_uploads),
            skipped_renames: get(&self.skipped_renames),
            bytes_uploaded: get(&self.bytes_uploaded),
            deleted: get(&self.deleted),
            incomplete_cancelled: get(&self.incomplete_cancelled),
        }
    }
}

/// Point-in-time copy of [`SyncStats`], returned at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub remote_objects: u64,
    pub remote_records: u64,
    pub unrecognized: u64,
    pub scanned: u64,
    pub identity_matches: u64,
    pub content_matches: u64,
    /// Local files that share a body planned earlier in the same run
    pub deduplicated: u64,
    pub planned_bodies: u64,
    pub local_errors: u64,
    pub uploaded_namefiles: u64,
    pub uploaded_bodies: u64,
    pub large_uploads: u64,
    pub skipped_renames: u64,
    pub bytes_uploaded: u64,
    pub deleted: u64,
    pub incomplete_cancelled: u64,
}

impl SyncReport {
    pub fn total_uploads(&self) -> u64 {
        self.uploaded_namefiles + self.uploaded_bodies
    }
}
