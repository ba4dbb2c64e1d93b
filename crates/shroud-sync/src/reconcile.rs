//! Local correlation: decide, per local file, what has to be uploaded
//!
//! For each local file, in order:
//! 1. identity match: a record with the same name, size and timestamp.
//!    Nothing to do; both of its objects are kept.
//! 2. content match: some record whose intrinsic has the same size and
//!    digest. Upload a namefile pointing at that intrinsic.
//! 3. a body already planned in this run with the same content. Add a
//!    namefile to that plan entry.
//! 4. otherwise a full upload: new intrinsic plus namefile.
//!
//! Digests are only computed once sizes match.

use std::collections::BTreeMap;
use std::sync::Arc;

use shroud_core::{ShroudError, ShroudResult};
use tracing::{debug, info, warn};

use crate::index::{DeletionSet, RemoteIndex};
use crate::local::LocalRecord;
use crate::metadata::IntrinsicMetadata;
use crate::scheduler::{BodyUpload, NamefileUpload, UploadPair};
use crate::stats::{ProgressFn, SyncPhase, SyncStats};

/// What correlation decided for one local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    Identity,
    /// Matched the content of an existing intrinsic
    Content { intrinsic: String },
    /// Shares the body planned for an earlier file in this run
    Planned { intrinsic: String },
    New { intrinsic: String },
    /// The file could not be read; nothing was planned for it
    Skipped,
}

pub struct Reconciler<'a> {
    index: &'a RemoteIndex,
    deletions: DeletionSet,
    stats: &'a SyncStats,
    plan: Vec<UploadPair>,
    /// Plan entries that carry a body, by plaintext size
    planned_bodies: BTreeMap<u64, Vec<usize>>,
    progress_interval: u64,
    progress: Option<ProgressFn>,
}

impl<'a> Reconciler<'a> {
    pub fn new(index: &'a RemoteIndex, deletions: DeletionSet, stats: &'a SyncStats) -> Self {
        Self {
            index,
            deletions,
            stats,
            plan: Vec::new(),
            planned_bodies: BTreeMap::new(),
            progress_interval: 1000,
            progress: None,
        }
    }

    pub fn with_progress(mut self, interval: u64, progress: Option<ProgressFn>) -> Self {
        self.progress_interval = interval.max(1);
        self.progress = progress;
        self
    }

    /// Correlate one local file against the index and the plan so far.
    ///
    /// Unreadable files are logged and reported as `Skipped`; only errors
    /// unrelated to the file itself propagate.
    pub fn correlate(&mut self, local: LocalRecord) -> ShroudResult<Correlation> {
        let scanned = SyncStats::incr(&self.stats.scanned);
        if scanned % self.progress_interval == 0 {
            info!(scanned, planned = self.plan.len(), "scanning local files");
            if let Some(cb) = &self.progress {
                cb(SyncPhase::Scanning, scanned, &local.local_name);
            }
        }

        match self.correlate_inner(local) {
            Ok(c) => Ok(c),
            Err(e @ ShroudError::LocalIo { .. }) => {
                SyncStats::incr(&self.stats.local_errors);
                warn!("skipping local file: {e}");
                Ok(Correlation::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    fn correlate_inner(&mut self, local: LocalRecord) -> ShroudResult<Correlation> {
        if let Some(record) = self.index.record(&local.local_name) {
            if record.size() == local.size && record.timestamp() == local.timestamp_ms {
                self.deletions.remove(&record.namefile.remote_name);
                self.deletions.remove(&record.intrinsic.remote_name);
                SyncStats::incr(&self.stats.identity_matches);
                return Ok(Correlation::Identity);
            }
        }

        if let Some(intrinsic) = self.find_remote_content(&local)? {
            let name = intrinsic.remote_name.clone();
            self.deletions.remove(&name);
            SyncStats::incr(&self.stats.content_matches);
            debug!(local = %local.local_name, intrinsic = %name, "content match");
            self.plan.push(UploadPair {
                intrinsic_name: name.clone(),
                namefiles: vec![NamefileUpload::for_local(&local)],
                local: Arc::new(local),
                body: None,
                duplicates: Vec::new(),
            });
            return Ok(Correlation::Content { intrinsic: name });
        }

        if let Some(slot) = self.find_planned_content(&local)? {
            let pair = &mut self.plan[slot];
            debug!(local = %local.local_name, intrinsic = %pair.intrinsic_name, "shares planned body");
            pair.namefiles.push(NamefileUpload::for_local(&local));
            pair.duplicates.push(Arc::new(local));
            SyncStats::incr(&self.stats.deduplicated);
            return Ok(Correlation::Planned {
                intrinsic: pair.intrinsic_name.clone(),
            });
        }

        let name = IntrinsicMetadata::new_remote_name();
        SyncStats::incr(&self.stats.planned_bodies);
        self.planned_bodies
            .entry(local.size)
            .or_default()
            .push(self.plan.len());
        self.plan.push(UploadPair {
            intrinsic_name: name.clone(),
            namefiles: vec![NamefileUpload::for_local(&local)],
            body: Some(BodyUpload { size: local.size }),
            local: Arc::new(local),
            duplicates: Vec::new(),
        });
        Ok(Correlation::New { intrinsic: name })
    }

    fn find_remote_content(&self, local: &LocalRecord) -> ShroudResult<Option<&'a IntrinsicMetadata>> {
        let index: &'a RemoteIndex = self.index;
        let candidates = index.content_candidates(local.size);
        if candidates.is_empty() {
            return Ok(None);
        }
        let digest = local.digest()?;
        Ok(candidates
            .iter()
            .find(|i| i.same_content(&digest, local.size)))
    }

    fn find_planned_content(&self, local: &LocalRecord) -> ShroudResult<Option<usize>> {
        let Some(slots) = self.planned_bodies.get(&local.size) else {
            return Ok(None);
        };
        let digest = local.digest()?;
        for &slot in slots {
            match self.plan[slot].local.digest() {
                Ok(d) if d == digest => return Ok(Some(slot)),
                Ok(_) => {}
                Err(e) => {
                    debug!(local = %self.plan[slot].local.local_name, "cannot hash planned file: {e}");
                }
            }
        }
        Ok(None)
    }

    /// Upload plan in discovery order, and the deletion set left after
    /// every live reference was removed.
    pub fn finish(self) -> (Vec<UploadPair>, DeletionSet) {
        info!(
            scanned = self.stats.scanned.load(std::sync::atomic::Ordering::Relaxed),
            planned = self.plan.len(),
            orphans = self.deletions.len(),
            "local correlation complete"
        );
        (self.plan, self.deletions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{NamefileMetadata, RemoteEntry};
    use shroud_crypto::digest_bytes;
    use std::path::Path;

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn local(&self, name: &str, content: &[u8], ts: i64) -> LocalRecord {
            let path = self.dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            LocalRecord::new(path, name.to_string(), content.len() as u64, ts)
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }
    }

    fn remote(entries: &[(&str, &str, &[u8], i64)]) -> Vec<RemoteEntry> {
        let mut out = Vec::new();
        for (intrinsic, local, content, ts) in entries {
            out.push(RemoteEntry::Intrinsic(IntrinsicMetadata {
                digest: digest_bytes(content),
                size: content.len() as u64,
                remote_name: intrinsic.to_string(),
                remote_id: format!("id-{intrinsic}"),
            }));
            out.push(RemoteEntry::Namefile(NamefileMetadata {
                timestamp: *ts,
                local_name: local.to_string(),
                remote_name: format!("names/{local}"),
                remote_id: format!("id-names/{local}"),
                intrinsic_name: intrinsic.to_string(),
            }));
        }
        out
    }

    #[test]
    fn identity_match_keeps_both_objects() {
        let fx = Fixture::new();
        let (index, deletions) = RemoteIndex::from_entries(remote(&[("i1", "a.txt", b"alpha", 7)]));
        let stats = SyncStats::default();
        let mut r = Reconciler::new(&index, deletions, &stats);

        let local = fx.local("a.txt", b"alpha", 7);
        assert_eq!(r.correlate(local).unwrap(), Correlation::Identity);

        let (plan, deletions) = r.finish();
        assert!(plan.is_empty());
        assert!(deletions.is_empty());
        assert_eq!(stats.snapshot().identity_matches, 1);
    }

    #[test]
    fn identity_match_does_not_hash() {
        let fx = Fixture::new();
        let (index, deletions) = RemoteIndex::from_entries(remote(&[("i1", "a.txt", b"alpha", 7)]));
        let stats = SyncStats::default();
        let mut r = Reconciler::new(&index, deletions, &stats);

        let local = fx.local("a.txt", b"alpha", 7);
        let path = local.path.clone();
        std::fs::remove_file(&path).unwrap();
        // Hashing would fail on the missing file; identity never hashes.
        assert_eq!(r.correlate(local).unwrap(), Correlation::Identity);
    }

    #[test]
    fn rename_is_namefile_only() {
        let fx = Fixture::new();
        let (index, deletions) = RemoteIndex::from_entries(remote(&[("i1", "old.txt", b"alpha", 7)]));
        let stats = SyncStats::default();
        let mut r = Reconciler::new(&index, deletions, &stats);

        let local = fx.local("new.txt", b"alpha", 9);
        assert_eq!(
            r.correlate(local).unwrap(),
            Correlation::Content {
                intrinsic: "i1".into()
            }
        );

        let (plan, deletions) = r.finish();
        assert_eq!(plan.len(), 1);
        assert!(plan[0].body.is_none());
        assert_eq!(plan[0].intrinsic_name, "i1");
        assert_eq!(plan[0].namefiles[0].local_name, "new.txt");
        // The old namefile is an orphan, its intrinsic is still referenced.
        assert!(deletions.contains("names/old.txt"));
        assert!(!deletions.contains("i1"));
    }

    #[test]
    fn touch_is_namefile_only() {
        let fx = Fixture::new();
        let (index, deletions) = RemoteIndex::from_entries(remote(&[("i1", "a.txt", b"alpha", 7)]));
        let stats = SyncStats::default();
        let mut r = Reconciler::new(&index, deletions, &stats);

        let c = r.correlate(fx.local("a.txt", b"alpha", 8)).unwrap();
        assert_eq!(c, Correlation::Content { intrinsic: "i1".into() });
    }

    #[test]
    fn changed_content_is_full_upload() {
        let fx = Fixture::new();
        let (index, deletions) = RemoteIndex::from_entries(remote(&[("i1", "a.txt", b"alpha", 7)]));
        let stats = SyncStats::default();
        let mut r = Reconciler::new(&index, deletions, &stats);

        // Same size, different bytes.
        let c = r.correlate(fx.local("a.txt", b"ALPHA", 8)).unwrap();
        assert!(matches!(c, Correlation::New { .. }));

        let (plan, deletions) = r.finish();
        assert_eq!(plan[0].body, Some(BodyUpload { size: 5 }));
        assert!(deletions.contains("i1"));
        assert!(deletions.contains("names/a.txt"));
    }

    #[test]
    fn different_size_never_hashed() {
        let fx = Fixture::new();
        let (index, deletions) = RemoteIndex::from_entries(remote(&[("i1", "a.txt", b"alpha", 7)]));
        let stats = SyncStats::default();
        let mut r = Reconciler::new(&index, deletions, &stats);

        let local = fx.local("b.txt", b"much longer content", 1);
        r.correlate(local).unwrap();
        let (plan, _) = r.finish();
        assert!(!plan[0].local.digest_computed());
    }

    #[test]
    fn duplicates_share_planned_body() {
        let fx = Fixture::new();
        let index = RemoteIndex::default();
        let stats = SyncStats::default();
        let mut r = Reconciler::new(&index, DeletionSet::default(), &stats);

        let first = r.correlate(fx.local("one.bin", b"same bytes", 1)).unwrap();
        let second = r.correlate(fx.local("two.bin", b"same bytes", 2)).unwrap();
        let Correlation::New { intrinsic } = first else {
            panic!("expected New, got {first:?}");
        };
        assert_eq!(second, Correlation::Planned { intrinsic });

        let (plan, _) = r.finish();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].namefiles.len(), 2);
        assert_eq!(plan[0].duplicates.len(), 1);
        assert_eq!(plan[0].duplicates[0].local_name, "two.bin");
        assert_eq!(stats.snapshot().deduplicated, 1);
    }

    #[test]
    fn tie_break_prefers_smallest_intrinsic_name() {
        let fx = Fixture::new();
        let (index, deletions) = RemoteIndex::from_entries(remote(&[
            ("m-intrinsic", "x", b"dup", 1),
            ("b-intrinsic", "y", b"dup", 1),
        ]));
        let stats = SyncStats::default();
        let mut r = Reconciler::new(&index, deletions, &stats);

        let c = r.correlate(fx.local("z", b"dup", 5)).unwrap();
        assert_eq!(
            c,
            Correlation::Content {
                intrinsic: "b-intrinsic".into()
            }
        );
    }

    #[test]
    fn unreadable_file_is_skipped() {
        let fx = Fixture::new();
        let (index, deletions) = RemoteIndex::from_entries(remote(&[("i1", "a.txt", b"alpha", 7)]));
        let stats = SyncStats::default();
        let mut r = Reconciler::new(&index, deletions, &stats);

        let ghost = LocalRecord::new(fx.root().join("ghost"), "ghost".into(), 5, 1);
        assert_eq!(r.correlate(ghost).unwrap(), Correlation::Skipped);
        assert_eq!(stats.snapshot().local_errors, 1);
    }
}
