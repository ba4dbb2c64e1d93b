//! Remote indexing: one listing, classified and joined into records

use std::collections::BTreeMap;

use shroud_core::ShroudResult;
use shroud_crypto::Crypter;
use shroud_storage::{ObjectStore, RemoteObject};
use tracing::{debug, info, warn};

use crate::metadata::{classify, IntrinsicMetadata, NamefileMetadata, RemoteEntry, RemoteRecord};
use crate::stats::SyncStats;

/// Remote objects slated for deletion, keyed by object name.
///
/// Starts out holding every intrinsic and namefile; correlation removes the
/// ones still referenced. Whatever is left after the walk is an orphan.
#[derive(Debug, Clone, Default)]
pub struct DeletionSet {
    entries: BTreeMap<String, String>,
}

impl DeletionSet {
    pub fn insert(&mut self, name: &str, id: &str) {
        self.entries.insert(name.to_string(), id.to_string());
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (name, id) pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, i)| (n.as_str(), i.as_str()))
    }
}

#[derive(Debug, Default)]
pub struct RemoteIndex {
    records: BTreeMap<String, RemoteRecord>,
    intrinsics: BTreeMap<String, IntrinsicMetadata>,
    /// Intrinsics referenced by at least one record, by size, name-sorted
    by_size: BTreeMap<u64, Vec<IntrinsicMetadata>>,
    dangling: Vec<NamefileMetadata>,
    superseded: Vec<NamefileMetadata>,
    unrecognized: Vec<(RemoteObject, String)>,
    has_keyfile: bool,
}

impl RemoteIndex {
    /// List the bucket and build the index.
    ///
    /// With `delete_orphans`, unrecognized objects are deleted right away and
    /// the returned set holds every intrinsic and namefile. Without it the
    /// set is empty and nothing is ever deleted.
    pub async fn build(
        store: &dyn ObjectStore,
        crypter: &Crypter,
        delete_orphans: bool,
        stats: &SyncStats,
    ) -> ShroudResult<(Self, DeletionSet)> {
        let objects = store.list_objects().await?;
        SyncStats::add(&stats.remote_objects, objects.len() as u64);

        let entries = objects.iter().map(|obj| classify(obj, crypter));
        let (index, deletions) = Self::from_entries(entries);

        SyncStats::add(&stats.remote_records, index.records.len() as u64);
        SyncStats::add(&stats.unrecognized, index.unrecognized.len() as u64);

        for (obj, reason) in &index.unrecognized {
            if delete_orphans {
                warn!(object = %obj.name, %reason, "deleting incompatible object");
                store.delete(&obj.name, &obj.id).await?;
                SyncStats::incr(&stats.deleted);
            } else {
                warn!(object = %obj.name, %reason, "ignoring incompatible object");
            }
        }

        info!(
            bucket = store.bucket(),
            objects = objects.len(),
            records = index.records.len(),
            intrinsics = index.intrinsics.len(),
            dangling = index.dangling.len(),
            superseded = index.superseded.len(),
            "remote index built"
        );

        let deletions = if delete_orphans {
            deletions
        } else {
            DeletionSet::default()
        };
        Ok((index, deletions))
    }

    /// Build the index from already-classified entries. The returned set
    /// holds every intrinsic and namefile seen.
    pub fn from_entries(entries: impl IntoIterator<Item = RemoteEntry>) -> (Self, DeletionSet) {
        let mut index = Self::default();
        let mut deletions = DeletionSet::default();
        let mut newest: BTreeMap<String, NamefileMetadata> = BTreeMap::new();

        for entry in entries {
            match entry {
                RemoteEntry::Keyfile(_) => index.has_keyfile = true,
                RemoteEntry::Intrinsic(intrinsic) => {
                    deletions.insert(&intrinsic.remote_name, &intrinsic.remote_id);
                    index
                        .intrinsics
                        .insert(intrinsic.remote_name.clone(), intrinsic);
                }
                RemoteEntry::Namefile(namefile) => {
                    deletions.insert(&namefile.remote_name, &namefile.remote_id);
                    match newest.remove(&namefile.local_name) {
                        Some(current) if newer(&current, &namefile) => {
                            index.superseded.push(namefile);
                            newest.insert(current.local_name.clone(), current);
                        }
                        Some(current) => {
                            index.superseded.push(current);
                            newest.insert(namefile.local_name.clone(), namefile);
                        }
                        None => {
                            newest.insert(namefile.local_name.clone(), namefile);
                        }
                    }
                }
                RemoteEntry::Unrecognized { object, reason } => {
                    index.unrecognized.push((object, reason));
                }
            }
        }

        for (local_name, namefile) in newest {
            match index.intrinsics.get(&namefile.intrinsic_name) {
                Some(intrinsic) => {
                    let intrinsic = intrinsic.clone();
                    let bucket = index.by_size.entry(intrinsic.size).or_default();
                    if !bucket.iter().any(|i| i.remote_name == intrinsic.remote_name) {
                        bucket.push(intrinsic.clone());
                        bucket.sort_by(|a, b| a.remote_name.cmp(&b.remote_name));
                    }
                    index
                        .records
                        .insert(local_name, RemoteRecord { namefile, intrinsic });
                }
                None => {
                    debug!(
                        namefile = %namefile.remote_name,
                        intrinsic = %namefile.intrinsic_name,
                        "dangling namefile"
                    );
                    index.dangling.push(namefile);
                }
            }
        }

        (index, deletions)
    }

    pub fn record(&self, local_name: &str) -> Option<&RemoteRecord> {
        self.records.get(local_name)
    }

    /// Records in local-name order.
    pub fn records(&self) -> impl Iterator<Item = &RemoteRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Referenced intrinsics of exactly `size` bytes, smallest remote name first.
    pub fn content_candidates(&self, size: u64) -> &[IntrinsicMetadata] {
        self.by_size.get(&size).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn intrinsic(&self, remote_name: &str) -> Option<&IntrinsicMetadata> {
        self.intrinsics.get(remote_name)
    }

    pub fn dangling(&self) -> &[NamefileMetadata] {
        &self.dangling
    }

    pub fn superseded(&self) -> &[NamefileMetadata] {
        &self.superseded
    }

    pub fn unrecognized(&self) -> impl Iterator<Item = &RemoteObject> {
        self.unrecognized.iter().map(|(o, _)| o)
    }

    pub fn has_keyfile(&self) -> bool {
        self.has_keyfile
    }
}

/// Whether `a` should win over `b` for the same local name.
fn newer(a: &NamefileMetadata, b: &NamefileMetadata) -> bool {
    (a.timestamp, std::cmp::Reverse(&a.remote_name)) > (b.timestamp, std::cmp::Reverse(&b.remote_name))
}
