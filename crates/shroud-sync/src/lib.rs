//! shroud-sync: the reconciliation engine
//!
//! Remote content and naming are kept apart: an *intrinsic* object holds an
//! encrypted file body under a random name, and a *namefile* binds a local
//! path to it. Renames and touches upload a new namefile only; identical
//! files share one intrinsic.

pub mod engine;
pub mod index;
pub mod keyfile;
pub mod local;
pub mod metadata;
pub mod purge;
pub mod reconcile;
pub mod restore;
pub mod scheduler;
pub mod stats;

pub use engine::{SyncEngine, SyncOptions};
pub use index::{DeletionSet, RemoteIndex};
pub use local::{walk_local, LocalRecord, WalkConfig};
pub use metadata::{IntrinsicMetadata, NamefileMetadata, RemoteEntry, RemoteRecord};
pub use purge::purge_bucket;
pub use reconcile::{Correlation, Reconciler};
pub use restore::{RestoreReport, Restorer};
pub use scheduler::{run_uploads, UploadOptions, UploadPair, UploadQueue};
pub use stats::{ProgressFn, SyncPhase, SyncReport, SyncStats};

use shroud_core::ShroudError;

pub(crate) fn task_failed(e: tokio::task::JoinError) -> ShroudError {
    ShroudError::Other(anyhow::anyhow!("background task failed: {e}"))
}
