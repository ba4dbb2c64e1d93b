//! Integration tests: full sync runs against an in-memory bucket
//!
//! Each test mirrors a temp directory into a `MemoryStore` and then
//! inspects the store's operation log.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use secrecy::SecretString;
use shroud_core::ShroudError;
use shroud_crypto::KdfParams;
use shroud_storage::{Fields, MemoryStore, StoreOp};
use shroud_sync::metadata::{NamefileMetadata, KEYFILE_NAME, NAMEFILE_PREFIX};
use shroud_sync::{SyncEngine, SyncOptions};
use tempfile::TempDir;

fn kdf() -> KdfParams {
    KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}

fn options(delete_orphans: bool) -> SyncOptions {
    SyncOptions {
        kdf: kdf(),
        chunk_size: 256,
        delete_orphans,
        ..Default::default()
    }
}

fn passphrase() -> SecretString {
    SecretString::from("correct horse battery staple")
}

async fn engine(store: &MemoryStore, opts: SyncOptions) -> SyncEngine {
    SyncEngine::open(Arc::new(store.clone()), &passphrase(), opts)
        .await
        .expect("open engine")
}

fn write(root: &Path, name: &str, content: &[u8]) {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

fn namefile_uploads(ops: &[StoreOp]) -> usize {
    ops.iter()
        .filter(|op| op.is_upload() && op.name().starts_with(NAMEFILE_PREFIX))
        .count()
}

fn body_uploads(ops: &[StoreOp]) -> usize {
    ops.iter()
        .filter(|op| {
            op.is_upload() && !op.name().starts_with(NAMEFILE_PREFIX) && op.name() != KEYFILE_NAME
        })
        .count()
}

#[tokio::test]
async fn first_run_uploads_everything() {
    let tree = TempDir::new().unwrap();
    write(tree.path(), "a.txt", b"alpha");
    write(tree.path(), "docs/b.md", b"bravo bravo");
    write(tree.path(), "empty", b"");

    let store = MemoryStore::default();
    let engine = engine(&store, options(false)).await;
    assert!(engine.created_keyfile());

    let report = engine.run(tree.path()).await.unwrap();
    assert_eq!(report.scanned, 3);
    assert_eq!(report.uploaded_bodies, 3);
    assert_eq!(report.uploaded_namefiles, 3);
    // keyfile + 3 intrinsics + 3 namefiles
    assert_eq!(store.len(), 7);
}

#[tokio::test]
async fn second_run_without_changes_is_a_noop() {
    let tree = TempDir::new().unwrap();
    write(tree.path(), "a.txt", b"alpha");
    write(tree.path(), "nested/deeper/c.bin", &[7u8; 1000]);

    let store = MemoryStore::default();
    let engine = engine(&store, options(true)).await;
    engine.run(tree.path()).await.unwrap();
    store.clear_ops();

    let report = engine.run(tree.path()).await.unwrap();
    assert!(store.ops().is_empty(), "unexpected ops: {:?}", store.ops());
    assert_eq!(report.identity_matches, 2);
    assert_eq!(report.total_uploads(), 0);
    assert_eq!(report.deleted, 0);
}

#[tokio::test]
async fn rename_uploads_only_a_namefile() {
    let tree = TempDir::new().unwrap();
    write(tree.path(), "old.txt", b"some content that moves");

    let store = MemoryStore::default();
    let engine = engine(&store, options(true)).await;
    engine.run(tree.path()).await.unwrap();
    let before = store.object_names();
    store.clear_ops();

    std::fs::rename(tree.path().join("old.txt"), tree.path().join("new.txt")).unwrap();
    let report = engine.run(tree.path()).await.unwrap();

    let ops = store.ops();
    assert_eq!(namefile_uploads(&ops), 1);
    assert_eq!(body_uploads(&ops), 0);
    assert_eq!(report.content_matches, 1);

    // Only the old namefile goes; the intrinsic is still referenced.
    let deleted = store.deletions();
    assert_eq!(deleted.len(), 1);
    assert!(deleted[0].starts_with(NAMEFILE_PREFIX));
    let intrinsic = before
        .iter()
        .find(|n| !n.starts_with(NAMEFILE_PREFIX) && n.as_str() != KEYFILE_NAME)
        .unwrap();
    assert!(store.contains(intrinsic));
}

#[tokio::test]
async fn touch_uploads_only_a_namefile() {
    let tree = TempDir::new().unwrap();
    write(tree.path(), "a.txt", b"unchanged bytes");

    let store = MemoryStore::default();
    let engine = engine(&store, options(true)).await;
    engine.run(tree.path()).await.unwrap();
    store.clear_ops();

    let file = std::fs::File::options()
        .write(true)
        .open(tree.path().join("a.txt"))
        .unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(3600))
        .unwrap();
    drop(file);

    let report = engine.run(tree.path()).await.unwrap();
    assert_eq!(report.content_matches, 1);
    assert_eq!(namefile_uploads(&store.ops()), 1);
    assert_eq!(body_uploads(&store.ops()), 0);
    assert_eq!(store.deletions().len(), 1);
}

#[tokio::test]
async fn changed_content_uploads_new_body_and_drops_old() {
    let tree = TempDir::new().unwrap();
    write(tree.path(), "a.txt", b"version one");

    let store = MemoryStore::default();
    let engine = engine(&store, options(true)).await;
    engine.run(tree.path()).await.unwrap();
    store.clear_ops();

    write(tree.path(), "a.txt", b"version two");
    let report = engine.run(tree.path()).await.unwrap();

    assert_eq!(report.uploaded_bodies, 1);
    assert_eq!(report.uploaded_namefiles, 1);
    // Old intrinsic and old namefile.
    assert_eq!(report.deleted, 2);
    assert_eq!(store.len(), 3);
}

#[tokio::test]
async fn identical_files_share_one_body() {
    let tree = TempDir::new().unwrap();
    write(tree.path(), "one.bin", &[42u8; 700]);
    write(tree.path(), "two.bin", &[42u8; 700]);
    write(tree.path(), "sub/three.bin", &[42u8; 700]);

    let store = MemoryStore::default();
    let engine = engine(&store, options(false)).await;
    let report = engine.run(tree.path()).await.unwrap();

    let ops = store.ops();
    assert_eq!(body_uploads(&ops), 1);
    assert_eq!(namefile_uploads(&ops), 3);
    assert_eq!(report.deduplicated, 2);

    // A later copy matches the uploaded intrinsic.
    store.clear_ops();
    write(tree.path(), "four.bin", &[42u8; 700]);
    let report = engine.run(tree.path()).await.unwrap();
    assert_eq!(report.content_matches, 1);
    assert_eq!(body_uploads(&store.ops()), 0);
}

#[tokio::test]
async fn orphans_deleted_only_when_requested() {
    let tree = TempDir::new().unwrap();
    write(tree.path(), "keep.txt", b"keep");
    write(tree.path(), "drop.txt", b"drop me");

    let store = MemoryStore::default();
    engine(&store, options(false))
        .await
        .run(tree.path())
        .await
        .unwrap();
    std::fs::remove_file(tree.path().join("drop.txt")).unwrap();
    store.clear_ops();

    let report = engine(&store, options(false))
        .await
        .run(tree.path())
        .await
        .unwrap();
    assert_eq!(report.deleted, 0);
    assert!(store.ops().is_empty());
    assert_eq!(store.len(), 5);

    let report = engine(&store, options(true))
        .await
        .run(tree.path())
        .await
        .unwrap();
    assert_eq!(report.deleted, 2);
    assert_eq!(store.len(), 3);
}

#[tokio::test]
async fn dangling_namefile_is_dropped() {
    let tree = TempDir::new().unwrap();
    write(tree.path(), "ghost.txt", b"boo");

    let store = MemoryStore::default();
    let engine = engine(&store, options(true)).await;

    let fields = NamefileMetadata::encode_fields(1, "ghost.txt", "no-such-intrinsic", engine.crypter())
        .unwrap();
    store.seed("names/dangling", NamefileMetadata::filler_body(), fields);

    let report = engine.run(tree.path()).await.unwrap();
    assert_eq!(report.remote_records, 0);
    // The dangling binding never matched, so the file was uploaded fresh.
    assert_eq!(report.uploaded_bodies, 1);
    assert!(!store.contains("names/dangling"));
    assert!(store.deletions().contains(&"names/dangling".to_string()));
}

#[tokio::test]
async fn dangling_namefile_kept_without_orphan_deletion() {
    let tree = TempDir::new().unwrap();
    let store = MemoryStore::default();
    let engine = engine(&store, options(false)).await;

    let fields =
        NamefileMetadata::encode_fields(1, "x", "no-such-intrinsic", engine.crypter()).unwrap();
    store.seed("names/dangling", NamefileMetadata::filler_body(), fields);

    engine.run(tree.path()).await.unwrap();
    assert!(store.contains("names/dangling"));
}

#[tokio::test]
async fn foreign_objects_survive_unless_deleting() {
    let tree = TempDir::new().unwrap();
    let store = MemoryStore::default();
    store.seed("README.txt", b"not ours".to_vec(), Fields::new());

    let report = engine(&store, options(false))
        .await
        .run(tree.path())
        .await
        .unwrap();
    assert_eq!(report.unrecognized, 1);
    assert!(store.contains("README.txt"));

    engine(&store, options(true))
        .await
        .run(tree.path())
        .await
        .unwrap();
    assert!(!store.contains("README.txt"));
    assert!(store.contains(KEYFILE_NAME));
}

#[tokio::test]
async fn skip_renames_uploads_nothing_for_a_rename() {
    let tree = TempDir::new().unwrap();
    write(tree.path(), "a.txt", b"payload");

    let store = MemoryStore::default();
    engine(&store, options(false))
        .await
        .run(tree.path())
        .await
        .unwrap();
    store.clear_ops();

    std::fs::rename(tree.path().join("a.txt"), tree.path().join("b.txt")).unwrap();
    let opts = SyncOptions {
        skip_renames: true,
        ..options(false)
    };
    let report = engine(&store, opts).await.run(tree.path()).await.unwrap();

    assert_eq!(report.skipped_renames, 1);
    assert_eq!(report.total_uploads(), 0);
    assert!(store.ops().is_empty());
}

#[tokio::test]
async fn large_bodies_take_the_multipart_path() {
    let tree = TempDir::new().unwrap();
    write(tree.path(), "small", &[1u8; 10]);
    write(tree.path(), "big", &[2u8; 4000]);

    let store = MemoryStore::default();
    let opts = SyncOptions {
        large_file_threshold: 1000,
        ..options(false)
    };
    let engine = engine(&store, opts).await;
    let report = engine.run(tree.path()).await.unwrap();

    assert_eq!(report.large_uploads, 1);
    let large: Vec<_> = store
        .ops()
        .into_iter()
        .filter(|op| matches!(op, StoreOp::UploadLarge { .. }))
        .collect();
    assert_eq!(large.len(), 1);
    let StoreOp::UploadLarge { size, .. } = &large[0] else {
        unreachable!()
    };
    assert_eq!(*size, engine.crypter().encrypted_len(4000));
}

#[tokio::test]
async fn incomplete_large_uploads_cancelled_by_orphan_run() {
    let tree = TempDir::new().unwrap();
    let store = MemoryStore::default();
    store.begin_incomplete_large("abandoned", Fields::new());

    let report = engine(&store, options(false))
        .await
        .run(tree.path())
        .await
        .unwrap();
    assert_eq!(report.incomplete_cancelled, 0);
    assert_eq!(store.incomplete_names(), vec!["abandoned".to_string()]);

    let report = engine(&store, options(true))
        .await
        .run(tree.path())
        .await
        .unwrap();
    assert_eq!(report.incomplete_cancelled, 1);
    assert!(store.incomplete_names().is_empty());
}

#[tokio::test]
async fn failed_upload_aborts_and_rerun_completes() {
    let tree = TempDir::new().unwrap();
    for i in 0..5 {
        write(tree.path(), &format!("f{i}"), format!("file number {i}").as_bytes());
    }

    let store = MemoryStore::default();
    let engine = engine(&store, options(true)).await;
    store.fail_uploads(true);
    let err = engine.run(tree.path()).await.unwrap_err();
    assert!(matches!(err, ShroudError::Remote(_)), "got: {err:?}");
    // Nothing was deleted by the failed run.
    assert!(store.deletions().is_empty());

    store.fail_uploads(false);
    let report = engine.run(tree.path()).await.unwrap();
    assert_eq!(report.uploaded_bodies, 5);
    store.clear_ops();
    engine.run(tree.path()).await.unwrap();
    assert!(store.ops().is_empty());
}

#[tokio::test]
async fn wrong_passphrase_is_rejected() {
    let store = MemoryStore::default();
    engine(&store, options(false)).await;

    let err = SyncEngine::open(
        Arc::new(store.clone()),
        &SecretString::from("not it"),
        options(false),
    )
    .await
    .err()
    .unwrap();
    assert!(err.is_authentication());
}

#[tokio::test]
async fn rotated_passphrase_keeps_content_readable() {
    let tree = TempDir::new().unwrap();
    write(tree.path(), "a.txt", b"before rotation");

    let store = MemoryStore::default();
    let engine = engine(&store, options(true)).await;
    engine.run(tree.path()).await.unwrap();

    let new_pass = SecretString::from("a brand new passphrase");
    engine.rotate_passphrase(&new_pass).await.unwrap();
    store.clear_ops();

    let old = SyncEngine::open(Arc::new(store.clone()), &passphrase(), options(true)).await;
    assert!(old.err().unwrap().is_authentication());

    let reopened = SyncEngine::open(Arc::new(store.clone()), &new_pass, options(true))
        .await
        .unwrap();
    assert!(!reopened.created_keyfile());
    let report = reopened.run(tree.path()).await.unwrap();
    assert_eq!(report.identity_matches, 1);
    assert!(store.ops().is_empty());
}

#[tokio::test]
async fn excluded_files_are_not_uploaded() {
    let tree = TempDir::new().unwrap();
    write(tree.path(), "keep.txt", b"k");
    write(tree.path(), "skip.tmp", b"s");

    let store = MemoryStore::default();
    let mut opts = options(false);
    opts.walk.exclude_patterns = vec!["*.tmp".into()];
    let report = engine(&store, opts).await.run(tree.path()).await.unwrap();

    assert_eq!(report.scanned, 1);
    assert_eq!(report.uploaded_bodies, 1);
}
