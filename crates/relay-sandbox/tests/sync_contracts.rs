//! Sync engine contract tests: idempotence, conflict protection, and
//! manifest recovery.

use std::sync::Arc;

use bytes::Bytes;
use relay_core::storage::{MemoryBackend, PutPrecondition, PutResult, StorageBackend};
use relay_sandbox::sync::{Manifest, ManifestEntry, SyncConfig, SyncEngine, MANIFEST_FILE};

const PREFIX: &str = "tenant/p1/w1";

fn engine(storage: Arc<MemoryBackend>) -> SyncEngine {
    SyncEngine::new(
        storage,
        SyncConfig {
            prefix: PREFIX.to_string(),
            ..SyncConfig::default()
        },
    )
}

async fn put_remote(storage: &MemoryBackend, rel: &str, data: &str) -> String {
    match storage
        .put(
            &format!("{PREFIX}/{rel}"),
            Bytes::from(data.to_string()),
            PutPrecondition::None,
        )
        .await
        .expect("put")
    {
        PutResult::Success { generation } => generation,
        PutResult::PreconditionFailed { .. } => panic!("unconditional put failed"),
    }
}

#[tokio::test]
async fn round_trip_idempotence() {
    let storage = Arc::new(MemoryBackend::new());
    put_remote(&storage, "doc/readme.md", "# hello").await;
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(dir.path().join("src")).expect("mkdir");
    std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").expect("seed");

    let engine = engine(Arc::clone(&storage));

    let first = engine.sync(dir.path()).await.expect("first run");
    assert_eq!(first.downloaded, 1);
    assert_eq!(first.uploaded, 1);
    assert_eq!(first.conflicts, 0);

    // No local or remote change: the second run transfers nothing.
    let second = engine.sync(dir.path()).await.expect("second run");
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.uploaded, 0);
    assert_eq!(second.conflicts, 0);
}

#[tokio::test]
async fn divergent_local_and_remote_is_a_conflict_and_remote_wins() {
    let storage = Arc::new(MemoryBackend::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine(Arc::clone(&storage));

    // Establish a tracked object.
    put_remote(&storage, "foo.txt", "v1").await;
    engine.sync(dir.path()).await.expect("initial sync");

    // The remote moves to a new generation while the local copy is edited.
    put_remote(&storage, "foo.txt", "remote v2").await;
    std::fs::write(dir.path().join("foo.txt"), "local edit").expect("edit");

    let stats = engine.sync(dir.path()).await.expect("conflicted sync");
    assert_eq!(stats.downloaded, 1);
    assert_eq!(stats.uploaded, 0);
    assert_eq!(stats.conflicts, 1);

    // The remote content replaced the local edit.
    let content = std::fs::read_to_string(dir.path().join("foo.txt")).expect("read");
    assert_eq!(content, "remote v2");
}

#[tokio::test]
async fn seeded_manifest_with_stale_generation_conflicts() {
    let storage = Arc::new(MemoryBackend::new());
    let dir = tempfile::tempdir().expect("tempdir");

    // Remote is at generation 2 after two writes.
    put_remote(&storage, "foo.txt", "gen1").await;
    let gen2 = put_remote(&storage, "foo.txt", "gen2").await;

    // Local file plus a manifest pinned at a stale generation with stale
    // stats, as if another executor advanced the remote since our last run.
    std::fs::write(dir.path().join("foo.txt"), "local content").expect("seed");
    let mut manifest = Manifest::default();
    manifest.insert(
        format!("{PREFIX}/foo.txt"),
        ManifestEntry {
            remote_gen: "1".into(),
            local_mtime: 1,
            local_size: 1,
        },
    );
    manifest.save(dir.path()).await.expect("save manifest");

    let engine = engine(Arc::clone(&storage));
    let stats = engine.sync(dir.path()).await.expect("sync");

    assert_eq!(stats.downloaded, 1);
    assert_eq!(stats.uploaded, 0);
    assert_eq!(stats.conflicts, 1);
    assert_ne!(gen2, "1");

    let content = std::fs::read_to_string(dir.path().join("foo.txt")).expect("read");
    assert_eq!(content, "gen2");
}

#[tokio::test]
async fn corrupt_manifest_recovers_by_redownloading() {
    let storage = Arc::new(MemoryBackend::new());
    let dir = tempfile::tempdir().expect("tempdir");
    put_remote(&storage, "foo.txt", "content").await;

    let engine = engine(Arc::clone(&storage));
    engine.sync(dir.path()).await.expect("initial sync");

    std::fs::write(dir.path().join(MANIFEST_FILE), "{broken").expect("corrupt");

    let stats = engine.sync(dir.path()).await.expect("recovery sync");
    assert_eq!(stats.downloaded, 1);

    // The manifest was rewritten and the next run is quiet again.
    let next = engine.sync(dir.path()).await.expect("quiet sync");
    assert_eq!(next.downloaded, 0);
}

#[tokio::test]
async fn overlapping_triggers_coalesce() {
    let storage = Arc::new(MemoryBackend::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(engine(Arc::clone(&storage)));

    // Serialized runs both complete.
    let a = engine.sync(dir.path()).await.expect("run a");
    let b = engine.try_sync(dir.path()).await.expect("run b");
    assert_eq!(a.downloaded, 0);
    assert!(b.is_some());
}
