//! End-to-end tests of the spawn cache against an in-memory endpoint
//!
//! Covers the lookup/store state machine: hits, quiet misses for
//! non-cacheable spawns and orphaned results, warnings for real failures,
//! and which digests reach the wire.

use bytes::Bytes;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use stowage_events::{CacheEvent, MissReason, StowageEvent, StowageEventLayer};
use stowage_remote::client::SharedChannel;
use stowage_remote::merkle::LocalFileReader;
use prost::Message;
use stowage_remote::reapi::{ActionResult, Directory, FileNode, OutputDirectory, OutputFile, Tree};
use stowage_remote::{
    ActionBuilder, CasTransport, CommandMapper, Digest, InMemoryTransport, Lookup, MerkleTree,
    RemoteCache, RemoteConfig, RetryConfig, Spawn, SpawnCache, SpawnResult, StoreOutcome,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;

fn config() -> RemoteConfig {
    RemoteConfig {
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
            ..RetryConfig::default()
        },
        ..RemoteConfig::default()
    }
}

fn spawn_cache(transport: &Arc<InMemoryTransport>, exec_root: &Path) -> SpawnCache {
    let channel = SharedChannel::new(Arc::clone(transport) as Arc<dyn CasTransport>);
    SpawnCache::new(RemoteCache::new(channel, config()).unwrap(), exec_root)
}

/// Route cache events emitted on this thread into a channel
fn capture_events() -> (
    tracing::subscriber::DefaultGuard,
    mpsc::UnboundedReceiver<StowageEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscriber = tracing_subscriber::registry().with(StowageEventLayer::new(tx));
    (tracing::subscriber::set_default(subscriber), rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<StowageEvent>) -> Vec<CacheEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event.event);
    }
    events
}

fn warnings(events: &[CacheEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, CacheEvent::Warning { .. }))
        .count()
}

/// Spawn S1: reads `a.txt` containing "xyz" and declares it as its output
fn s1(exec_root: &Path) -> Spawn {
    std::fs::write(exec_root.join("a.txt"), b"xyz").unwrap();
    Spawn::new("Genrule", ["touch", "a.txt"])
        .input_file("a.txt")
        .output("a.txt")
}

#[tokio::test]
async fn test_store_then_lookup_restores_output() {
    let transport = Arc::new(InMemoryTransport::new());
    let producer = TempDir::new().unwrap();
    let cache = spawn_cache(&transport, producer.path());
    let spawn = s1(producer.path());

    let handle = cache.lookup(&spawn).await;
    assert!(!handle.has_result());
    let action_key = handle.action_key().cloned().unwrap();

    let outcome = handle.store(&SpawnResult::success()).await;
    assert!(matches!(&outcome, StoreOutcome::Stored(key) if *key == action_key));

    let xyz = Digest::from_bytes(b"xyz");
    assert!(transport.contains_blob(&xyz));
    let stored = transport.action_result(&action_key).unwrap();
    assert_eq!(stored.output_files.len(), 1);
    assert_eq!(stored.output_files[0].path, "a.txt");
    assert_eq!(
        Digest::try_from(stored.output_files[0].digest.as_ref().unwrap()).unwrap(),
        xyz
    );

    // A second workspace with the same input computes the same action key
    let consumer = TempDir::new().unwrap();
    let cache = spawn_cache(&transport, consumer.path());
    let spawn = s1(consumer.path());

    let handle = cache.lookup(&spawn).await;
    let hit = handle.result().unwrap();
    assert_eq!(hit.action_key, action_key);
    assert_eq!(std::fs::read(consumer.path().join("a.txt")).unwrap(), b"xyz");
}

#[tokio::test]
async fn test_hit_downloads_into_empty_exec_root() {
    let transport = Arc::new(InMemoryTransport::new());
    let root = TempDir::new().unwrap();
    let cache = spawn_cache(&transport, root.path());
    let spawn = Spawn::new("Genrule", ["sh", "-c", "echo xyz > out/b.txt"])
        .virtual_input("gen.sh", Bytes::from_static(b"echo xyz"))
        .output("out/b.txt");

    let handle = cache.lookup(&spawn).await;
    std::fs::create_dir_all(root.path().join("out")).unwrap();
    std::fs::write(root.path().join("out/b.txt"), b"xyz").unwrap();
    let result = SpawnResult {
        exit_code: 0,
        stdout: Bytes::from_static(b"done\n"),
        stderr: Bytes::new(),
    };
    assert!(handle.store(&result).await.is_stored());

    std::fs::remove_dir_all(root.path().join("out")).unwrap();
    let handle = cache.lookup(&spawn).await;
    let hit = handle.result().unwrap();
    assert_eq!(hit.outputs.stdout, Bytes::from_static(b"done\n"));
    assert!(hit.outputs.stderr.is_empty());
    assert_eq!(std::fs::read(root.path().join("out/b.txt")).unwrap(), b"xyz");
}

#[tokio::test]
async fn test_no_cache_spawn_makes_no_rpcs() {
    let transport = Arc::new(InMemoryTransport::new());
    let root = TempDir::new().unwrap();
    let cache = spawn_cache(&transport, root.path());
    let spawn = s1(root.path()).tag("no-cache");

    let handle = cache.lookup(&spawn).await;
    assert!(matches!(
        handle.lookup(),
        Lookup::Miss(MissReason::NotCacheable)
    ));

    let outcome = handle.store(&SpawnResult::success()).await;
    assert!(matches!(outcome, StoreOutcome::NotCacheable));
    assert_eq!(transport.calls().total_rpcs(), 0);
}

#[tokio::test]
async fn test_orphaned_result_is_a_quiet_miss() {
    let transport = Arc::new(InMemoryTransport::new());
    let root = TempDir::new().unwrap();
    let cache = spawn_cache(&transport, root.path());
    let spawn = s1(root.path());

    let (_guard, mut events) = capture_events();

    let action_key = cache.lookup(&spawn).await.action_key().cloned().unwrap();
    let evicted = Digest::from_bytes(b"evicted long ago");
    transport.insert_action_result(
        action_key,
        ActionResult {
            output_files: vec![OutputFile {
                path: "a.txt".into(),
                digest: Some(evicted.to_proto()),
                is_executable: false,
            }],
            ..ActionResult::default()
        },
    );

    let handle = cache.lookup(&spawn).await;
    assert!(matches!(handle.lookup(), Lookup::Miss(MissReason::Orphaned)));
    assert_eq!(std::fs::read(root.path().join("a.txt")).unwrap(), b"xyz");

    let events = drain(&mut events);
    assert_eq!(warnings(&events), 0);
    assert!(events.contains(&CacheEvent::Miss {
        spawn: spawn.describe(),
        reason: MissReason::Orphaned,
    }));
    assert_eq!(cache.stats().orphaned, 1);
}

#[tokio::test]
async fn test_lookup_failure_warns_once() {
    let transport = Arc::new(InMemoryTransport::new());
    let root = TempDir::new().unwrap();
    let cache = spawn_cache(&transport, root.path());
    let spawn = s1(root.path());

    let (_guard, mut events) = capture_events();
    transport.fail_next_get_action_result(tonic::Status::permission_denied("no access"));

    let handle = cache.lookup(&spawn).await;
    assert!(matches!(handle.lookup(), Lookup::Error(_)));
    assert_eq!(handle.lookup().miss_reason(), Some(MissReason::Error));

    let events = drain(&mut events);
    assert_eq!(warnings(&events), 1);
    assert_eq!(cache.stats().lookup_errors, 1);

    // The local result can still be stored
    assert!(handle.store(&SpawnResult::success()).await.is_stored());
}

#[tokio::test]
async fn test_malformed_cached_result_warns() {
    let transport = Arc::new(InMemoryTransport::new());
    let root = TempDir::new().unwrap();
    let cache = spawn_cache(&transport, root.path());
    let spawn = s1(root.path());

    let (_guard, mut events) = capture_events();
    let action_key = cache.lookup(&spawn).await.action_key().cloned().unwrap();
    let blob = transport.insert_blob(Bytes::from_static(b"escape"));
    transport.insert_action_result(
        action_key,
        ActionResult {
            output_files: vec![OutputFile {
                path: "../outside.txt".into(),
                digest: Some(blob.to_proto()),
                is_executable: false,
            }],
            ..ActionResult::default()
        },
    );

    let handle = cache.lookup(&spawn).await;
    assert!(matches!(handle.lookup(), Lookup::Error(_)));
    assert_eq!(warnings(&drain(&mut events)), 1);
    assert!(!root.path().parent().unwrap().join("outside.txt").exists());
}

#[tokio::test]
async fn test_cached_tree_escaping_exec_root_warns() {
    let transport = Arc::new(InMemoryTransport::new());
    let sandbox = TempDir::new().unwrap();
    let exec_root = sandbox.path().join("exec");
    std::fs::create_dir_all(&exec_root).unwrap();
    let cache = spawn_cache(&transport, &exec_root);
    let spawn = Spawn::new("Genrule", ["sh", "-c", "mkdir gen"])
        .virtual_input("gen.sh", Bytes::from_static(b"mkdir gen"))
        .output("gen");

    let (_guard, mut events) = capture_events();
    let action_key = cache.lookup(&spawn).await.action_key().cloned().unwrap();
    let blob = transport.insert_blob(Bytes::from_static(b"escaped"));
    let tree = Tree {
        root: Some(Directory {
            files: vec![FileNode {
                name: "../../escaped.txt".into(),
                digest: Some(blob.to_proto()),
                is_executable: false,
            }],
            ..Directory::default()
        }),
        children: Vec::new(),
    };
    let tree_digest = transport.insert_blob(Bytes::from(tree.encode_to_vec()));
    transport.insert_action_result(
        action_key,
        ActionResult {
            output_directories: vec![OutputDirectory {
                path: "gen".into(),
                tree_digest: Some(tree_digest.to_proto()),
            }],
            ..ActionResult::default()
        },
    );
    drain(&mut events);

    let handle = cache.lookup(&spawn).await;
    assert!(matches!(handle.lookup(), Lookup::Error(_)));
    assert_eq!(warnings(&drain(&mut events)), 1);
    assert!(!sandbox.path().join("escaped.txt").exists());
    assert!(!exec_root.join("gen").exists());
}

#[tokio::test]
async fn test_failed_spawn_is_not_uploaded() {
    let transport = Arc::new(InMemoryTransport::new());
    let root = TempDir::new().unwrap();
    let cache = spawn_cache(&transport, root.path());
    let spawn = s1(root.path());

    let handle = cache.lookup(&spawn).await;
    let before = transport.calls();

    let outcome = handle
        .store(&SpawnResult {
            exit_code: 1,
            ..SpawnResult::default()
        })
        .await;

    assert!(matches!(outcome, StoreOutcome::Skipped(_)));
    let after = transport.calls();
    assert_eq!(after.write, before.write);
    assert_eq!(after.find_missing_blobs, before.find_missing_blobs);
    assert_eq!(after.update_action_result, 0);
}

#[tokio::test]
async fn test_store_failure_is_a_warning() {
    let transport = Arc::new(InMemoryTransport::new());
    let root = TempDir::new().unwrap();
    let cache = spawn_cache(&transport, root.path());
    let spawn = s1(root.path());

    let (_guard, mut events) = capture_events();
    let handle = cache.lookup(&spawn).await;
    transport.fail_next_update_action_result(tonic::Status::invalid_argument("rejected"));

    let outcome = handle.store(&SpawnResult::success()).await;
    assert!(matches!(outcome, StoreOutcome::Failed(_)));

    let events = drain(&mut events);
    assert_eq!(warnings(&events), 1);
    assert_eq!(cache.stats().store_failures, 1);
}

#[tokio::test]
async fn test_find_missing_only_sees_spawn_digests() {
    let transport = Arc::new(InMemoryTransport::new());
    let root = TempDir::new().unwrap();
    let cache = spawn_cache(&transport, root.path());
    std::fs::write(root.path().join("main.c"), b"int main() { return 0; }").unwrap();
    let spawn = Spawn::new("CppCompile", ["cc", "-c", "main.c", "-o", "main.o"])
        .env("PATH", "/usr/bin")
        .input_file("main.c")
        .virtual_input("params", Bytes::from_static(b"-O2"))
        .output("main.o");

    let handle = cache.lookup(&spawn).await;
    std::fs::write(root.path().join("main.o"), b"\x7fELF").unwrap();
    assert!(handle.store(&SpawnResult::success()).await.is_stored());

    let tree = MerkleTree::build(&spawn.inputs, &LocalFileReader::new(root.path())).unwrap();
    let command = CommandMapper::map_spawn(&spawn).unwrap();
    let action = ActionBuilder::build_action(&command, tree.root_digest(), spawn.timeout, false);

    let mut expected: HashSet<Digest> = tree.blobs().keys().cloned().collect();
    expected.insert(command.command_digest.clone());
    expected.insert(action.action_digest.clone());
    expected.insert(Digest::from_bytes(b"\x7fELF"));

    let requested: HashSet<Digest> = transport
        .find_missing_requests()
        .into_iter()
        .flatten()
        .collect();
    assert!(!requested.is_empty());
    assert!(
        requested.is_subset(&expected),
        "unexpected digests: {:?}",
        requested.difference(&expected).collect::<Vec<_>>()
    );
    assert_eq!(handle.action_key(), Some(&action.action_digest));
}

#[tokio::test]
async fn test_duplicated_subtree_is_uploaded_once() {
    let transport = Arc::new(InMemoryTransport::new());
    let root = TempDir::new().unwrap();
    let cache = spawn_cache(&transport, root.path());
    let spawn = Spawn::new("Link", ["ld", "-o", "app"])
        .virtual_input("a/dep/x.txt", Bytes::from_static(b"shared"))
        .virtual_input("a/only.txt", Bytes::from_static(b"only in a"))
        .virtual_input("b/dep/x.txt", Bytes::from_static(b"shared"));

    let handle = cache.lookup(&spawn).await;
    assert!(handle.store(&SpawnResult::success()).await.is_stored());

    let writes = transport.writes();
    let written: HashSet<Digest> = writes.iter().map(|w| w.digest.clone()).collect();
    assert_eq!(written.len(), writes.len(), "a blob was written twice");

    let tree = MerkleTree::build(&spawn.inputs, &LocalFileReader::new(root.path())).unwrap();
    assert_eq!(tree.blobs().len(), 6);
    // tree blobs plus the command and action messages
    assert_eq!(writes.len(), tree.blobs().len() + 2);
}

#[tokio::test]
async fn test_second_store_uploads_nothing_new() {
    let transport = Arc::new(InMemoryTransport::new());
    let root = TempDir::new().unwrap();
    let cache = spawn_cache(&transport, root.path());
    let spawn = s1(root.path());

    cache
        .lookup(&spawn)
        .await
        .store(&SpawnResult::success())
        .await;
    let writes = transport.calls().write;

    let handle = cache.lookup(&spawn).await;
    assert!(handle.has_result());
    let other = s1(root.path()).env("CC", "clang");
    cache
        .lookup(&other)
        .await
        .store(&SpawnResult::success())
        .await;

    // Only the new command and action messages are written
    assert_eq!(transport.calls().write, writes + 2);
}

#[tokio::test]
async fn test_dropping_cache_closes_channel_once() {
    let transport = Arc::new(InMemoryTransport::new());
    let root = TempDir::new().unwrap();
    let channel = SharedChannel::new(Arc::clone(&transport) as Arc<dyn CasTransport>);
    let extra = channel.retain().unwrap();
    let cache = SpawnCache::new(RemoteCache::new(channel, config()).unwrap(), root.path());
    assert_eq!(extra.holders(), 3);

    drop(cache);
    assert_eq!(extra.holders(), 1);
    assert_eq!(transport.calls().close, 0);

    extra.release();
    assert_eq!(transport.calls().close, 1);
    assert!(extra.is_closed());
}

#[test]
fn test_lookup_from_blocking_caller() {
    let transport = Arc::new(InMemoryTransport::new());
    let root = TempDir::new().unwrap();

    let outcome = tokio_test::block_on(async {
        let cache = spawn_cache(&transport, root.path());
        let spawn = Spawn::new("Genrule", ["true"]).tag("local");
        let handle = cache.lookup(&spawn).await;
        assert!(!handle.has_result());
        handle.store(&SpawnResult::success()).await
    });

    assert!(matches!(outcome, StoreOutcome::NotCacheable));
    assert_eq!(transport.calls().total_rpcs(), 0);
}
