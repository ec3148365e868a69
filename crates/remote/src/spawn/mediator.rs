//! The spawn cache mediator
//!
//! [`SpawnCache::lookup`] computes a spawn's action key and checks the
//! remote cache. The returned [`CacheHandle`] carries the outcome and, after
//! the spawn has run locally on a miss, [`CacheHandle::store`] uploads its
//! result. This is the only layer that turns remote failures into misses and
//! warnings; a cache failure never fails the build step.

use super::outputs::collect_outputs;
use super::stats::{CacheStats, CacheStatsSnapshot};
use super::{Spawn, SpawnResult};
use crate::cache::{CachedOutputs, RemoteCache, RemoteOutput};
use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};
use crate::mapper::{ActionBuilder, CommandMapper, MappedAction, MappedCommand};
use crate::merkle::{Digest, LocalFileReader, MerkleTree};
use crate::reapi::ActionResult;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stowage_events::{
    MissReason, emit_cache_hit, emit_cache_miss, emit_cache_store_skipped, emit_cache_stored,
    emit_cache_warning,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A usable cached result
#[derive(Debug, Clone)]
pub struct CachedResult {
    /// Action key the result was found under
    pub action_key: Digest,
    /// The result as stored in the action cache
    pub result: ActionResult,
    /// Streams and outputs made available locally
    pub outputs: CachedOutputs,
}

/// Outcome of a lookup
#[derive(Debug)]
pub enum Lookup {
    /// Outputs are in place (or described, in minimal mode)
    Hit(Box<CachedResult>),
    /// Run the spawn locally
    Miss(MissReason),
    /// The lookup failed; run the spawn locally. A warning was emitted
    /// unless the failure was a cancellation.
    Error(RemoteError),
}

impl Lookup {
    /// Whether a cached result is available
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    /// The cached result, if any
    pub fn hit(&self) -> Option<&CachedResult> {
        match self {
            Self::Hit(hit) => Some(hit),
            _ => None,
        }
    }

    /// Why the spawn must run locally, or `None` on a hit
    pub fn miss_reason(&self) -> Option<MissReason> {
        match self {
            Self::Hit(_) => None,
            Self::Miss(reason) => Some(*reason),
            Self::Error(_) => Some(MissReason::Error),
        }
    }
}

/// Outcome of [`CacheHandle::store`]
#[derive(Debug)]
pub enum StoreOutcome {
    /// The result is recorded under this action key
    Stored(Digest),
    /// Uploading failed; a warning was emitted unless cancelled
    Failed(RemoteError),
    /// The spawn may not be cached remotely; nothing was sent
    NotCacheable,
    /// Nothing was stored, for the given reason
    Skipped(&'static str),
}

impl StoreOutcome {
    /// Whether the result was recorded
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored(_))
    }
}

#[derive(Debug)]
struct PreparedAction {
    tree: MerkleTree,
    command: MappedCommand,
    action: MappedAction,
}

#[derive(Debug)]
struct Inner {
    cache: RemoteCache,
    exec_root: PathBuf,
    stats: CacheStats,
    shutdown: CancellationToken,
}

/// Remote caching for spawns run under one exec root
#[derive(Debug, Clone)]
pub struct SpawnCache {
    inner: Arc<Inner>,
}

impl SpawnCache {
    /// Wrap `cache` for spawns whose paths are relative to `exec_root`
    pub fn new(cache: RemoteCache, exec_root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                exec_root: exec_root.into(),
                stats: CacheStats::default(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Connect to the configured endpoint
    ///
    /// # Errors
    ///
    /// As [`RemoteCache::connect`].
    pub async fn connect(config: RemoteConfig, exec_root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::new(RemoteCache::connect(config).await?, exec_root))
    }

    /// The underlying remote cache
    pub fn remote(&self) -> &RemoteCache {
        &self.inner.cache
    }

    /// Root the spawn paths are resolved against
    pub fn exec_root(&self) -> &Path {
        &self.inner.exec_root
    }

    /// Check the remote cache for `spawn`
    ///
    /// Non-cacheable spawns are answered without touching the network. An
    /// orphaned result (one referencing evicted blobs) is a quiet miss; any
    /// other failure is a miss with a warning.
    pub async fn lookup(&self, spawn: &Spawn) -> CacheHandle {
        let label = spawn.describe();
        let config = self.inner.cache.config();

        if !spawn.is_remotely_cacheable() {
            return self.miss(spawn, label, MissReason::NotCacheable, None);
        }
        if !config.accept_cached && !config.upload_local_results {
            return self.miss(spawn, label, MissReason::Disabled, None);
        }

        let prepared = match self.prepare(spawn).await {
            Ok(prepared) => prepared,
            Err(e) => {
                emit_cache_warning!(label, format!("Remote cache lookup failed: {e}"));
                emit_cache_miss!(label, MissReason::Error);
                self.inner.stats.record_lookup_error();
                return self.handle(spawn, label, Lookup::Error(e), None);
            }
        };

        if !config.accept_cached {
            return self.miss(spawn, label, MissReason::Disabled, Some(prepared));
        }

        let action_key = prepared.action.action_digest.clone();
        let cancel = self.inner.shutdown.child_token();
        let lookup = match self.fetch(&action_key, &cancel).await {
            Ok(Some(hit)) => {
                emit_cache_hit!(label, action_key);
                self.inner.stats.record_hit();
                Lookup::Hit(Box::new(hit))
            }
            Ok(None) => {
                emit_cache_miss!(label, MissReason::NotFound);
                self.inner.stats.record_miss();
                Lookup::Miss(MissReason::NotFound)
            }
            Err(e) if e.is_cache_not_found() => {
                debug!(spawn = %label, action = %action_key, error = %e, "Cached result references evicted blobs");
                emit_cache_miss!(label, MissReason::Orphaned);
                self.inner.stats.record_orphaned();
                Lookup::Miss(MissReason::Orphaned)
            }
            Err(e) => {
                if e.is_cancelled() {
                    debug!(spawn = %label, "Remote cache lookup cancelled");
                } else {
                    emit_cache_warning!(label, format!("Remote cache lookup failed: {e}"));
                }
                emit_cache_miss!(label, MissReason::Error);
                self.inner.stats.record_lookup_error();
                Lookup::Error(e)
            }
        };

        self.handle(spawn, label, lookup, Some(prepared))
    }

    fn miss(
        &self,
        spawn: &Spawn,
        label: String,
        reason: MissReason,
        prepared: Option<PreparedAction>,
    ) -> CacheHandle {
        emit_cache_miss!(label, reason);
        self.inner.stats.record_miss();
        self.handle(spawn, label, Lookup::Miss(reason), prepared)
    }

    fn handle(
        &self,
        spawn: &Spawn,
        label: String,
        lookup: Lookup,
        prepared: Option<PreparedAction>,
    ) -> CacheHandle {
        CacheHandle {
            inner: Arc::clone(&self.inner),
            spawn: spawn.clone(),
            label,
            lookup,
            prepared,
        }
    }

    /// Hash the inputs and derive the action key
    async fn prepare(&self, spawn: &Spawn) -> Result<PreparedAction> {
        let inputs = spawn.inputs.clone();
        let reader = LocalFileReader::new(self.inner.exec_root.clone());
        let tree = tokio::task::spawn_blocking(move || MerkleTree::build(&inputs, &reader))
            .await
            .map_err(|e| RemoteError::merkle_error(format!("input tree task failed: {e}")))??;

        let command = CommandMapper::map_spawn(spawn)?;
        let action = ActionBuilder::build_action(
            &command,
            tree.root_digest(),
            spawn.timeout,
            !spawn.is_remotely_cacheable(),
        );
        debug!(
            spawn = %spawn.describe(),
            action = %action.action_digest,
            input_root = %tree.root_digest(),
            "Computed action key"
        );
        Ok(PreparedAction {
            tree,
            command,
            action,
        })
    }

    async fn fetch(
        &self,
        action_key: &Digest,
        cancel: &CancellationToken,
    ) -> Result<Option<CachedResult>> {
        let cache = &self.inner.cache;
        let Some(result) = cache.get_action_result(action_key).await? else {
            return Ok(None);
        };
        if result.exit_code != 0 {
            debug!(action = %action_key, exit_code = result.exit_code, "Ignoring cached failure");
            return Ok(None);
        }

        let outputs = cache
            .download(
                &result,
                &self.inner.exec_root,
                cache.config().download_outputs,
                cancel,
            )
            .await?;
        Ok(Some(CachedResult {
            action_key: action_key.clone(),
            result,
            outputs,
        }))
    }

    /// Materialize one output recorded by a minimal-mode hit
    ///
    /// # Errors
    ///
    /// Returns `CacheNotFound` if the blob was evicted after the hit; callers
    /// treat that as a miss for the spawn that produced it.
    pub async fn fetch_output(&self, output: &RemoteOutput) -> Result<()> {
        let cancel = self.inner.shutdown.child_token();
        self.inner
            .cache
            .fetch_output(output, &self.inner.exec_root, &cancel)
            .await
    }

    /// Current counters
    pub fn stats(&self) -> CacheStatsSnapshot {
        let uploader = self.inner.cache.uploader();
        self.inner
            .stats
            .set_transferred(uploader.bytes_uploaded(), uploader.bytes_downloaded());
        self.inner.stats.snapshot()
    }

    /// Log the counters at info level
    pub fn log_summary(&self) {
        let stats = self.stats();
        info!(
            hits = stats.hits,
            misses = stats.misses,
            orphaned = stats.orphaned,
            lookup_errors = stats.lookup_errors,
            stores = stats.stores,
            store_failures = stats.store_failures,
            bytes_uploaded = stats.bytes_uploaded,
            bytes_downloaded = stats.bytes_downloaded,
            "Remote cache summary"
        );
    }

    /// Cancel every in-flight lookup, store and transfer
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.cache.shutdown();
    }
}

/// Lookup outcome for one spawn, used to store its local result on a miss
#[derive(Debug)]
pub struct CacheHandle {
    inner: Arc<Inner>,
    spawn: Spawn,
    label: String,
    lookup: Lookup,
    prepared: Option<PreparedAction>,
}

impl CacheHandle {
    /// Whether the lookup produced a usable result
    pub fn has_result(&self) -> bool {
        self.lookup.is_hit()
    }

    /// The cached result, if any
    pub fn result(&self) -> Option<&CachedResult> {
        self.lookup.hit()
    }

    /// The full lookup outcome
    pub fn lookup(&self) -> &Lookup {
        &self.lookup
    }

    /// Consume the handle, keeping the lookup outcome
    pub fn into_lookup(self) -> Lookup {
        self.lookup
    }

    /// Action key computed for the spawn, if inputs could be hashed
    pub fn action_key(&self) -> Option<&Digest> {
        self.prepared.as_ref().map(|p| &p.action.action_digest)
    }

    /// Upload the result of running the spawn locally
    ///
    /// Nothing is sent for non-cacheable spawns, failed runs, or when
    /// uploads are disabled. Failures become warnings.
    pub async fn store(&self, result: &SpawnResult) -> StoreOutcome {
        let label = &self.label;

        if !self.spawn.is_remotely_cacheable() {
            emit_cache_store_skipped!(label, "not cacheable");
            return StoreOutcome::NotCacheable;
        }
        if !self.inner.cache.config().upload_local_results {
            emit_cache_store_skipped!(label, "uploads disabled");
            return StoreOutcome::Skipped("uploads disabled");
        }
        if !result.is_success() {
            emit_cache_store_skipped!(label, format!("exit code {}", result.exit_code));
            return StoreOutcome::Skipped("non-zero exit code");
        }
        let Some(prepared) = &self.prepared else {
            emit_cache_store_skipped!(label, "no action key");
            return StoreOutcome::Skipped("no action key");
        };

        let action_key = &prepared.action.action_digest;
        match self.upload(prepared, result).await {
            Ok(()) => {
                emit_cache_stored!(label, action_key);
                self.inner.stats.record_store();
                StoreOutcome::Stored(action_key.clone())
            }
            Err(e) => {
                if e.is_cancelled() {
                    debug!(spawn = %label, "Remote cache upload cancelled");
                } else {
                    emit_cache_warning!(label, format!("Remote cache upload failed: {e}"));
                }
                self.inner.stats.record_store_failure();
                StoreOutcome::Failed(e)
            }
        }
    }

    async fn upload(&self, prepared: &PreparedAction, result: &SpawnResult) -> Result<()> {
        let cache = &self.inner.cache;
        let cancel = self.inner.shutdown.child_token();

        let exec_root = self.inner.exec_root.clone();
        let declared = self.spawn.outputs.clone();
        let outputs = tokio::task::spawn_blocking(move || collect_outputs(&exec_root, &declared))
            .await
            .map_err(|e| RemoteError::merkle_error(format!("output collection task failed: {e}")))??;

        let mut blobs: HashMap<Digest, Bytes> = outputs.blobs;
        blobs.insert(
            prepared.command.command_digest.clone(),
            prepared.command.command_bytes.clone(),
        );
        blobs.insert(
            prepared.action.action_digest.clone(),
            prepared.action.action_bytes.clone(),
        );
        let stdout_digest = stream_blob(&result.stdout, &mut blobs);
        let stderr_digest = stream_blob(&result.stderr, &mut blobs);

        let uploaded = cache.upload_tree(&prepared.tree, blobs, &cancel).await?;
        debug!(spawn = %self.label, uploaded, "Uploaded missing blobs");

        let action_result = ActionResult {
            output_files: outputs.files,
            output_directories: outputs.directories,
            exit_code: result.exit_code,
            stdout_digest,
            stderr_digest,
            ..ActionResult::default()
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(RemoteError::cancelled("UpdateActionResult")),
            stored = cache.update_action_result(&prepared.action.action_digest, action_result) => {
                stored.map(|_| ())
            }
        }
    }
}

/// Register a captured stream as a blob; empty streams carry no digest
fn stream_blob(
    data: &Bytes,
    blobs: &mut HashMap<Digest, Bytes>,
) -> Option<crate::reapi::Digest> {
    if data.is_empty() {
        return None;
    }
    let digest = Digest::from_bytes(data);
    let proto = digest.to_proto();
    blobs.insert(digest, data.clone());
    Some(proto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CasTransport, InMemoryTransport, SharedChannel};
    use crate::config::{DownloadMode, RetryConfig};

    fn spawn_cache(
        transport: &Arc<InMemoryTransport>,
        exec_root: &Path,
        config: RemoteConfig,
    ) -> SpawnCache {
        let config = RemoteConfig {
            retry: RetryConfig {
                max_attempts: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 1,
                ..RetryConfig::default()
            },
            ..config
        };
        let channel = SharedChannel::new(Arc::clone(transport) as Arc<dyn CasTransport>);
        SpawnCache::new(RemoteCache::new(channel, config).unwrap(), exec_root)
    }

    fn genrule() -> Spawn {
        Spawn::new("Genrule", ["sh", "-c", "cp a.txt out.txt"])
            .virtual_input("a.txt", Bytes::from_static(b"xyz"))
            .output("out.txt")
    }

    #[tokio::test]
    async fn test_store_then_hit() {
        let transport = Arc::new(InMemoryTransport::new());
        let root = tempfile::tempdir().unwrap();
        let cache = spawn_cache(&transport, root.path(), RemoteConfig::default());

        let handle = cache.lookup(&genrule()).await;
        assert_eq!(handle.lookup().miss_reason(), Some(MissReason::NotFound));

        std::fs::write(root.path().join("out.txt"), b"xyz").unwrap();
        let outcome = handle.store(&SpawnResult::success()).await;
        assert!(outcome.is_stored());

        std::fs::remove_file(root.path().join("out.txt")).unwrap();
        let handle = cache.lookup(&genrule()).await;
        assert!(handle.has_result());
        assert_eq!(std::fs::read(root.path().join("out.txt")).unwrap(), b"xyz");

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.stores), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_lookup_disabled_still_stores() {
        let transport = Arc::new(InMemoryTransport::new());
        let root = tempfile::tempdir().unwrap();
        let config = RemoteConfig {
            accept_cached: false,
            ..RemoteConfig::default()
        };
        let cache = spawn_cache(&transport, root.path(), config);

        let handle = cache.lookup(&genrule()).await;
        assert_eq!(handle.lookup().miss_reason(), Some(MissReason::Disabled));
        assert_eq!(transport.calls().get_action_result, 0);

        std::fs::write(root.path().join("out.txt"), b"xyz").unwrap();
        assert!(handle.store(&SpawnResult::success()).await.is_stored());
        assert_eq!(transport.calls().update_action_result, 1);
    }

    #[tokio::test]
    async fn test_uploads_disabled() {
        let transport = Arc::new(InMemoryTransport::new());
        let root = tempfile::tempdir().unwrap();
        let config = RemoteConfig {
            upload_local_results: false,
            ..RemoteConfig::default()
        };
        let cache = spawn_cache(&transport, root.path(), config);

        let handle = cache.lookup(&genrule()).await;
        let before = transport.calls().total_rpcs();
        let outcome = handle.store(&SpawnResult::success()).await;
        assert!(matches!(outcome, StoreOutcome::Skipped(_)));
        assert_eq!(transport.calls().total_rpcs(), before);
    }

    #[tokio::test]
    async fn test_unreadable_input_is_a_lookup_error() {
        let transport = Arc::new(InMemoryTransport::new());
        let root = tempfile::tempdir().unwrap();
        let cache = spawn_cache(&transport, root.path(), RemoteConfig::default());

        let spawn = Spawn::new("Compile", ["cc", "missing.c"]).input_file("missing.c");
        let handle = cache.lookup(&spawn).await;
        assert!(matches!(handle.lookup(), Lookup::Error(RemoteError::IoError { .. })));
        assert!(handle.action_key().is_none());
        assert_eq!(transport.calls().total_rpcs(), 0);

        let outcome = handle.store(&SpawnResult::success()).await;
        assert!(matches!(outcome, StoreOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn test_cached_failure_is_a_miss() {
        let transport = Arc::new(InMemoryTransport::new());
        let root = tempfile::tempdir().unwrap();
        let cache = spawn_cache(&transport, root.path(), RemoteConfig::default());

        let key = cache.lookup(&genrule()).await.action_key().cloned().unwrap();
        transport.insert_action_result(
            key,
            ActionResult {
                exit_code: 2,
                ..ActionResult::default()
            },
        );
        let handle = cache.lookup(&genrule()).await;
        assert_eq!(handle.lookup().miss_reason(), Some(MissReason::NotFound));
    }

    #[tokio::test]
    async fn test_minimal_hit_leaves_outputs_remote() {
        let transport = Arc::new(InMemoryTransport::new());
        let root = tempfile::tempdir().unwrap();
        let config = RemoteConfig {
            download_outputs: DownloadMode::Minimal,
            ..RemoteConfig::default()
        };
        let cache = spawn_cache(&transport, root.path(), config);

        let handle = cache.lookup(&genrule()).await;
        std::fs::write(root.path().join("out.txt"), b"xyz").unwrap();
        assert!(handle.store(&SpawnResult::success()).await.is_stored());
        std::fs::remove_file(root.path().join("out.txt")).unwrap();

        let handle = cache.lookup(&genrule()).await;
        let hit = handle.result().unwrap();
        let remote = hit.outputs.remote.as_ref().unwrap();
        assert!(!root.path().join("out.txt").exists());

        cache
            .fetch_output(remote.get(Path::new("out.txt")).unwrap())
            .await
            .unwrap();
        assert_eq!(std::fs::read(root.path().join("out.txt")).unwrap(), b"xyz");
    }

    #[tokio::test]
    async fn test_shutdown_turns_store_into_failure() {
        let transport = Arc::new(InMemoryTransport::new());
        let root = tempfile::tempdir().unwrap();
        let cache = spawn_cache(&transport, root.path(), RemoteConfig::default());

        let handle = cache.lookup(&genrule()).await;
        cache.shutdown();
        std::fs::write(root.path().join("out.txt"), b"xyz").unwrap();

        let outcome = handle.store(&SpawnResult::success()).await;
        match outcome {
            StoreOutcome::Failed(e) => assert!(e.is_cancelled(), "{e}"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(transport.calls().update_action_result, 0);
        assert_eq!(cache.stats().store_failures, 1);
    }
}
