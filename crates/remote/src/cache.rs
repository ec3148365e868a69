//! Remote cache operations over CAS, ByteStream and ActionCache
//!
//! [`RemoteCache`] never turns failures into misses. Everything is
//! propagated so the spawn cache mediator can tell an evicted blob
//! (`CacheNotFound`) apart from a broken endpoint.

use crate::client::{ByteStreamUploader, CasTransport, GrpcTransport, ResourceNames, SharedChannel};
use crate::config::{DownloadMode, RemoteConfig};
use crate::error::{RemoteError, Result};
use crate::merkle::{Digest, MerkleTree, TreeLayout};
use crate::reapi::{self, ActionResult};
use crate::retry::Retrier;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use prost::Message;
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Tag and length prefix of one repeated digest field, plus slack for the
/// request envelope
const DIGEST_FIELD_OVERHEAD: usize = 4;
const REQUEST_OVERHEAD: usize = 64;

/// An output file known only by digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    /// Path relative to the exec root
    pub path: PathBuf,
    /// Content digest
    pub digest: Digest,
    /// Executable bit
    pub is_executable: bool,
}

/// Outputs of a cached result that have not been written locally
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutputs {
    /// Every output file, including files inside output directories
    pub files: Vec<RemoteOutput>,
    /// Directories to create, including empty ones
    pub directories: Vec<PathBuf>,
}

impl RemoteOutputs {
    /// Look up an output by path
    pub fn get(&self, path: &Path) -> Option<&RemoteOutput> {
        self.files.iter().find(|output| output.path == path)
    }

    /// Distinct non-empty digests referenced by the outputs
    pub fn digests(&self) -> Vec<Digest> {
        let mut seen = HashSet::new();
        self.files
            .iter()
            .filter(|output| !output.digest.is_empty() && seen.insert(output.digest.clone()))
            .map(|output| output.digest.clone())
            .collect()
    }
}

/// What a cache hit hands back to the caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedOutputs {
    /// Exit code recorded with the result
    pub exit_code: i32,
    /// Standard output of the cached run
    pub stdout: Bytes,
    /// Standard error of the cached run
    pub stderr: Bytes,
    /// Set in minimal mode; the outputs still live only in the CAS
    pub remote: Option<RemoteOutputs>,
}

/// Client for one remote cache endpoint
pub struct RemoteCache {
    channel: SharedChannel,
    uploader: ByteStreamUploader,
    retrier: Retrier,
    names: ResourceNames,
    config: Arc<RemoteConfig>,
}

impl std::fmt::Debug for RemoteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCache")
            .field("endpoint", &self.config.endpoint)
            .field("instance_name", &self.names.instance_name())
            .field("retrier", &self.retrier)
            .finish_non_exhaustive()
    }
}

impl RemoteCache {
    /// Connect to `config.endpoint` over gRPC
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for an invalid config and `ConnectionFailed` if
    /// the endpoint cannot be reached.
    pub async fn connect(config: RemoteConfig) -> Result<Self> {
        config.validate()?;
        let transport = GrpcTransport::connect(&config).await?;
        Self::new(SharedChannel::new(Arc::new(transport)), config)
    }

    /// Create a cache over `channel`, retrying per `config.retry`
    ///
    /// The cache keeps `channel` and gives the uploader a second holder.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for an invalid config and `ChannelClosed` if the
    /// channel was already closed.
    pub fn new(channel: SharedChannel, config: RemoteConfig) -> Result<Self> {
        config.validate()?;
        let retrier = Retrier::new(&config.retry, Some(config.rpc_timeout()));
        Self::with_retrier(channel, config, retrier)
    }

    /// Create a cache with an explicit retrier
    ///
    /// # Errors
    ///
    /// Returns `ChannelClosed` if the channel was already closed.
    pub fn with_retrier(channel: SharedChannel, config: RemoteConfig, retrier: Retrier) -> Result<Self> {
        let uploader = ByteStreamUploader::new(channel.retain()?, &config, retrier.clone());
        Ok(Self {
            names: ResourceNames::new(config.instance_name.clone()),
            channel,
            uploader,
            retrier,
            config: Arc::new(config),
        })
    }

    /// Configuration in effect
    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// The blob uploader
    pub fn uploader(&self) -> &ByteStreamUploader {
        &self.uploader
    }

    /// The channel handle held by this cache
    pub fn channel(&self) -> &SharedChannel {
        &self.channel
    }

    /// Digests from `digests` that the CAS reports absent
    ///
    /// Duplicates and the empty digest are dropped before asking. Requests
    /// are split so that none exceeds `max_batch_request_bytes`.
    ///
    /// # Errors
    ///
    /// Propagates the first failed batch.
    #[instrument(skip_all)]
    pub async fn find_missing(
        &self,
        digests: impl IntoIterator<Item = Digest>,
    ) -> Result<HashSet<Digest>> {
        let mut requested = HashSet::new();
        let unique: Vec<Digest> = digests
            .into_iter()
            .filter(|digest| !digest.is_empty() && requested.insert(digest.clone()))
            .collect();
        if unique.is_empty() {
            return Ok(HashSet::new());
        }

        let batches = self.batches(unique);
        debug!(batches = batches.len(), digests = requested.len(), "Querying missing blobs");

        let instance_name = self.names.instance_name();
        let responses: Vec<Vec<Digest>> = futures::stream::iter(batches)
            .map(|batch| {
                self.retrier
                    .execute("ContentAddressableStorage.FindMissingBlobs", move |_| {
                        self.channel.find_missing_blobs(instance_name, batch.clone())
                    })
            })
            .buffer_unordered(self.config.max_concurrent_transfers)
            .try_collect()
            .await?;

        Ok(responses
            .into_iter()
            .flatten()
            .filter(|digest| requested.contains(digest))
            .collect())
    }

    fn batches(&self, digests: Vec<Digest>) -> Vec<Vec<Digest>> {
        let limit = self
            .config
            .max_batch_request_bytes
            .saturating_sub(REQUEST_OVERHEAD + self.names.instance_name().len());
        let mut batches = Vec::new();
        let mut current = Vec::new();
        let mut current_size = 0;

        for digest in digests {
            let size = digest.to_proto().encoded_len() + DIGEST_FIELD_OVERHEAD;
            if !current.is_empty() && current_size + size > limit {
                batches.push(std::mem::take(&mut current));
                current_size = 0;
            }
            current_size += size;
            current.push(digest);
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    /// Upload the blobs the CAS does not already have
    ///
    /// Returns how many blobs were transferred.
    ///
    /// # Errors
    ///
    /// Propagates `find_missing` failures and the first failed upload.
    pub async fn upload_blobs(
        &self,
        blobs: HashMap<Digest, Bytes>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let missing = self.find_missing(blobs.keys().cloned()).await?;
        if missing.is_empty() {
            debug!("All blobs already in CAS");
            return Ok(0);
        }

        debug!(missing = missing.len(), "Uploading missing blobs");
        let uploaded: Vec<Digest> = futures::stream::iter(
            blobs
                .into_iter()
                .filter(|(digest, _)| missing.contains(digest)),
        )
        .map(|(digest, data)| async move {
            self.uploader
                .upload_cancellable(&digest, data, cancel)
                .await
        })
        .buffer_unordered(self.config.max_concurrent_transfers)
        .try_collect()
        .await?;
        Ok(uploaded.len())
    }

    /// Upload every directory and file blob of `tree` missing from the CAS
    ///
    /// `extra` carries blobs that belong with the tree but are not part of it,
    /// such as the command and action messages.
    ///
    /// # Errors
    ///
    /// As [`RemoteCache::upload_blobs`].
    pub async fn upload_tree(
        &self,
        tree: &MerkleTree,
        extra: HashMap<Digest, Bytes>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut blobs = tree.blobs().clone();
        blobs.extend(extra);
        self.upload_blobs(blobs, cancel).await
    }

    /// Look up an action result; `None` is a plain miss
    ///
    /// # Errors
    ///
    /// Propagates RPC failures once retries are spent.
    #[instrument(skip(self, action_digest), fields(action = %action_digest))]
    pub async fn get_action_result(&self, action_digest: &Digest) -> Result<Option<ActionResult>> {
        let instance_name = self.names.instance_name();
        self.retrier
            .execute("ActionCache.GetActionResult", |_| {
                self.channel.get_action_result(instance_name, action_digest)
            })
            .await
    }

    /// Record `result` under `action_digest`
    ///
    /// Every blob `result` references must already be in the CAS.
    ///
    /// # Errors
    ///
    /// Propagates RPC failures once retries are spent.
    #[instrument(skip(self, action_digest, result), fields(action = %action_digest))]
    pub async fn update_action_result(
        &self,
        action_digest: &Digest,
        result: ActionResult,
    ) -> Result<ActionResult> {
        let instance_name = self.names.instance_name();
        self.retrier
            .execute("ActionCache.UpdateActionResult", |_| {
                self.channel
                    .update_action_result(instance_name, action_digest, result.clone())
            })
            .await
    }

    /// Make the outputs of `result` available under `root`
    ///
    /// With [`DownloadMode::All`] every output blob is fetched and verified
    /// before the first file is written, so a missing blob leaves `root`
    /// untouched. With [`DownloadMode::Minimal`] the output blobs are only
    /// checked for presence and described in [`CachedOutputs::remote`].
    ///
    /// # Errors
    ///
    /// Returns `CacheNotFound` if any referenced blob is absent,
    /// `Cancelled` if `cancel` fires and `IoError` if writing fails.
    #[instrument(skip_all, fields(root = %root.display(), mode = ?mode))]
    pub async fn download(
        &self,
        result: &ActionResult,
        root: &Path,
        mode: DownloadMode,
        cancel: &CancellationToken,
    ) -> Result<CachedOutputs> {
        let outputs = self.resolve_outputs(result, cancel).await?;
        let stdout = self
            .stream_contents(&result.stdout_raw, result.stdout_digest.as_ref(), cancel)
            .await?;
        let stderr = self
            .stream_contents(&result.stderr_raw, result.stderr_digest.as_ref(), cancel)
            .await?;

        let remote = match mode {
            DownloadMode::All => {
                let contents = self.fetch_all(&outputs.digests(), cancel).await?;
                write_outputs(&outputs, &contents, root).await?;
                None
            }
            DownloadMode::Minimal => {
                let missing = self.find_missing(outputs.digests()).await?;
                if let Some(digest) = missing.into_iter().next() {
                    return Err(RemoteError::cache_not_found(digest));
                }
                Some(outputs)
            }
        };

        Ok(CachedOutputs {
            exit_code: result.exit_code,
            stdout,
            stderr,
            remote,
        })
    }

    /// Fetch and write one output recorded by a minimal-mode hit
    ///
    /// # Errors
    ///
    /// Returns `CacheNotFound` if the blob has been evicted since the hit.
    pub async fn fetch_output(
        &self,
        output: &RemoteOutput,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let data = self
            .uploader
            .download_cancellable(&output.digest, cancel)
            .await?;
        write_file(&root.join(&output.path), &data, output.is_executable).await
    }

    /// Flatten output files and output directory trees into paths
    async fn resolve_outputs(
        &self,
        result: &ActionResult,
        cancel: &CancellationToken,
    ) -> Result<RemoteOutputs> {
        let mut outputs = RemoteOutputs::default();

        for file in &result.output_files {
            outputs.files.push(RemoteOutput {
                path: relative_output_path(&file.path)?,
                digest: Digest::from_proto_field(file.digest.as_ref(), &file.path)?,
                is_executable: file.is_executable,
            });
        }

        for dir in &result.output_directories {
            let base = relative_output_path(&dir.path)?;
            let tree_digest = Digest::from_proto_field(dir.tree_digest.as_ref(), &dir.path)?;
            let blob = self
                .uploader
                .download_cancellable(&tree_digest, cancel)
                .await?;
            let layout = TreeLayout::from_tree(&reapi::Tree::decode(blob)?)?;

            outputs.directories.push(base.clone());
            outputs
                .directories
                .extend(layout.empty_directories.iter().map(|path| base.join(path)));
            outputs
                .files
                .extend(layout.files.into_iter().map(|(path, file)| RemoteOutput {
                    path: base.join(path),
                    digest: file.digest,
                    is_executable: file.is_executable,
                }));
        }

        Ok(outputs)
    }

    async fn stream_contents(
        &self,
        raw: &[u8],
        digest: Option<&reapi::Digest>,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        if !raw.is_empty() {
            return Ok(Bytes::copy_from_slice(raw));
        }
        match digest {
            Some(digest) => {
                let digest = Digest::try_from(digest)?;
                self.uploader.download_cancellable(&digest, cancel).await
            }
            None => Ok(Bytes::new()),
        }
    }

    async fn fetch_all(
        &self,
        digests: &[Digest],
        cancel: &CancellationToken,
    ) -> Result<HashMap<Digest, Bytes>> {
        futures::stream::iter(digests)
            .map(|digest| async move {
                let data = self.uploader.download_cancellable(digest, cancel).await?;
                Ok::<_, RemoteError>((digest.clone(), data))
            })
            .buffer_unordered(self.config.max_concurrent_transfers)
            .try_collect()
            .await
    }

    /// Stop every in-flight transfer
    pub fn shutdown(&self) {
        self.uploader.shutdown();
    }
}

/// Reject server-provided output paths that would escape the exec root
fn relative_output_path(path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);
    let escapes = candidate
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if path.is_empty() || escapes {
        return Err(RemoteError::merkle_error(format!(
            "output path {path:?} is not a relative path inside the exec root"
        )));
    }
    Ok(candidate.to_path_buf())
}

async fn write_outputs(
    outputs: &RemoteOutputs,
    contents: &HashMap<Digest, Bytes>,
    root: &Path,
) -> Result<()> {
    for dir in &outputs.directories {
        let path = root.join(dir);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| RemoteError::io_error(format!("create {}", path.display()), e))?;
    }
    for output in &outputs.files {
        let data = if output.digest.is_empty() {
            Bytes::new()
        } else {
            contents
                .get(&output.digest)
                .cloned()
                .ok_or_else(|| RemoteError::cache_not_found(&output.digest))?
        };
        write_file(&root.join(&output.path), &data, output.is_executable).await?;
    }
    Ok(())
}

async fn write_file(path: &Path, data: &[u8], is_executable: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RemoteError::io_error(format!("create {}", parent.display()), e))?;
    }
    tokio::fs::write(path, data)
        .await
        .map_err(|e| RemoteError::io_error(format!("write {}", path.display()), e))?;
    set_executable(path, is_executable).await
}

#[cfg(unix)]
async fn set_executable(path: &Path, is_executable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if is_executable { 0o755 } else { 0o644 };
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| RemoteError::io_error(format!("chmod {}", path.display()), e))
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path, _is_executable: bool) -> Result<()> {
    Ok(())
}
