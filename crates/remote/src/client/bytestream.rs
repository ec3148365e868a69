//! ByteStream blob transfers
//!
//! [`ByteStreamUploader`] streams blobs to and from the CAS in chunks under
//! the [`Retrier`]. At most one write per digest is in flight: later callers
//! attach to the running transfer and observe its outcome. Interrupted
//! writes resume from the size the server reports as committed, and
//! interrupted reads resume from the bytes already received.

use crate::chunker::Chunker;
use crate::client::channel::SharedChannel;
use crate::client::resource::ResourceNames;
use crate::client::transport::{CasTransport, WriteChunk};
use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};
use crate::merkle::Digest;
use crate::retry::Retrier;
use bytes::{Bytes, BytesMut};
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use uuid::Uuid;

type TransferOutcome = std::result::Result<(), Arc<RemoteError>>;
type SharedTransfer = Shared<BoxFuture<'static, TransferOutcome>>;

struct InFlight {
    id: u64,
    result: SharedTransfer,
    cancel: CancellationToken,
    waiters: usize,
}

type Registry = Arc<Mutex<HashMap<Digest, InFlight>>>;

fn lock(registry: &Mutex<HashMap<Digest, InFlight>>) -> MutexGuard<'_, HashMap<Digest, InFlight>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    channel: SharedChannel,
    names: ResourceNames,
    retrier: Retrier,
    chunk_size: usize,
    limiter: Semaphore,
    in_flight: Registry,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    bytes_uploaded: AtomicU64,
    bytes_downloaded: AtomicU64,
}

/// Chunked, resumable, deduplicating blob transfers
#[derive(Clone)]
pub struct ByteStreamUploader {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ByteStreamUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStreamUploader")
            .field("chunk_size", &self.inner.chunk_size)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// Detaches a caller from a shared transfer when its future completes or
/// is dropped; the last caller to leave cancels an unfinished transfer
struct WaiterGuard {
    registry: Registry,
    digest: Digest,
    id: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let mut registry = lock(&self.registry);
        let Some(entry) = registry.get_mut(&self.digest) else {
            return;
        };
        if entry.id != self.id {
            return;
        }
        entry.waiters = entry.waiters.saturating_sub(1);
        if entry.waiters == 0 {
            debug!(digest = %self.digest, "Last waiter left, cancelling upload");
            entry.cancel.cancel();
            registry.remove(&self.digest);
        }
    }
}

impl ByteStreamUploader {
    /// Create an uploader over its own holder of `channel`
    pub fn new(channel: SharedChannel, config: &RemoteConfig, retrier: Retrier) -> Self {
        Self {
            inner: Arc::new(Inner {
                channel,
                names: ResourceNames::new(config.instance_name.clone()),
                retrier,
                chunk_size: config.chunk_size,
                limiter: Semaphore::new(config.max_concurrent_transfers.max(1)),
                in_flight: Arc::new(Mutex::new(HashMap::new())),
                next_id: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                bytes_uploaded: AtomicU64::new(0),
                bytes_downloaded: AtomicU64::new(0),
            }),
        }
    }

    /// Upload a blob, returning its digest
    ///
    /// # Errors
    ///
    /// Returns `UploadFailed` carrying the shared cause if the transfer fails.
    pub async fn upload(&self, data: Bytes) -> Result<Digest> {
        let digest = Digest::from_bytes(&data);
        self.upload_blob(&digest, data).await
    }

    /// Upload a blob whose digest is already known
    ///
    /// # Errors
    ///
    /// As [`ByteStreamUploader::upload`].
    pub async fn upload_blob(&self, digest: &Digest, data: Bytes) -> Result<Digest> {
        self.upload_cancellable(digest, data, &CancellationToken::new())
            .await
    }

    /// Upload a blob, giving up as soon as `cancel` fires
    ///
    /// If another caller is already uploading `digest`, this attaches to that
    /// transfer. The transfer itself is cancelled only when every attached
    /// caller has gone.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires first, otherwise as
    /// [`ByteStreamUploader::upload`].
    pub async fn upload_cancellable(
        &self,
        digest: &Digest,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Digest> {
        if digest.is_empty() {
            return Ok(digest.clone());
        }

        let (id, transfer) = self.attach(digest, data);
        let _guard = WaiterGuard {
            registry: Arc::clone(&self.inner.in_flight),
            digest: digest.clone(),
            id,
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(RemoteError::cancelled(format!("upload of {digest}"))),
            outcome = transfer => outcome
                .map(|()| digest.clone())
                .map_err(|source| RemoteError::UploadFailed {
                    digest: digest.to_string(),
                    source,
                }),
        }
    }

    /// Join the in-flight transfer for `digest` or start one
    fn attach(&self, digest: &Digest, data: Bytes) -> (u64, SharedTransfer) {
        let mut registry = lock(&self.inner.in_flight);
        if let Some(entry) = registry.get_mut(digest) {
            entry.waiters += 1;
            debug!(digest = %digest, waiters = entry.waiters, "Joining in-flight upload");
            return (entry.id, entry.result.clone());
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.shutdown.child_token();
        let task = tokio::spawn(Self::transfer(
            Arc::clone(&self.inner),
            digest.clone(),
            data,
            cancel.clone(),
            id,
        ));
        let operation = format!("upload of {digest}");
        let result = task
            .map(move |joined| {
                joined.unwrap_or_else(|_| Err(Arc::new(RemoteError::cancelled(operation))))
            })
            .boxed()
            .shared();

        registry.insert(
            digest.clone(),
            InFlight {
                id,
                result: result.clone(),
                cancel,
                waiters: 1,
            },
        );
        (id, result)
    }

    async fn transfer(
        inner: Arc<Inner>,
        digest: Digest,
        data: Bytes,
        cancel: CancellationToken,
        id: u64,
    ) -> TransferOutcome {
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(RemoteError::cancelled(format!("upload of {digest}"))),
            result = Self::write_blob(&inner, &digest, data) => result,
        };

        {
            let mut registry = lock(&inner.in_flight);
            if registry.get(&digest).is_some_and(|entry| entry.id == id) {
                registry.remove(&digest);
            }
        }

        if let Err(e) = &outcome {
            debug!(digest = %digest, error = %e, "Blob upload failed");
        }
        outcome.map_err(Arc::new)
    }

    #[instrument(skip(inner, digest, data), fields(digest = %digest))]
    async fn write_blob(inner: &Inner, digest: &Digest, data: Bytes) -> Result<()> {
        let _permit = inner
            .limiter
            .acquire()
            .await
            .map_err(|_| RemoteError::cancelled(format!("upload of {digest}")))?;

        let resource_name = inner.names.upload(digest, Uuid::new_v4());
        let size = digest.size_bytes;
        let chunk_size = inner.chunk_size;
        let mut resume = false;

        debug!(resource = %resource_name, chunk_size, "Starting ByteStream upload");

        inner
            .retrier
            .execute("ByteStream.Write", |progress| {
                let is_retry = std::mem::replace(&mut resume, true);
                let resource_name = resource_name.clone();
                let data = data.clone();
                async move {
                    let offset = if is_retry {
                        let status = inner.channel.query_write_status(&resource_name).await?;
                        if status.complete {
                            debug!("Server already has the complete blob");
                            return Ok(());
                        }
                        debug!(committed = status.committed_size, "Resuming ByteStream upload");
                        status.committed_size
                    } else {
                        0
                    };

                    let first = offset;
                    let name = resource_name.clone();
                    let chunks = futures::stream::iter(Chunker::starting_at(
                        data,
                        chunk_size,
                        u64::try_from(offset).unwrap_or(0),
                    ))
                    .map(move |chunk| {
                        progress.advance(chunk.data.len() as u64);
                        let write_offset = i64::try_from(chunk.offset).unwrap_or(i64::MAX);
                        WriteChunk {
                            resource_name: if write_offset == first {
                                name.clone()
                            } else {
                                String::new()
                            },
                            write_offset,
                            data: chunk.data,
                            finish_write: chunk.last,
                        }
                    })
                    .boxed();

                    let committed = inner.channel.write(chunks).await?;
                    if committed != size {
                        return Err(RemoteError::bytestream_incomplete(size, committed));
                    }
                    Ok(())
                }
            })
            .await?;

        inner
            .bytes_uploaded
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        debug!(committed_size = size, "ByteStream upload complete");
        Ok(())
    }

    /// Download a blob and verify it against `digest`
    ///
    /// # Errors
    ///
    /// Returns `CacheNotFound` if the blob is absent and `DigestMismatch` if
    /// the received content does not hash to `digest`.
    pub async fn download(&self, digest: &Digest) -> Result<Bytes> {
        self.download_cancellable(digest, &CancellationToken::new())
            .await
    }

    /// Download a blob, giving up as soon as `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires first, otherwise as
    /// [`ByteStreamUploader::download`].
    #[instrument(skip(self, digest, cancel), fields(digest = %digest))]
    pub async fn download_cancellable(
        &self,
        digest: &Digest,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        if digest.is_empty() {
            return Ok(Bytes::new());
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(RemoteError::cancelled(format!("download of {digest}"))),
            () = self.inner.shutdown.cancelled() => Err(RemoteError::cancelled(format!("download of {digest}"))),
            result = self.read_blob(digest) => result,
        }
    }

    async fn read_blob(&self, digest: &Digest) -> Result<Bytes> {
        let inner = &self.inner;
        let _permit = inner
            .limiter
            .acquire()
            .await
            .map_err(|_| RemoteError::cancelled(format!("download of {digest}")))?;

        let resource_name = inner.names.read(digest);
        let expected = digest.size();
        let received = Arc::new(Mutex::new(BytesMut::with_capacity(expected)));

        inner
            .retrier
            .execute("ByteStream.Read", |progress| {
                let received = Arc::clone(&received);
                let resource_name = resource_name.clone();
                async move {
                    let offset = buffer(&received).len();
                    if offset > 0 {
                        debug!(offset, "Resuming ByteStream read");
                    }
                    let mut stream = inner
                        .channel
                        .read(&resource_name, i64::try_from(offset).unwrap_or(i64::MAX))
                        .await?;

                    while let Some(data) = stream.next().await {
                        let data = data?;
                        progress.advance(data.len() as u64);
                        let mut buf = buffer(&received);
                        if buf.len() + data.len() > expected {
                            return Err(RemoteError::digest_mismatch(
                                digest,
                                format!("more than {expected} bytes"),
                            ));
                        }
                        buf.extend_from_slice(&data);
                    }

                    let len = buffer(&received).len();
                    if len != expected {
                        return Err(RemoteError::bytestream_incomplete(
                            digest.size_bytes,
                            len as i64,
                        ));
                    }
                    Ok(())
                }
            })
            .await?;

        let data = std::mem::take(&mut *buffer(&received)).freeze();
        let actual = Digest::from_bytes(&data);
        if actual != *digest {
            return Err(RemoteError::digest_mismatch(digest, actual));
        }

        inner
            .bytes_downloaded
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(data)
    }

    /// Number of distinct digests currently being uploaded
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }

    /// Total bytes successfully uploaded
    pub fn bytes_uploaded(&self) -> u64 {
        self.inner.bytes_uploaded.load(Ordering::Relaxed)
    }

    /// Total bytes successfully downloaded
    pub fn bytes_downloaded(&self) -> u64 {
        self.inner.bytes_downloaded.load(Ordering::Relaxed)
    }

    /// Cancel every in-flight and future transfer
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.limiter.close();
    }
}

fn buffer(received: &Mutex<BytesMut>) -> MutexGuard<'_, BytesMut> {
    received.lock().unwrap_or_else(PoisonError::into_inner)
}
