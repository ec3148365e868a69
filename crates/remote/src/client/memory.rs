//! In-process transport backed by hash maps
//!
//! Behaves like a conforming CAS/ActionCache server: writes are verified
//! against the digest in their resource name, partially committed writes
//! can be resumed, and reads of absent blobs fail with `CacheNotFound`.
//! Faults can be injected to exercise retry and resume paths, and every RPC
//! is counted.

use crate::client::resource::parse_blob_digest;
use crate::client::transport::{CasTransport, ReadStream, WriteChunk, WriteStatus};
use crate::error::{RemoteError, Result};
use crate::merkle::Digest;
use crate::reapi::ActionResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// RPC call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `FindMissingBlobs` calls
    pub find_missing_blobs: usize,
    /// `Write` streams opened
    pub write: usize,
    /// `QueryWriteStatus` calls
    pub query_write_status: usize,
    /// `Read` calls
    pub read: usize,
    /// `GetActionResult` calls
    pub get_action_result: usize,
    /// `UpdateActionResult` calls
    pub update_action_result: usize,
    /// `close` calls
    pub close: usize,
}

impl CallCounts {
    /// Total RPCs, excluding `close`
    pub fn total_rpcs(&self) -> usize {
        self.find_missing_blobs
            + self.write
            + self.query_write_status
            + self.read
            + self.get_action_result
            + self.update_action_result
    }
}

/// What one `Write` stream carried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    /// Digest named by the stream's resource name
    pub digest: Digest,
    /// Offset of the first message
    pub first_offset: i64,
    /// Payload bytes received
    pub bytes_received: usize,
}

#[derive(Default)]
struct State {
    blobs: HashMap<Digest, Bytes>,
    action_results: HashMap<Digest, ActionResult>,
    partial_writes: HashMap<String, Vec<u8>>,
    completed_writes: HashSet<String>,
    calls: CallCounts,
    find_missing_requests: Vec<Vec<Digest>>,
    writes: Vec<WriteRecord>,
    fail_writes_after: Vec<usize>,
    fail_reads_after: Vec<usize>,
    fail_get_action_result: Vec<tonic::Status>,
    fail_update_action_result: Vec<tonic::Status>,
    write_delay: Option<Duration>,
    read_chunk_size: usize,
}

/// Transport that keeps blobs and action results in memory
pub struct InMemoryTransport {
    state: Mutex<State>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                read_chunk_size: 1024,
                ..State::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a blob, returning its digest
    pub fn insert_blob(&self, data: impl Into<Bytes>) -> Digest {
        let data = data.into();
        let digest = Digest::from_bytes(&data);
        self.state().blobs.insert(digest.clone(), data);
        digest
    }

    /// Evict a blob, as a server under storage pressure would
    pub fn remove_blob(&self, digest: &Digest) -> bool {
        self.state().blobs.remove(digest).is_some()
    }

    /// Stored blob content
    pub fn blob(&self, digest: &Digest) -> Option<Bytes> {
        self.state().blobs.get(digest).cloned()
    }

    /// Whether a blob is stored
    pub fn contains_blob(&self, digest: &Digest) -> bool {
        self.state().blobs.contains_key(digest)
    }

    /// Seed an action result
    pub fn insert_action_result(&self, action_digest: Digest, result: ActionResult) {
        self.state().action_results.insert(action_digest, result);
    }

    /// Stored action result
    pub fn action_result(&self, action_digest: &Digest) -> Option<ActionResult> {
        self.state().action_results.get(action_digest).cloned()
    }

    /// Snapshot of the call counters
    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }

    /// Digest lists of every `FindMissingBlobs` request, in call order
    pub fn find_missing_requests(&self) -> Vec<Vec<Digest>> {
        self.state().find_missing_requests.clone()
    }

    /// Every `Write` stream received, in call order
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state().writes.clone()
    }

    /// Make the next write commit `bytes` bytes and then fail with UNAVAILABLE
    pub fn fail_next_write_after(&self, bytes: usize) {
        self.state().fail_writes_after.push(bytes);
    }

    /// Make the next read deliver `bytes` bytes and then fail with UNAVAILABLE
    pub fn fail_next_read_after(&self, bytes: usize) {
        self.state().fail_reads_after.push(bytes);
    }

    /// Fail the next `GetActionResult` with `status`
    pub fn fail_next_get_action_result(&self, status: tonic::Status) {
        self.state().fail_get_action_result.push(status);
    }

    /// Fail the next `UpdateActionResult` with `status`
    pub fn fail_next_update_action_result(&self, status: tonic::Status) {
        self.state().fail_update_action_result.push(status);
    }

    /// Hold every write open for `delay` before consuming it
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.state().write_delay = delay;
    }

    /// Size of the messages a read is split into
    pub fn set_read_chunk_size(&self, size: usize) {
        self.state().read_chunk_size = size.max(1);
    }

    /// Apply one message to the write named `resource_name`
    ///
    /// Returns the committed size, or an error that ends the stream.
    fn accept_chunk(
        &self,
        resource_name: &str,
        digest: &Digest,
        chunk: &WriteChunk,
        fail_after: Option<usize>,
    ) -> std::result::Result<(i64, bool), tonic::Status> {
        let mut state = self.state();
        let committed = state
            .partial_writes
            .entry(resource_name.to_string())
            .or_default();

        if i64::try_from(committed.len()).ok() != Some(chunk.write_offset) {
            return Err(tonic::Status::invalid_argument(format!(
                "write offset {} does not match committed size {}",
                chunk.write_offset,
                committed.len()
            )));
        }

        if let Some(limit) = fail_after {
            let end = committed.len() + chunk.data.len();
            if end > limit || (end == limit && limit < digest.size()) {
                let keep = limit.saturating_sub(committed.len()).min(chunk.data.len());
                committed.extend_from_slice(&chunk.data[..keep]);
                return Err(tonic::Status::unavailable("injected write failure"));
            }
        }

        committed.extend_from_slice(&chunk.data);
        let size = committed.len() as i64;

        if chunk.finish_write {
            let data = Bytes::from(std::mem::take(committed));
            state.partial_writes.remove(resource_name);
            if Digest::from_bytes(&data) != *digest {
                return Err(tonic::Status::invalid_argument(format!(
                    "uploaded content does not match {digest}"
                )));
            }
            state.blobs.insert(digest.clone(), data);
            state.completed_writes.insert(resource_name.to_string());
            return Ok((size, true));
        }
        Ok((size, false))
    }
}

#[async_trait]
impl CasTransport for InMemoryTransport {
    async fn find_missing_blobs(
        &self,
        _instance_name: &str,
        digests: Vec<Digest>,
    ) -> Result<Vec<Digest>> {
        let mut state = self.state();
        state.calls.find_missing_blobs += 1;
        state.find_missing_requests.push(digests.clone());
        Ok(digests
            .into_iter()
            .filter(|d| !state.blobs.contains_key(d))
            .collect())
    }

    async fn write(&self, mut chunks: BoxStream<'static, WriteChunk>) -> Result<i64> {
        let (delay, fail_after) = {
            let mut state = self.state();
            state.calls.write += 1;
            let fail_after = if state.fail_writes_after.is_empty() {
                None
            } else {
                Some(state.fail_writes_after.remove(0))
            };
            (state.write_delay, fail_after)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut resource_name = String::new();
        let mut record: Option<WriteRecord> = None;
        let mut committed = 0;

        while let Some(chunk) = chunks.next().await {
            if record.is_none() {
                if chunk.resource_name.is_empty() {
                    return Err(RemoteError::grpc_error(
                        "ByteStream.Write",
                        tonic::Status::invalid_argument("first message has no resource name"),
                    ));
                }
                resource_name.clone_from(&chunk.resource_name);
                let digest = parse_blob_digest(&resource_name)?;
                record = Some(WriteRecord {
                    digest,
                    first_offset: chunk.write_offset,
                    bytes_received: 0,
                });
            }
            let Some(rec) = record.as_mut() else { break };
            rec.bytes_received += chunk.data.len();

            let digest = rec.digest.clone();
            let outcome = self.accept_chunk(&resource_name, &digest, &chunk, fail_after);
            match outcome {
                Ok((size, done)) => {
                    committed = size;
                    if done {
                        break;
                    }
                }
                Err(status) => {
                    if let Some(rec) = record.take() {
                        self.state().writes.push(rec);
                    }
                    return Err(RemoteError::grpc_error("ByteStream.Write", status));
                }
            }
        }

        if let Some(rec) = record {
            self.state().writes.push(rec);
        }
        Ok(committed)
    }

    async fn query_write_status(&self, resource_name: &str) -> Result<WriteStatus> {
        let mut state = self.state();
        state.calls.query_write_status += 1;
        if state.completed_writes.contains(resource_name) {
            let digest = parse_blob_digest(resource_name)?;
            return Ok(WriteStatus {
                committed_size: digest.size_bytes,
                complete: true,
            });
        }
        let committed_size = state
            .partial_writes
            .get(resource_name)
            .map_or(0, |data| data.len() as i64);
        Ok(WriteStatus {
            committed_size,
            complete: false,
        })
    }

    async fn read(&self, resource_name: &str, offset: i64) -> Result<ReadStream> {
        let digest = parse_blob_digest(resource_name)?;
        let mut state = self.state();
        state.calls.read += 1;

        let data = state
            .blobs
            .get(&digest)
            .cloned()
            .ok_or_else(|| RemoteError::cache_not_found(&digest))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let fail_after = if state.fail_reads_after.is_empty() {
            None
        } else {
            Some(state.fail_reads_after.remove(0))
        };
        let chunk_size = state.read_chunk_size;
        drop(state);

        let end = fail_after.map_or(data.len(), |n| (start + n).min(data.len()));
        let mut items: Vec<Result<Bytes>> = (start..end)
            .step_by(chunk_size)
            .map(|at| Ok(data.slice(at..(at + chunk_size).min(end))))
            .collect();
        if fail_after.is_some() {
            items.push(Err(RemoteError::grpc_error(
                "ByteStream.Read",
                tonic::Status::unavailable("injected read failure"),
            )));
        }
        Ok(stream::iter(items).boxed())
    }

    async fn get_action_result(
        &self,
        _instance_name: &str,
        action_digest: &Digest,
    ) -> Result<Option<ActionResult>> {
        let mut state = self.state();
        state.calls.get_action_result += 1;
        if !state.fail_get_action_result.is_empty() {
            let status = state.fail_get_action_result.remove(0);
            return Err(RemoteError::grpc_error("ActionCache.GetActionResult", status));
        }
        Ok(state.action_results.get(action_digest).cloned())
    }

    async fn update_action_result(
        &self,
        _instance_name: &str,
        action_digest: &Digest,
        result: ActionResult,
    ) -> Result<ActionResult> {
        let mut state = self.state();
        state.calls.update_action_result += 1;
        if !state.fail_update_action_result.is_empty() {
            let status = state.fail_update_action_result.remove(0);
            return Err(RemoteError::grpc_error(
                "ActionCache.UpdateActionResult",
                status,
            ));
        }
        state
            .action_results
            .insert(action_digest.clone(), result.clone());
        Ok(result)
    }

    fn close(&self) {
        self.state().calls.close += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::resource::ResourceNames;
    use uuid::Uuid;

    fn chunk(name: &str, offset: i64, data: &'static [u8], finish: bool) -> WriteChunk {
        WriteChunk {
            resource_name: name.to_string(),
            write_offset: offset,
            data: Bytes::from_static(data),
            finish_write: finish,
        }
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let transport = InMemoryTransport::new();
        let digest = Digest::from_bytes(b"hello");
        let name = ResourceNames::default().upload(&digest, Uuid::new_v4());

        let committed = transport
            .write(stream::iter(vec![chunk(&name, 0, b"hello", true)]).boxed())
            .await
            .unwrap();
        assert_eq!(committed, 5);

        let read_name = ResourceNames::default().read(&digest);
        let data: Vec<_> = transport.read(&read_name, 1).await.unwrap().collect().await;
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].as_ref().unwrap(), &Bytes::from_static(b"ello"));
    }

    #[tokio::test]
    async fn test_injected_write_failure_keeps_prefix() {
        let transport = InMemoryTransport::new();
        let digest = Digest::from_bytes(b"1234567");
        let name = ResourceNames::default().upload(&digest, Uuid::new_v4());
        transport.fail_next_write_after(3);

        let err = transport
            .write(stream::iter(vec![chunk(&name, 0, b"1234567", true)]).boxed())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::GrpcError { .. }));

        let status = transport.query_write_status(&name).await.unwrap();
        assert_eq!(status.committed_size, 3);
        assert!(!status.complete);
    }

    #[tokio::test]
    async fn test_mismatched_content_rejected() {
        let transport = InMemoryTransport::new();
        let digest = Digest::from_bytes(b"expected");
        let name = ResourceNames::default().upload(&digest, Uuid::new_v4());

        let result = transport
            .write(stream::iter(vec![chunk(&name, 0, b"actual!!", true)]).boxed())
            .await;
        assert!(result.is_err());
        assert!(!transport.contains_blob(&digest));
    }

    #[tokio::test]
    async fn test_read_missing_is_cache_not_found() {
        let transport = InMemoryTransport::new();
        let name = ResourceNames::default().read(&Digest::from_bytes(b"gone"));
        let err = transport.read(&name, 0).await.err().unwrap();
        assert!(err.is_cache_not_found());
    }
}
