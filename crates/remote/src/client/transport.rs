//! Wire-level abstraction over the CAS, ByteStream and ActionCache services

use crate::error::Result;
use crate::merkle::Digest;
use crate::reapi::ActionResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// One message of a ByteStream write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteChunk {
    /// Set on the first message of each stream, empty afterwards
    pub resource_name: String,
    /// Offset of `data` within the blob
    pub write_offset: i64,
    /// Payload
    pub data: Bytes,
    /// Set on the message that completes the blob
    pub finish_write: bool,
}

/// Outcome of `QueryWriteStatus`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStatus {
    /// Bytes the server has durably committed
    pub committed_size: i64,
    /// Whether the blob is fully written
    pub complete: bool,
}

/// Stream of data returned by `ByteStream.Read`
pub type ReadStream = BoxStream<'static, Result<Bytes>>;

/// The RPCs this client issues against a remote cache endpoint
///
/// Implementations report failures faithfully; retrying and classification
/// happen above this layer. `Read` of an absent blob must fail with
/// `CacheNotFound`, while `GetActionResult` of an absent key is `Ok(None)`.
#[async_trait]
pub trait CasTransport: Send + Sync {
    /// `ContentAddressableStorage.FindMissingBlobs`
    async fn find_missing_blobs(
        &self,
        instance_name: &str,
        digests: Vec<Digest>,
    ) -> Result<Vec<Digest>>;

    /// `ByteStream.Write`; returns the committed size
    async fn write(&self, chunks: BoxStream<'static, WriteChunk>) -> Result<i64>;

    /// `ByteStream.QueryWriteStatus`
    async fn query_write_status(&self, resource_name: &str) -> Result<WriteStatus>;

    /// `ByteStream.Read` starting at `offset`
    async fn read(&self, resource_name: &str, offset: i64) -> Result<ReadStream>;

    /// `ActionCache.GetActionResult`
    async fn get_action_result(
        &self,
        instance_name: &str,
        action_digest: &Digest,
    ) -> Result<Option<ActionResult>>;

    /// `ActionCache.UpdateActionResult`
    async fn update_action_result(
        &self,
        instance_name: &str,
        action_digest: &Digest,
        result: ActionResult,
    ) -> Result<ActionResult>;

    /// Release the underlying connection
    fn close(&self);
}
