//! Reference-counted handle to the remote endpoint
//!
//! Every component that talks to the endpoint (the uploader, the cache)
//! holds its own [`SharedChannel`]. The underlying transport is closed once,
//! when the last holder is released or dropped, so a component finishing
//! early cannot sever a connection still in use elsewhere.

use crate::client::transport::{CasTransport, ReadStream, WriteChunk, WriteStatus};
use crate::error::{RemoteError, Result};
use crate::merkle::Digest;
use crate::reapi::ActionResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

struct ChannelState {
    transport: Arc<dyn CasTransport>,
    holders: AtomicUsize,
    closed: AtomicBool,
}

impl ChannelState {
    fn release_one(&self) {
        if self.holders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.closed.store(true, Ordering::Release);
            debug!("Last holder released, closing remote channel");
            self.transport.close();
        }
    }
}

/// One holder's reference to a shared transport
pub struct SharedChannel {
    state: Arc<ChannelState>,
    released: AtomicBool,
}

impl std::fmt::Debug for SharedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedChannel")
            .field("holders", &self.holders())
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}

impl SharedChannel {
    /// Wrap a transport; the returned handle is its first holder
    pub fn new(transport: Arc<dyn CasTransport>) -> Self {
        Self {
            state: Arc::new(ChannelState {
                transport,
                holders: AtomicUsize::new(1),
                closed: AtomicBool::new(false),
            }),
            released: AtomicBool::new(false),
        }
    }

    /// Register another holder
    ///
    /// # Errors
    ///
    /// Returns `ChannelClosed` if this handle was already released.
    pub fn retain(&self) -> Result<Self> {
        if self.released.load(Ordering::Acquire) || self.is_closed() {
            return Err(RemoteError::ChannelClosed);
        }
        self.state.holders.fetch_add(1, Ordering::AcqRel);
        Ok(Self {
            state: Arc::clone(&self.state),
            released: AtomicBool::new(false),
        })
    }

    /// Give up this holder's reference; idempotent
    ///
    /// Later calls through this handle fail with `ChannelClosed`.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.state.release_one();
        }
    }

    /// Number of live holders
    pub fn holders(&self) -> usize {
        self.state.holders.load(Ordering::Acquire)
    }

    /// Whether the transport has been closed
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    fn transport(&self) -> Result<&dyn CasTransport> {
        if self.released.load(Ordering::Acquire) || self.is_closed() {
            return Err(RemoteError::ChannelClosed);
        }
        Ok(self.state.transport.as_ref())
    }
}

impl Drop for SharedChannel {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl CasTransport for SharedChannel {
    async fn find_missing_blobs(
        &self,
        instance_name: &str,
        digests: Vec<Digest>,
    ) -> Result<Vec<Digest>> {
        self.transport()?
            .find_missing_blobs(instance_name, digests)
            .await
    }

    async fn write(&self, chunks: BoxStream<'static, WriteChunk>) -> Result<i64> {
        self.transport()?.write(chunks).await
    }

    async fn query_write_status(&self, resource_name: &str) -> Result<WriteStatus> {
        self.transport()?.query_write_status(resource_name).await
    }

    async fn read(&self, resource_name: &str, offset: i64) -> Result<ReadStream> {
        self.transport()?.read(resource_name, offset).await
    }

    async fn get_action_result(
        &self,
        instance_name: &str,
        action_digest: &Digest,
    ) -> Result<Option<ActionResult>> {
        self.transport()?
            .get_action_result(instance_name, action_digest)
            .await
    }

    async fn update_action_result(
        &self,
        instance_name: &str,
        action_digest: &Digest,
        result: ActionResult,
    ) -> Result<ActionResult> {
        self.transport()?
            .update_action_result(instance_name, action_digest, result)
            .await
    }

    fn close(&self) {
        self.release();
    }
}
