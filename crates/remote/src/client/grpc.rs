//! tonic transport for REAPI and ByteStream services

use crate::client::transport::{CasTransport, ReadStream, WriteChunk, WriteStatus};
use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};
use crate::merkle::Digest;
use crate::proto::bytestream::{
    QueryWriteStatusRequest, QueryWriteStatusResponse, ReadRequest, ReadResponse, WriteRequest,
    WriteResponse,
};
use crate::reapi::{
    ActionResult, FindMissingBlobsRequest, FindMissingBlobsResponse, GetActionResultRequest,
    UpdateActionResultRequest,
};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Mutex;
use std::time::Duration;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info, instrument};

const FIND_MISSING_BLOBS: &str =
    "/build.bazel.remote.execution.v2.ContentAddressableStorage/FindMissingBlobs";
const GET_ACTION_RESULT: &str = "/build.bazel.remote.execution.v2.ActionCache/GetActionResult";
const UPDATE_ACTION_RESULT: &str =
    "/build.bazel.remote.execution.v2.ActionCache/UpdateActionResult";
const BYTESTREAM_READ: &str = "/google.bytestream.ByteStream/Read";
const BYTESTREAM_WRITE: &str = "/google.bytestream.ByteStream/Write";
const BYTESTREAM_QUERY_WRITE_STATUS: &str = "/google.bytestream.ByteStream/QueryWriteStatus";

/// gRPC connection to a remote cache endpoint
pub struct GrpcTransport {
    endpoint: String,
    channel: Mutex<Option<Channel>>,
}

impl GrpcTransport {
    /// Connect to the configured endpoint
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for a malformed endpoint and `ConnectionFailed`
    /// if the connection cannot be established.
    pub async fn connect(config: &RemoteConfig) -> Result<Self> {
        let endpoint = create_endpoint(config)?;

        info!(endpoint = %config.endpoint, "Connecting to remote cache");

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| RemoteError::connection_failed(&config.endpoint, e.to_string()))?;

        debug!("Successfully connected to remote cache");
        Ok(Self::from_channel(&config.endpoint, channel))
    }

    /// Create a transport that connects on first use
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for a malformed endpoint.
    pub fn connect_lazy(config: &RemoteConfig) -> Result<Self> {
        let channel = create_endpoint(config)?.connect_lazy();
        Ok(Self::from_channel(&config.endpoint, channel))
    }

    /// Wrap an existing tonic channel
    pub fn from_channel(endpoint: impl Into<String>, channel: Channel) -> Self {
        Self {
            endpoint: endpoint.into(),
            channel: Mutex::new(Some(channel)),
        }
    }

    async fn client(&self) -> Result<Grpc<Channel>> {
        let channel = self
            .channel
            .lock()
            .map_err(|_| RemoteError::ChannelClosed)?
            .clone()
            .ok_or(RemoteError::ChannelClosed)?;
        let mut grpc = Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| RemoteError::connection_failed(&self.endpoint, e.to_string()))?;
        Ok(grpc)
    }

    async fn unary<Req, Resp>(
        &self,
        path: &'static str,
        operation: &'static str,
        request: Req,
    ) -> std::result::Result<Resp, RemoteError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        self.unary_status(path, request)
            .await?
            .map_err(|status| RemoteError::grpc_error(operation, status))
    }

    /// Like `unary`, but hands the gRPC status back to the caller
    async fn unary_status<Req, Resp>(
        &self,
        path: &'static str,
        request: Req,
    ) -> Result<std::result::Result<Resp, tonic::Status>>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.client().await?;
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(path),
                ProstCodec::<Req, Resp>::default(),
            )
            .await;
        Ok(response.map(tonic::Response::into_inner))
    }
}

#[async_trait]
impl CasTransport for GrpcTransport {
    #[instrument(skip(self, digests), fields(count = digests.len()))]
    async fn find_missing_blobs(
        &self,
        instance_name: &str,
        digests: Vec<Digest>,
    ) -> Result<Vec<Digest>> {
        let request = FindMissingBlobsRequest {
            instance_name: instance_name.to_string(),
            blob_digests: digests.iter().map(Digest::to_proto).collect(),
        };
        let response: FindMissingBlobsResponse = self
            .unary(
                FIND_MISSING_BLOBS,
                "ContentAddressableStorage.FindMissingBlobs",
                request,
            )
            .await?;
        response
            .missing_blob_digests
            .iter()
            .map(Digest::try_from)
            .collect()
    }

    async fn write(&self, chunks: BoxStream<'static, WriteChunk>) -> Result<i64> {
        let requests = chunks.map(|chunk| WriteRequest {
            resource_name: chunk.resource_name,
            write_offset: chunk.write_offset,
            finish_write: chunk.finish_write,
            data: chunk.data,
        });

        let mut grpc = self.client().await?;
        let response = grpc
            .client_streaming(
                tonic::Request::new(requests),
                PathAndQuery::from_static(BYTESTREAM_WRITE),
                ProstCodec::<WriteRequest, WriteResponse>::default(),
            )
            .await
            .map_err(|e| RemoteError::grpc_error("ByteStream.Write", e))?;

        Ok(response.into_inner().committed_size)
    }

    #[instrument(skip(self))]
    async fn query_write_status(&self, resource_name: &str) -> Result<WriteStatus> {
        let request = QueryWriteStatusRequest {
            resource_name: resource_name.to_string(),
        };
        match self
            .unary_status::<_, QueryWriteStatusResponse>(BYTESTREAM_QUERY_WRITE_STATUS, request)
            .await?
        {
            Ok(response) => Ok(WriteStatus {
                committed_size: response.committed_size,
                complete: response.complete,
            }),
            // Nothing was committed under this name yet
            Err(status) if status.code() == tonic::Code::NotFound => Ok(WriteStatus::default()),
            Err(status) => Err(RemoteError::grpc_error(
                "ByteStream.QueryWriteStatus",
                status,
            )),
        }
    }

    #[instrument(skip(self))]
    async fn read(&self, resource_name: &str, offset: i64) -> Result<ReadStream> {
        let request = ReadRequest {
            resource_name: resource_name.to_string(),
            read_offset: offset,
            read_limit: 0, // 0 means no limit
        };

        let mut grpc = self.client().await?;
        let response = grpc
            .server_streaming(
                tonic::Request::new(request),
                PathAndQuery::from_static(BYTESTREAM_READ),
                ProstCodec::<ReadRequest, ReadResponse>::default(),
            )
            .await
            .map_err(|status| read_error(resource_name, status))?;

        let resource_name = resource_name.to_string();
        Ok(response
            .into_inner()
            .map(move |message| {
                message
                    .map(|m| m.data)
                    .map_err(|status| read_error(&resource_name, status))
            })
            .boxed())
    }

    #[instrument(skip(self), fields(action = %action_digest))]
    async fn get_action_result(
        &self,
        instance_name: &str,
        action_digest: &Digest,
    ) -> Result<Option<ActionResult>> {
        let request = GetActionResultRequest {
            instance_name: instance_name.to_string(),
            action_digest: Some(action_digest.to_proto()),
            inline_stdout: true,
            inline_stderr: true,
        };
        match self
            .unary_status::<_, ActionResult>(GET_ACTION_RESULT, request)
            .await?
        {
            Ok(result) => Ok(Some(result)),
            Err(status) if status.code() == tonic::Code::NotFound => Ok(None),
            Err(status) => Err(RemoteError::grpc_error(
                "ActionCache.GetActionResult",
                status,
            )),
        }
    }

    #[instrument(skip(self, result), fields(action = %action_digest))]
    async fn update_action_result(
        &self,
        instance_name: &str,
        action_digest: &Digest,
        result: ActionResult,
    ) -> Result<ActionResult> {
        let request = UpdateActionResultRequest {
            instance_name: instance_name.to_string(),
            action_digest: Some(action_digest.to_proto()),
            action_result: Some(result),
        };
        self.unary(
            UPDATE_ACTION_RESULT,
            "ActionCache.UpdateActionResult",
            request,
        )
        .await
    }

    fn close(&self) {
        if let Ok(mut guard) = self.channel.lock() {
            guard.take();
        }
        debug!(endpoint = %self.endpoint, "Closed remote cache channel");
    }
}

/// NOT_FOUND on a read means the blob is gone from the CAS
fn read_error(resource_name: &str, status: tonic::Status) -> RemoteError {
    if status.code() == tonic::Code::NotFound {
        RemoteError::cache_not_found(resource_name)
    } else {
        RemoteError::grpc_error("ByteStream.Read", status)
    }
}

/// Create a tonic Endpoint from RemoteConfig
fn create_endpoint(config: &RemoteConfig) -> Result<Endpoint> {
    let endpoint_str = &config.endpoint;
    if endpoint_str.is_empty() {
        return Err(RemoteError::config_error("No remote cache endpoint configured"));
    }

    // Normalize endpoint URL
    let uri = if let Some(rest) = endpoint_str.strip_prefix("grpcs://") {
        format!("https://{rest}")
    } else if let Some(rest) = endpoint_str.strip_prefix("grpc://") {
        format!("http://{rest}")
    } else if !endpoint_str.starts_with("http://") && !endpoint_str.starts_with("https://") {
        // Default to https for bare hostnames
        format!("https://{endpoint_str}")
    } else {
        endpoint_str.clone()
    };

    debug!(original = %endpoint_str, normalized = %uri, "Normalizing endpoint URL");

    let mut endpoint = Endpoint::from_shared(uri.clone()).map_err(|e| {
        RemoteError::config_error(format!("Invalid endpoint '{endpoint_str}': {e}"))
    })?;

    // Streams may outlive a single attempt deadline; that is enforced by the retrier
    endpoint = endpoint.connect_timeout(Duration::from_secs(30));

    if uri.starts_with("https://") {
        let tls = ClientTlsConfig::new().with_native_roots();
        endpoint = endpoint
            .tls_config(tls)
            .map_err(|e| RemoteError::config_error(format!("TLS configuration error: {e}")))?;
    }

    // Configure keep-alive for long-running connections
    endpoint = endpoint
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_timeout(Duration::from_secs(10))
        .keep_alive_while_idle(true);

    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: &str) -> RemoteConfig {
        RemoteConfig {
            endpoint: endpoint.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_endpoint_normalization() {
        for endpoint in [
            "grpcs://cache.example.com",
            "grpc://localhost:8980",
            "cache.example.com:443",
            "http://127.0.0.1:9092",
        ] {
            assert!(create_endpoint(&config(endpoint)).is_ok(), "{endpoint}");
        }
    }

    #[test]
    fn test_empty_endpoint_rejected() {
        assert!(matches!(
            create_endpoint(&config("")),
            Err(RemoteError::ConfigError(_))
        ));
    }

    #[test]
    fn test_read_not_found_is_cache_not_found() {
        let err = read_error("blobs/abc/1", tonic::Status::not_found("gone"));
        assert!(err.is_cache_not_found());

        let err = read_error("blobs/abc/1", tonic::Status::unavailable("down"));
        assert!(!err.is_cache_not_found());
    }

    #[tokio::test]
    async fn test_closed_transport_fails_fast() {
        let transport = GrpcTransport::connect_lazy(&config("grpc://127.0.0.1:1")).unwrap();
        transport.close();
        let err = transport
            .query_write_status("uploads/x/blobs/y/1")
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::ChannelClosed));
    }
}
