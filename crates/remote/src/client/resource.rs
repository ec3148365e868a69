//! ByteStream resource names
//!
//! Uploads use `{instance}/uploads/{uuid}/blobs/{hash}/{size}` and reads use
//! `{instance}/blobs/{hash}/{size}`. An empty instance name drops the
//! leading segment.

use crate::error::{RemoteError, Result};
use crate::merkle::Digest;
use uuid::Uuid;

/// Builds resource names for one instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceNames {
    instance_name: String,
}

impl ResourceNames {
    /// Create names under `instance_name`
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into().trim_matches('/').to_string(),
        }
    }

    /// The instance prefix
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Name for uploading `digest` under a fresh or reused upload id
    pub fn upload(&self, digest: &Digest, upload_id: Uuid) -> String {
        self.prefixed(format!(
            "uploads/{upload_id}/blobs/{}/{}",
            digest.hash, digest.size_bytes
        ))
    }

    /// Name for reading `digest`
    pub fn read(&self, digest: &Digest) -> String {
        self.prefixed(format!("blobs/{}/{}", digest.hash, digest.size_bytes))
    }

    fn prefixed(&self, tail: String) -> String {
        if self.instance_name.is_empty() {
            tail
        } else {
            format!("{}/{tail}", self.instance_name)
        }
    }
}

/// Extract the digest from an upload or read resource name
///
/// # Errors
///
/// Returns `InvalidDigest` if the name has no `blobs/{hash}/{size}` segment.
pub fn parse_blob_digest(resource_name: &str) -> Result<Digest> {
    let segments: Vec<&str> = resource_name.split('/').collect();
    let blob = segments
        .iter()
        .rposition(|s| *s == "blobs")
        .and_then(|i| segments.get(i + 1..i + 3));
    match blob {
        Some([hash, size]) => format!("{hash}/{size}").parse(),
        _ => Err(RemoteError::invalid_digest(format!(
            "no blob in resource name {resource_name:?}"
        ))),
    }
}
