use crate::error::{RemoteError, Result};
use crate::reapi;
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// SHA-256 of the empty blob. The empty digest is never sent over the wire.
pub const EMPTY_DIGEST_HASH: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// A Content Addressable Storage (CAS) digest, consisting of a SHA256 hash and size in bytes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    /// Lowercase hex SHA-256
    pub hash: String,
    /// Blob size in bytes
    pub size_bytes: i64,
}

impl Digest {
    /// Creates a Digest from a hash string and size, validating both.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDigest` unless the hash is 64 lowercase hex characters
    /// and the size is non-negative. A zero size must carry the empty-blob hash.
    pub fn new(hash: impl Into<String>, size_bytes: i64) -> Result<Self> {
        let hash = hash.into();
        if hash.len() != 64 || !hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(RemoteError::invalid_digest(format!(
                "hash must be 64 lowercase hex characters, got {hash:?}"
            )));
        }
        if size_bytes < 0 {
            return Err(RemoteError::invalid_digest(format!(
                "size must be non-negative, got {size_bytes}"
            )));
        }
        if size_bytes == 0 && hash != EMPTY_DIGEST_HASH {
            return Err(RemoteError::invalid_digest(format!(
                "zero-size digest must be the empty blob, got {hash}"
            )));
        }
        Ok(Self { hash, size_bytes })
    }

    /// Creates a Digest from the given content.
    pub fn from_bytes(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self {
            hash: hex::encode(hasher.finalize()),
            size_bytes: content.len() as i64,
        }
    }

    /// The digest of the empty blob.
    pub fn empty() -> Self {
        Self {
            hash: EMPTY_DIGEST_HASH.to_string(),
            size_bytes: 0,
        }
    }

    /// Whether this is the reserved empty-blob digest.
    pub fn is_empty(&self) -> bool {
        self.size_bytes == 0 && self.hash == EMPTY_DIGEST_HASH
    }

    /// Size as `usize`, for buffer sizing
    pub fn size(&self) -> usize {
        usize::try_from(self.size_bytes).unwrap_or(0)
    }

    /// Convert to the wire message
    pub fn to_proto(&self) -> reapi::Digest {
        reapi::Digest {
            hash: self.hash.clone(),
            size_bytes: self.size_bytes,
        }
    }

    /// Convert from an optional wire field, failing if absent or malformed
    ///
    /// # Errors
    ///
    /// Returns `InvalidDigest` if the field is missing or invalid.
    pub fn from_proto_field(field: Option<&reapi::Digest>, what: &str) -> Result<Self> {
        let proto =
            field.ok_or_else(|| RemoteError::invalid_digest(format!("{what} has no digest")))?;
        Self::try_from(proto)
    }
}

impl TryFrom<&reapi::Digest> for Digest {
    type Error = RemoteError;

    fn try_from(proto: &reapi::Digest) -> Result<Self> {
        Self::new(proto.hash.clone(), proto.size_bytes)
    }
}

impl From<&Digest> for reapi::Digest {
    fn from(digest: &Digest) -> Self {
        digest.to_proto()
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

impl FromStr for Digest {
    type Err = RemoteError;

    /// Parses the `hash/size` form produced by `Display`.
    fn from_str(s: &str) -> Result<Self> {
        let (hash, size) = s
            .split_once('/')
            .ok_or_else(|| RemoteError::invalid_digest(format!("expected hash/size, got {s:?}")))?;
        let size = size
            .parse::<i64>()
            .map_err(|e| RemoteError::invalid_digest(format!("bad size in {s:?}: {e}")))?;
        Self::new(hash, size)
    }
}
