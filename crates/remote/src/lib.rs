//! Remote build-result cache client for stowage
//!
//! This crate speaks the ContentAddressableStorage, ByteStream and
//! ActionCache services of the Bazel Remote Execution API v2. Given a build
//! step (a [`Spawn`]) it derives the action key from the command and a
//! Merkle tree of the inputs, reuses a previously recorded result when one
//! exists, and uploads the result of a local run otherwise.
//!
//! ```rust,ignore
//! use stowage_remote::{RemoteConfig, Spawn, SpawnCache, SpawnResult};
//!
//! let cache = SpawnCache::connect(RemoteConfig::load("remote.toml")?, exec_root).await?;
//! let spawn = Spawn::new("Genrule", ["sh", "-c", "cp a.txt out.txt"])
//!     .input_file("a.txt")
//!     .output("out.txt");
//!
//! let handle = cache.lookup(&spawn).await;
//! if !handle.has_result() {
//!     let result = run_locally(&spawn)?;
//!     handle.store(&result).await;
//! }
//! ```

pub mod cache;
pub mod chunker;
pub mod client;
pub mod config;
pub mod error;
pub mod mapper;
pub mod merkle;
pub mod proto;
pub mod retry;
pub mod spawn;

pub use proto::{bytestream, reapi};

pub use cache::{CachedOutputs, RemoteCache, RemoteOutput, RemoteOutputs};
pub use chunker::{Chunk, Chunker};
pub use client::{ByteStreamUploader, CasTransport, GrpcTransport, InMemoryTransport, SharedChannel};
pub use config::{DownloadMode, RemoteConfig, RetryConfig};
pub use error::{RemoteError, Result};
pub use mapper::{ActionBuilder, CommandMapper, MappedAction, MappedCommand};
pub use merkle::{Digest, MerkleTree, TreeInput};
pub use retry::Retrier;
pub use spawn::{
    CacheHandle, CacheStats, CacheStatsSnapshot, CachedResult, Lookup, Spawn, SpawnCache,
    SpawnResult, StoreOutcome,
};
pub use stowage_events::MissReason;
