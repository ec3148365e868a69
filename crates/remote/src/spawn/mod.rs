//! Spawns and the per-spawn cache mediator

pub mod mediator;
mod outputs;
pub mod stats;

pub use mediator::{CacheHandle, CachedResult, Lookup, SpawnCache, StoreOutcome};
pub use stats::{CacheStats, CacheStatsSnapshot};

use crate::merkle::TreeInput;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

/// Execution-info tags that keep a spawn out of the remote cache
pub const NON_CACHEABLE_TAGS: [&str; 4] = ["no-cache", "no-remote-cache", "no-remote", "local"];

/// One build step: command, inputs and declared outputs
///
/// Paths are relative to the exec root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Spawn {
    /// Short description used in logs and events, e.g. `CppCompile`
    pub mnemonic: String,
    /// argv, program first
    pub arguments: Vec<String>,
    /// Environment variables
    pub environment: BTreeMap<String, String>,
    /// Input tree
    pub inputs: BTreeMap<PathBuf, TreeInput>,
    /// Declared output files and directories
    pub outputs: Vec<PathBuf>,
    /// Execution requirement tags
    pub execution_info: BTreeSet<String>,
    /// Execution timeout recorded in the action
    pub timeout: Option<Duration>,
}

impl Spawn {
    /// Create a spawn running `arguments`
    pub fn new<I, S>(mnemonic: impl Into<String>, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mnemonic: mnemonic.into(),
            arguments: arguments.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Set an environment variable
    #[must_use]
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(name.into(), value.into());
        self
    }

    /// Add an input file read from the exec root
    #[must_use]
    pub fn input_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.inputs.insert(path.clone(), TreeInput::File(path));
        self
    }

    /// Add an input whose content is synthesized in memory
    #[must_use]
    pub fn virtual_input(mut self, path: impl Into<PathBuf>, data: impl Into<Bytes>) -> Self {
        self.inputs
            .insert(path.into(), TreeInput::Virtual(data.into()));
        self
    }

    /// Add an empty input directory
    #[must_use]
    pub fn empty_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.insert(path.into(), TreeInput::EmptyDirectory);
        self
    }

    /// Declare an output file or directory
    #[must_use]
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    /// Add an execution requirement tag
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.execution_info.insert(tag.into());
        self
    }

    /// Set the timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether the execution requirements allow remote caching
    pub fn is_remotely_cacheable(&self) -> bool {
        !NON_CACHEABLE_TAGS
            .iter()
            .any(|tag| self.execution_info.contains(*tag))
    }

    /// Label used in logs and events
    pub fn describe(&self) -> String {
        match self.arguments.first() {
            Some(program) if !self.mnemonic.is_empty() => format!("{} {program}", self.mnemonic),
            Some(program) => program.clone(),
            None => self.mnemonic.clone(),
        }
    }
}

/// What local execution produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnResult {
    /// Process exit code
    pub exit_code: i32,
    /// Captured standard output
    pub stdout: Bytes,
    /// Captured standard error
    pub stderr: Bytes,
}

impl SpawnResult {
    /// A successful result with no output streams
    pub fn success() -> Self {
        Self::default()
    }

    /// Whether the spawn exited with status 0
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}
