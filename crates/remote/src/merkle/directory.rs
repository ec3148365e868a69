//! Builder for REAPI Directory hierarchies

use super::Digest;
use crate::error::{RemoteError, Result};
use crate::reapi::{self, DirectoryNode, FileNode};
use bytes::Bytes;
use prost::Message;
use std::collections::BTreeMap;
use std::path::{Component, Path};

/// A file leaf with its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Content digest of the file
    pub digest: Digest,
    /// Whether the file is executable
    pub is_executable: bool,
}

/// Mutable directory tree, hashed bottom-up by [`DirectoryBuilder::build`]
///
/// Children live in ordered maps, so the encoded `Directory` messages list
/// them sorted by name regardless of insertion order.
#[derive(Debug, Default, Clone)]
pub struct DirectoryBuilder {
    files: BTreeMap<String, FileEntry>,
    subdirs: BTreeMap<String, DirectoryBuilder>,
}

/// One encoded directory level
#[derive(Debug, Clone)]
pub struct EncodedDirectory {
    /// Decoded message
    pub message: reapi::Directory,
    /// Canonical encoding; its digest is the directory's digest
    pub bytes: Bytes,
}

/// Result of building a directory tree
#[derive(Debug, Clone)]
pub struct DirectoryTree {
    /// Root digest of the tree
    pub root_digest: Digest,
    /// Distinct directories keyed by digest, root included
    pub directories: BTreeMap<Digest, EncodedDirectory>,
}

impl DirectoryTree {
    /// The root directory message
    pub fn root(&self) -> Option<&reapi::Directory> {
        self.directories.get(&self.root_digest).map(|d| &d.message)
    }

    /// Assemble the `Tree` message describing an output directory
    pub fn to_tree(&self) -> reapi::Tree {
        reapi::Tree {
            root: self.root().cloned(),
            children: self
                .directories
                .iter()
                .filter(|(digest, _)| **digest != self.root_digest)
                .map(|(_, dir)| dir.message.clone())
                .collect(),
        }
    }
}

impl DirectoryBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file at a relative path, creating parent directories
    ///
    /// # Errors
    ///
    /// Returns `MerkleError` for empty, absolute or escaping paths and for
    /// paths that collide with an existing directory.
    pub fn add_file(
        &mut self,
        path: impl AsRef<Path>,
        digest: Digest,
        is_executable: bool,
    ) -> Result<()> {
        let path = path.as_ref();
        let mut names = normalize(path)?;
        let Some(name) = names.pop() else {
            return Err(RemoteError::merkle_error("Empty file path"));
        };
        let parent = self.directory_mut(&names, path)?;
        if parent.subdirs.contains_key(&name) {
            return Err(RemoteError::merkle_error(format!(
                "{} is both a file and a directory",
                path.display()
            )));
        }
        parent.files.insert(
            name,
            FileEntry {
                digest,
                is_executable,
            },
        );
        Ok(())
    }

    /// Ensure a (possibly empty) directory exists at a relative path
    ///
    /// # Errors
    ///
    /// Returns `MerkleError` for invalid paths or a collision with a file.
    pub fn add_directory(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let names = normalize(path)?;
        self.directory_mut(&names, path).map(|_| ())
    }

    fn directory_mut(&mut self, names: &[String], path: &Path) -> Result<&mut Self> {
        let mut current = self;
        for name in names {
            if current.files.contains_key(name) {
                return Err(RemoteError::merkle_error(format!(
                    "{} traverses file {name:?}",
                    path.display()
                )));
            }
            current = current.subdirs.entry(name.clone()).or_default();
        }
        Ok(current)
    }

    /// Build the Merkle tree and return the root digest with all directory blobs
    ///
    /// Structurally identical subdirectories encode to the same bytes and
    /// are recorded once.
    pub fn build(&self) -> DirectoryTree {
        let mut directories = BTreeMap::new();
        let root_digest = self.build_recursive(&mut directories);
        DirectoryTree {
            root_digest,
            directories,
        }
    }

    fn build_recursive(&self, directories: &mut BTreeMap<Digest, EncodedDirectory>) -> Digest {
        let directory_nodes = self
            .subdirs
            .iter()
            .map(|(name, subdir)| DirectoryNode {
                name: name.clone(),
                digest: Some(subdir.build_recursive(directories).to_proto()),
            })
            .collect();

        let file_nodes = self
            .files
            .iter()
            .map(|(name, entry)| FileNode {
                name: name.clone(),
                digest: Some(entry.digest.to_proto()),
                is_executable: entry.is_executable,
            })
            .collect();

        let message = reapi::Directory {
            files: file_nodes,
            directories: directory_nodes,
            symlinks: Vec::new(),
        };
        let bytes = Bytes::from(message.encode_to_vec());
        let digest = Digest::from_bytes(&bytes);

        directories
            .entry(digest.clone())
            .or_insert(EncodedDirectory { message, bytes });
        digest
    }

    /// Number of files in this tree
    pub fn file_count(&self) -> usize {
        self.files.len() + self.subdirs.values().map(Self::file_count).sum::<usize>()
    }
}

/// Split a relative path into directory names, rejecting anything that
/// could escape the root
fn normalize(path: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => names.push(
                name.to_str()
                    .ok_or_else(|| {
                        RemoteError::merkle_error(format!(
                            "Path {} is not valid UTF-8",
                            path.display()
                        ))
                    })?
                    .to_string(),
            ),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(RemoteError::merkle_error(format!(
                    "Path {} must be relative to the exec root",
                    path.display()
                )));
            }
        }
    }
    Ok(names)
}
