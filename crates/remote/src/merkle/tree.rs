//! Content-addressed input trees
//!
//! A [`MerkleTree`] is built once per spawn from its declared inputs. It
//! records the digest of every input path and holds every distinct blob
//! (file contents and encoded directories) needed to reconstruct the tree
//! in the CAS, keyed by digest so that duplicated content is uploaded once.

use super::directory::{DirectoryBuilder, DirectoryTree};
use super::Digest;
use crate::error::{RemoteError, Result};
use crate::reapi;
use bytes::Bytes;
use prost::Message;
use std::collections::{BTreeMap, HashMap};
use std::fs::Metadata;
use std::path::{Path, PathBuf};

/// Where an input's content comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeInput {
    /// A file on disk, resolved by the [`InputFileReader`]
    File(PathBuf),
    /// Content synthesized in memory (param files, generated manifests)
    Virtual(Bytes),
    /// A directory with no declared contents
    EmptyDirectory,
}

/// Contents and mode of one input file
#[derive(Debug, Clone)]
pub struct FileContents {
    /// File bytes
    pub data: Bytes,
    /// Whether the file has an executable bit set
    pub is_executable: bool,
}

/// Reads input files while a tree is being built
pub trait InputFileReader {
    /// Read a file's contents and mode
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be read.
    fn read(&self, path: &Path) -> std::io::Result<FileContents>;
}

/// Reads input files from the local filesystem, relative to a root
#[derive(Debug, Clone)]
pub struct LocalFileReader {
    root: PathBuf,
}

impl LocalFileReader {
    /// Resolve relative paths against `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl InputFileReader for LocalFileReader {
    fn read(&self, path: &Path) -> std::io::Result<FileContents> {
        let path = self.root.join(path);
        let metadata = std::fs::metadata(&path)?;
        let data = std::fs::read(&path)?;
        Ok(FileContents {
            data: Bytes::from(data),
            is_executable: is_executable(&metadata),
        })
    }
}

/// Whether any executable bit is set
#[cfg(unix)]
pub fn is_executable(metadata: &Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

/// Whether any executable bit is set
#[cfg(not(unix))]
pub fn is_executable(_metadata: &Metadata) -> bool {
    false
}

/// An input file placed in the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeFile {
    /// Content digest
    pub digest: Digest,
    /// Executable bit
    pub is_executable: bool,
}

/// Fully hashed input tree
#[derive(Debug, Clone)]
pub struct MerkleTree {
    directories: DirectoryTree,
    files: BTreeMap<PathBuf, TreeFile>,
    blobs: HashMap<Digest, Bytes>,
}

impl MerkleTree {
    /// Build a tree from `path -> input`
    ///
    /// # Errors
    ///
    /// Returns `IoError` if an input file cannot be read and `MerkleError`
    /// for invalid or conflicting paths.
    pub fn build(
        inputs: &BTreeMap<PathBuf, TreeInput>,
        reader: &dyn InputFileReader,
    ) -> Result<Self> {
        let mut builder = DirectoryBuilder::new();
        let mut files = BTreeMap::new();
        let mut blobs = HashMap::new();

        for (path, input) in inputs {
            let contents = match input {
                TreeInput::EmptyDirectory => {
                    builder.add_directory(path)?;
                    continue;
                }
                TreeInput::Virtual(data) => FileContents {
                    data: data.clone(),
                    is_executable: false,
                },
                TreeInput::File(source) => reader.read(source).map_err(|e| {
                    RemoteError::io_error(format!("read input {}", source.display()), e)
                })?,
            };

            let digest = Digest::from_bytes(&contents.data);
            builder.add_file(path, digest.clone(), contents.is_executable)?;
            if !digest.is_empty() {
                blobs.entry(digest.clone()).or_insert(contents.data);
            }
            files.insert(
                path.clone(),
                TreeFile {
                    digest,
                    is_executable: contents.is_executable,
                },
            );
        }

        Ok(Self::assemble(builder, files, blobs))
    }

    /// Build a tree from the contents of a directory on disk
    ///
    /// Paths in the tree are relative to `dir`; empty subdirectories are kept.
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the directory cannot be walked or a file read.
    pub fn from_directory(dir: &Path) -> Result<Self> {
        let mut builder = DirectoryBuilder::new();
        let mut files = BTreeMap::new();
        let mut blobs = HashMap::new();
        walk(dir, Path::new(""), &mut builder, &mut files, &mut blobs)?;
        Ok(Self::assemble(builder, files, blobs))
    }

    fn assemble(
        builder: DirectoryBuilder,
        files: BTreeMap<PathBuf, TreeFile>,
        mut blobs: HashMap<Digest, Bytes>,
    ) -> Self {
        let directories = builder.build();
        for (digest, dir) in &directories.directories {
            if digest.is_empty() {
                continue;
            }
            blobs
                .entry(digest.clone())
                .or_insert_with(|| dir.bytes.clone());
        }
        Self {
            directories,
            files,
            blobs,
        }
    }

    /// Digest of the root directory
    pub fn root_digest(&self) -> &Digest {
        &self.directories.root_digest
    }

    /// Per-path file digests
    pub fn files(&self) -> &BTreeMap<PathBuf, TreeFile> {
        &self.files
    }

    /// Every distinct non-empty blob of the tree
    pub fn blobs(&self) -> &HashMap<Digest, Bytes> {
        &self.blobs
    }

    /// Digests of the distinct directory levels
    pub fn directory_digests(&self) -> impl Iterator<Item = &Digest> {
        self.directories.directories.keys()
    }

    /// The `Tree` message for this tree when used as an output directory
    pub fn to_tree(&self) -> reapi::Tree {
        self.directories.to_tree()
    }

    /// Consume the tree, returning its blobs
    pub fn into_blobs(self) -> HashMap<Digest, Bytes> {
        self.blobs
    }
}

fn walk(
    root: &Path,
    rel: &Path,
    builder: &mut DirectoryBuilder,
    files: &mut BTreeMap<PathBuf, TreeFile>,
    blobs: &mut HashMap<Digest, Bytes>,
) -> Result<()> {
    let dir = root.join(rel);
    let entries = std::fs::read_dir(&dir)
        .map_err(|e| RemoteError::io_error(format!("read directory {}", dir.display()), e))?;

    let mut empty = true;
    for entry in entries {
        let entry =
            entry.map_err(|e| RemoteError::io_error(format!("read {}", dir.display()), e))?;
        let path = rel.join(entry.file_name());
        let abs = entry.path();
        // follow symlinks so outputs are materialized as plain files
        let metadata = std::fs::metadata(&abs)
            .map_err(|e| RemoteError::io_error(format!("stat {}", abs.display()), e))?;
        empty = false;

        if metadata.is_dir() {
            walk(root, &path, builder, files, blobs)?;
        } else {
            let data = std::fs::read(&abs)
                .map_err(|e| RemoteError::io_error(format!("read {}", abs.display()), e))?;
            let digest = Digest::from_bytes(&data);
            let is_executable = is_executable(&metadata);
            builder.add_file(&path, digest.clone(), is_executable)?;
            if !digest.is_empty() {
                blobs.entry(digest.clone()).or_insert_with(|| Bytes::from(data));
            }
            files.insert(
                path,
                TreeFile {
                    digest,
                    is_executable,
                },
            );
        }
    }

    if empty && !rel.as_os_str().is_empty() {
        builder.add_directory(rel)?;
    }
    Ok(())
}

/// Files and empty directories described by a `Tree` message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeLayout {
    /// Files relative to the tree root
    pub files: BTreeMap<PathBuf, TreeFile>,
    /// Directories without children, relative to the tree root
    pub empty_directories: Vec<PathBuf>,
}

impl TreeLayout {
    /// Flatten a `Tree` message into paths
    ///
    /// # Errors
    ///
    /// Returns `MerkleError` if the tree has no root, references a child
    /// directory it does not contain, or names an entry with anything but a
    /// single path component. Malformed digests are `InvalidDigest`.
    pub fn from_tree(tree: &reapi::Tree) -> Result<Self> {
        let root = tree
            .root
            .as_ref()
            .ok_or_else(|| RemoteError::merkle_error("Tree has no root directory"))?;
        let children: HashMap<Digest, &reapi::Directory> = tree
            .children
            .iter()
            .map(|child| (Digest::from_bytes(&child.encode_to_vec()), child))
            .collect();

        let mut layout = Self::default();
        layout.visit(root, PathBuf::new(), &children)?;
        Ok(layout)
    }

    fn visit(
        &mut self,
        dir: &reapi::Directory,
        prefix: PathBuf,
        children: &HashMap<Digest, &reapi::Directory>,
    ) -> Result<()> {
        if dir.files.is_empty() && dir.directories.is_empty() && !prefix.as_os_str().is_empty() {
            self.empty_directories.push(prefix.clone());
        }
        for file in &dir.files {
            let digest = Digest::from_proto_field(file.digest.as_ref(), &file.name)?;
            self.files.insert(
                entry_path(&prefix, &file.name)?,
                TreeFile {
                    digest,
                    is_executable: file.is_executable,
                },
            );
        }
        for node in &dir.directories {
            let digest = Digest::from_proto_field(node.digest.as_ref(), &node.name)?;
            let child = children.get(&digest).ok_or_else(|| {
                RemoteError::merkle_error(format!(
                    "Tree references missing directory {} ({digest})",
                    node.name
                ))
            })?;
            self.visit(child, entry_path(&prefix, &node.name)?, children)?;
        }
        Ok(())
    }
}

/// Join a `Tree` entry name onto `prefix`. Names come from the server and
/// must stay inside the directory they are listed in.
fn entry_path(prefix: &Path, name: &str) -> Result<PathBuf> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(RemoteError::merkle_error(format!(
            "Tree entry name {name:?} is not a single path component"
        )));
    }
    Ok(prefix.join(name))
}
