//! Collecting a spawn's declared outputs for upload

use crate::error::{RemoteError, Result};
use crate::merkle::tree::is_executable;
use crate::merkle::{Digest, MerkleTree};
use crate::reapi::{OutputDirectory, OutputFile};
use bytes::Bytes;
use prost::Message;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Output entries for an `ActionResult` and the blobs they reference
#[derive(Debug, Default)]
pub(crate) struct CollectedOutputs {
    pub files: Vec<OutputFile>,
    pub directories: Vec<OutputDirectory>,
    pub blobs: HashMap<Digest, Bytes>,
}

/// Stat every declared output under `exec_root`
///
/// Files become `OutputFile`s, directories become `OutputDirectory`s backed
/// by a `Tree` blob. Declared outputs that were not produced are skipped.
pub(crate) fn collect_outputs(exec_root: &Path, outputs: &[PathBuf]) -> Result<CollectedOutputs> {
    let mut collected = CollectedOutputs::default();
    let declared: BTreeSet<&PathBuf> = outputs.iter().collect();

    for path in declared {
        let name = path.to_str().ok_or_else(|| {
            RemoteError::config_error(format!("output path {} is not valid UTF-8", path.display()))
        })?;
        let full = exec_root.join(path);
        let metadata = match std::fs::metadata(&full) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Declared output was not produced");
                continue;
            }
            Err(e) => return Err(RemoteError::io_error(format!("stat {}", full.display()), e)),
        };

        if metadata.is_dir() {
            let tree = MerkleTree::from_directory(&full)?;
            for file in tree.files().values() {
                if let Some(data) = tree.blobs().get(&file.digest) {
                    collected.blobs.insert(file.digest.clone(), data.clone());
                }
            }
            let tree_bytes = Bytes::from(tree.to_tree().encode_to_vec());
            let tree_digest = Digest::from_bytes(&tree_bytes);
            collected.blobs.insert(tree_digest.clone(), tree_bytes);
            collected.directories.push(OutputDirectory {
                path: name.to_string(),
                tree_digest: Some(tree_digest.to_proto()),
            });
        } else {
            let data = std::fs::read(&full)
                .map_err(|e| RemoteError::io_error(format!("read {}", full.display()), e))?;
            let digest = Digest::from_bytes(&data);
            if !digest.is_empty() {
                collected.blobs.insert(digest.clone(), Bytes::from(data));
            }
            collected.files.push(OutputFile {
                path: name.to_string(),
                digest: Some(digest.to_proto()),
                is_executable: is_executable(&metadata),
            });
        }
    }

    Ok(collected)
}
