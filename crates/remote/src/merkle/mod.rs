//! Merkle tree construction for REAPI Directory protos

pub mod digest;
pub mod directory;
pub mod tree;

pub use digest::{Digest, EMPTY_DIGEST_HASH};
pub use directory::{DirectoryBuilder, DirectoryTree, FileEntry};
pub use tree::{
    FileContents, InputFileReader, LocalFileReader, MerkleTree, TreeFile, TreeInput, TreeLayout,
};
