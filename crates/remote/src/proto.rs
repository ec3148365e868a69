//! Protobuf message types for the REAPI subset this client speaks
//!
//! These mirror `build/bazel/remote/execution/v2/remote_execution.proto` and
//! `google/bytestream/bytestream.proto` field for field (same tags), so the
//! encodings are wire compatible with any REAPI server. Only the messages and
//! fields used by the cache client are declared; unknown fields sent by a
//! server are skipped by prost on decode.

#![allow(missing_docs)]

/// `build.bazel.remote.execution.v2` messages
pub mod reapi {
    /// Content digest: lowercase hex SHA-256 plus size in bytes
    #[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
    pub struct Digest {
        #[prost(string, tag = "1")]
        pub hash: ::prost::alloc::string::String,
        #[prost(int64, tag = "2")]
        pub size_bytes: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct FileNode {
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        #[prost(message, optional, tag = "2")]
        pub digest: ::core::option::Option<Digest>,
        #[prost(bool, tag = "4")]
        pub is_executable: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DirectoryNode {
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        #[prost(message, optional, tag = "2")]
        pub digest: ::core::option::Option<Digest>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SymlinkNode {
        #[prost(string, tag = "1")]
        pub name: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub target: ::prost::alloc::string::String,
    }

    /// A directory level in a Merkle tree; entries sorted by name
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Directory {
        #[prost(message, repeated, tag = "1")]
        pub files: ::prost::alloc::vec::Vec<FileNode>,
        #[prost(message, repeated, tag = "2")]
        pub directories: ::prost::alloc::vec::Vec<DirectoryNode>,
        #[prost(message, repeated, tag = "3")]
        pub symlinks: ::prost::alloc::vec::Vec<SymlinkNode>,
    }

    /// A whole directory tree in one blob, used for output directories
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Tree {
        #[prost(message, optional, tag = "1")]
        pub root: ::core::option::Option<Directory>,
        #[prost(message, repeated, tag = "2")]
        pub children: ::prost::alloc::vec::Vec<Directory>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Platform {
        #[prost(message, repeated, tag = "1")]
        pub properties: ::prost::alloc::vec::Vec<platform::Property>,
    }

    /// Nested message types of [`Platform`]
    pub mod platform {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Property {
            #[prost(string, tag = "1")]
            pub name: ::prost::alloc::string::String,
            #[prost(string, tag = "2")]
            pub value: ::prost::alloc::string::String,
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Command {
        #[prost(string, repeated, tag = "1")]
        pub arguments: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
        #[prost(message, repeated, tag = "2")]
        pub environment_variables: ::prost::alloc::vec::Vec<command::EnvironmentVariable>,
        #[prost(message, optional, tag = "5")]
        pub platform: ::core::option::Option<Platform>,
        #[prost(string, tag = "6")]
        pub working_directory: ::prost::alloc::string::String,
        #[prost(string, repeated, tag = "7")]
        pub output_paths: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    }

    /// Nested message types of [`Command`]
    pub mod command {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct EnvironmentVariable {
            #[prost(string, tag = "1")]
            pub name: ::prost::alloc::string::String,
            #[prost(string, tag = "2")]
            pub value: ::prost::alloc::string::String,
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Action {
        #[prost(message, optional, tag = "1")]
        pub command_digest: ::core::option::Option<Digest>,
        #[prost(message, optional, tag = "2")]
        pub input_root_digest: ::core::option::Option<Digest>,
        #[prost(message, optional, tag = "6")]
        pub timeout: ::core::option::Option<::prost_types::Duration>,
        #[prost(bool, tag = "7")]
        pub do_not_cache: bool,
        #[prost(bytes = "vec", tag = "9")]
        pub salt: ::prost::alloc::vec::Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct OutputFile {
        #[prost(string, tag = "1")]
        pub path: ::prost::alloc::string::String,
        #[prost(message, optional, tag = "2")]
        pub digest: ::core::option::Option<Digest>,
        #[prost(bool, tag = "4")]
        pub is_executable: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct OutputDirectory {
        #[prost(string, tag = "1")]
        pub path: ::prost::alloc::string::String,
        #[prost(message, optional, tag = "3")]
        pub tree_digest: ::core::option::Option<Digest>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ActionResult {
        #[prost(message, repeated, tag = "2")]
        pub output_files: ::prost::alloc::vec::Vec<OutputFile>,
        #[prost(message, repeated, tag = "3")]
        pub output_directories: ::prost::alloc::vec::Vec<OutputDirectory>,
        #[prost(int32, tag = "4")]
        pub exit_code: i32,
        #[prost(bytes = "vec", tag = "5")]
        pub stdout_raw: ::prost::alloc::vec::Vec<u8>,
        #[prost(message, optional, tag = "6")]
        pub stdout_digest: ::core::option::Option<Digest>,
        #[prost(bytes = "vec", tag = "7")]
        pub stderr_raw: ::prost::alloc::vec::Vec<u8>,
        #[prost(message, optional, tag = "8")]
        pub stderr_digest: ::core::option::Option<Digest>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct FindMissingBlobsRequest {
        #[prost(string, tag = "1")]
        pub instance_name: ::prost::alloc::string::String,
        #[prost(message, repeated, tag = "2")]
        pub blob_digests: ::prost::alloc::vec::Vec<Digest>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct FindMissingBlobsResponse {
        #[prost(message, repeated, tag = "2")]
        pub missing_blob_digests: ::prost::alloc::vec::Vec<Digest>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetActionResultRequest {
        #[prost(string, tag = "1")]
        pub instance_name: ::prost::alloc::string::String,
        #[prost(message, optional, tag = "2")]
        pub action_digest: ::core::option::Option<Digest>,
        #[prost(bool, tag = "3")]
        pub inline_stdout: bool,
        #[prost(bool, tag = "4")]
        pub inline_stderr: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct UpdateActionResultRequest {
        #[prost(string, tag = "1")]
        pub instance_name: ::prost::alloc::string::String,
        #[prost(message, optional, tag = "2")]
        pub action_digest: ::core::option::Option<Digest>,
        #[prost(message, optional, tag = "3")]
        pub action_result: ::core::option::Option<ActionResult>,
    }
}

/// `google.bytestream` messages
pub mod bytestream {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ReadRequest {
        #[prost(string, tag = "1")]
        pub resource_name: ::prost::alloc::string::String,
        #[prost(int64, tag = "2")]
        pub read_offset: i64,
        #[prost(int64, tag = "3")]
        pub read_limit: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ReadResponse {
        #[prost(bytes = "bytes", tag = "10")]
        pub data: ::prost::bytes::Bytes,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct WriteRequest {
        #[prost(string, tag = "1")]
        pub resource_name: ::prost::alloc::string::String,
        #[prost(int64, tag = "2")]
        pub write_offset: i64,
        #[prost(bool, tag = "3")]
        pub finish_write: bool,
        #[prost(bytes = "bytes", tag = "10")]
        pub data: ::prost::bytes::Bytes,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct WriteResponse {
        #[prost(int64, tag = "1")]
        pub committed_size: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct QueryWriteStatusRequest {
        #[prost(string, tag = "1")]
        pub resource_name: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct QueryWriteStatusResponse {
        #[prost(int64, tag = "1")]
        pub committed_size: i64,
        #[prost(bool, tag = "2")]
        pub complete: bool,
    }
}
