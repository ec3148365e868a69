//! Transports and blob transfer for the remote cache endpoint

pub mod bytestream;
pub mod channel;
pub mod grpc;
pub mod memory;
pub mod resource;
pub mod transport;

pub use bytestream::ByteStreamUploader;
pub use channel::SharedChannel;
pub use grpc::GrpcTransport;
pub use memory::{CallCounts, InMemoryTransport, WriteRecord};
pub use resource::ResourceNames;
pub use transport::{CasTransport, ReadStream, WriteChunk, WriteStatus};
