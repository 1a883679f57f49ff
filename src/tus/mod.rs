//! Resumable Upload Engine (tus 1.0.0)
//!
//! Implements the server side of the tus protocol with:
//! - Offset-checked appends, one writer per resource
//! - Deferred upload length, checksums, and expiry
//! - Durable upload streams and registry records on the local filesystem
//!
//! Protocol Flow:
//! 1. Client creates a resource and receives its URL
//! 2. Client appends chunks with PATCH at the current offset
//! 3. After an interruption, HEAD reports the offset to resume from
//! 4. The upload completes when the offset reaches its declared length

pub mod checksum;
pub mod locks;
pub mod metadata;
pub mod registry;
pub mod service;
pub mod store;
pub mod types;

pub use checksum::{ChecksumAlgorithm, UploadChecksum, SUPPORTED_ALGORITHMS};
pub use metadata::UploadMetadata;
pub use registry::ResourceRegistry;
pub use service::{PatchOptions, TusService};
pub use store::{ByteStream, LocalUploadStore, UploadStore};
pub use types::*;
