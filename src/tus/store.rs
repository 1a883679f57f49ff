//! Upload Store
//!
//! Durable byte streams for partial and completed uploads, keyed by resource
//! id. Streams are append-only from the state machine's point of view: bytes
//! land at the registered offset, and anything a failed or cancelled write
//! left beyond that offset is truncated the next time the stream is opened.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::types::{ResourceId, TusError};

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TusError>> + Send>>;

/// Attempts after the first before a transient append failure surfaces
pub const MAX_APPEND_RETRIES: u32 = 3;

/// Read size for streamed ranges: 64KB
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

// ============================================================================
// Store Traits
// ============================================================================

/// Scoped writer returned by [`UploadStore::open_for_append`].
///
/// Owns the underlying stream; dropping it closes the stream on every exit
/// path, including a cancelled request future.
#[async_trait]
pub trait AppendHandle: Send {
    /// Offset the next byte lands at
    fn position(&self) -> u64;

    /// Write `data` at `position()` and make it durable before returning
    async fn write_durable(&mut self, data: &[u8]) -> Result<(), TusError>;

    /// Discard anything past `position()` left by a failed write
    async fn rewind(&mut self) -> Result<(), TusError>;
}

/// Trait for upload storage backends
#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Create an empty stream, truncating any previous one
    async fn create(&self, id: &ResourceId) -> Result<(), TusError>;

    /// Open the stream for appending at `offset`
    async fn open_for_append(
        &self,
        id: &ResourceId,
        offset: u64,
    ) -> Result<Box<dyn AppendHandle>, TusError>;

    /// Stream bytes `start..end`
    async fn read_range(&self, id: &ResourceId, start: u64, end: u64)
        -> Result<ByteStream, TusError>;

    async fn delete(&self, id: &ResourceId) -> Result<(), TusError>;

    /// Current stream length, for consistency checks against the registry
    async fn total_length(&self, id: &ResourceId) -> Result<u64, TusError>;

    /// Append `data` durably, retrying transient failures.
    ///
    /// Returns the number of bytes written. On error the registered offset
    /// must not advance; any partial tail is the next open's to truncate.
    async fn append(
        &self,
        handle: &mut dyn AppendHandle,
        data: &[u8],
    ) -> Result<u64, TusError> {
        let mut attempt = 0;
        loop {
            match handle.write_durable(data).await {
                Ok(()) => return Ok(data.len() as u64),
                Err(e) if e.is_transient() && attempt < MAX_APPEND_RETRIES => {
                    attempt += 1;
                    tracing::warn!(
                        position = handle.position(),
                        attempt = attempt,
                        error = %e,
                        "Transient append failure, retrying"
                    );
                    handle.rewind().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem upload storage: one `<id>.bin` file per resource
#[derive(Debug, Clone)]
pub struct LocalUploadStore {
    base_path: PathBuf,
}

impl LocalUploadStore {
    /// Open a store rooted at `base_path`, creating the directory if needed
    pub async fn open(base_path: impl Into<PathBuf>) -> Result<Self, TusError> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn data_path(&self, id: &ResourceId) -> PathBuf {
        self.base_path.join(format!("{}.bin", id))
    }
}

fn not_found(id: &ResourceId) -> impl FnOnce(std::io::Error) -> TusError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            TusError::NotFound(id.to_string())
        } else {
            TusError::IoFailure(e)
        }
    }
}

#[async_trait]
impl UploadStore for LocalUploadStore {
    async fn create(&self, id: &ResourceId) -> Result<(), TusError> {
        let file = fs::File::create(self.data_path(id)).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn open_for_append(
        &self,
        id: &ResourceId,
        offset: u64,
    ) -> Result<Box<dyn AppendHandle>, TusError> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(self.data_path(id))
            .await
            .map_err(not_found(id))?;

        let len = file.metadata().await?.len();
        if len < offset {
            return Err(TusError::IoFailure(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("stored stream for {id} is {len} bytes, registry offset is {offset}"),
            )));
        }
        if len > offset {
            tracing::debug!(
                resource_id = %id,
                stray_bytes = len - offset,
                "Truncating unregistered tail"
            );
            file.set_len(offset).await?;
        }
        file.seek(SeekFrom::Start(offset)).await?;

        Ok(Box::new(LocalAppendHandle {
            file,
            position: offset,
        }))
    }

    async fn read_range(
        &self,
        id: &ResourceId,
        start: u64,
        end: u64,
    ) -> Result<ByteStream, TusError> {
        if end < start {
            return Err(TusError::BadRequest(format!(
                "invalid range: end ({end}) < start ({start})"
            )));
        }

        let mut file = fs::File::open(self.data_path(id))
            .await
            .map_err(not_found(id))?;

        let len = file.metadata().await?.len();
        if end > len {
            return Err(TusError::BadRequest(format!(
                "range end {end} beyond stored length {len}"
            )));
        }

        file.seek(SeekFrom::Start(start)).await?;
        let reader = file.take(end - start);

        let stream = futures::stream::try_unfold(reader, |mut reader| async move {
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            let n = reader.read(&mut buf).await.map_err(TusError::from)?;
            if n == 0 {
                return Ok::<_, TusError>(None);
            }
            buf.truncate(n);
            Ok(Some((Bytes::from(buf), reader)))
        });

        Ok(Box::pin(stream))
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), TusError> {
        fs::remove_file(self.data_path(id))
            .await
            .map_err(not_found(id))
    }

    async fn total_length(&self, id: &ResourceId) -> Result<u64, TusError> {
        let metadata = fs::metadata(self.data_path(id))
            .await
            .map_err(not_found(id))?;
        Ok(metadata.len())
    }
}

/// Append handle over a local file
struct LocalAppendHandle {
    file: fs::File,
    position: u64,
}

#[async_trait]
impl AppendHandle for LocalAppendHandle {
    fn position(&self) -> u64 {
        self.position
    }

    async fn write_durable(&mut self, data: &[u8]) -> Result<(), TusError> {
        self.file.write_all(data).await?;
        self.file.flush().await?;
        // Registry offset advances only after this returns
        self.file.sync_data().await?;
        self.position += data.len() as u64;
        Ok(())
    }

    async fn rewind(&mut self) -> Result<(), TusError> {
        self.file.set_len(self.position).await?;
        self.file.seek(SeekFrom::Start(self.position)).await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
