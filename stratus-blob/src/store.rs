use async_trait::async_trait;
use bytes::Bytes;

use crate::{BlobResult, ReadSource};

/// Core blob storage operations - must be implemented by all storage backends
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Open a write sink at `key`.
    ///
    /// `offset` is the number of already-stored bytes to keep: 0 starts a
    /// fresh blob, a positive value reopens a partial blob for resumption
    /// and discards anything past the offset. Fails if fewer than `offset`
    /// bytes are present.
    async fn open_put(&self, key: &str, offset: u64) -> BlobResult<Box<dyn WriteSink>>;

    /// Open the blob at `key` for streaming reads
    async fn open_get(&self, key: &str) -> BlobResult<ReadSource>;

    /// Delete the blob at `key`; missing blobs are not an error
    async fn delete(&self, key: &str) -> BlobResult<()>;
}

/// Byte consumer for an in-progress blob write.
///
/// Written bytes are visible to readers of the same key before `close`,
/// which is what a resumed upload reads back; durability is only promised
/// once `close` returns. Dropping a sink without closing abandons the
/// write but keeps the partial bytes.
#[async_trait]
pub trait WriteSink: Send {
    /// Append a chunk; suspends under backend backpressure
    async fn write(&mut self, chunk: Bytes) -> BlobResult<()>;

    /// Flush and make the blob durable
    async fn close(self: Box<Self>) -> BlobResult<()>;
}
