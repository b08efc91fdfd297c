use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::{BlobError, BlobResult, BlobStore, ByteStream, ReadSource, WriteSink};

const READ_CHUNK: usize = 64 * 1024;

/// In-memory backend for testing and development
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: Arc::new(RwLock::new(HashMap::new())),
            fail_writes: Arc::new(AtomicBool::new(false)),
            fail_reads: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of stored blobs (partial writes included)
    pub fn blob_count(&self) -> usize {
        self.blobs.read().len()
    }

    /// Raw bytes currently stored under `key`, if any
    pub fn blob_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.read().get(key).cloned()
    }

    /// Make every subsequent sink write fail (test helper)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent read yield an error (test helper)
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn open_put(&self, key: &str, offset: u64) -> BlobResult<Box<dyn WriteSink>> {
        let mut blobs = self.blobs.write();
        let buf = blobs.entry(key.to_string()).or_default();
        if (buf.len() as u64) < offset {
            return Err(BlobError::invalid(format!(
                "blob {} has {} bytes, cannot resume at {}",
                key,
                buf.len(),
                offset
            )));
        }
        buf.truncate(offset as usize);
        Ok(Box::new(MemoryWriteSink {
            blobs: self.blobs.clone(),
            fail_writes: self.fail_writes.clone(),
            key: key.to_string(),
        }))
    }

    async fn open_get(&self, key: &str) -> BlobResult<ReadSource> {
        let data = self
            .blobs
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| BlobError::not_found(key))?;
        let size_bytes = data.len() as u64;
        let fail = self.fail_reads.clone();
        let stream: ByteStream = Box::pin(async_stream::stream! {
            if fail.load(Ordering::SeqCst) {
                yield Err(std::io::Error::other("simulated read failure"));
                return;
            }
            for chunk in data.chunks(READ_CHUNK) {
                yield Ok(Bytes::copy_from_slice(chunk));
            }
        });
        Ok(ReadSource { stream, size_bytes })
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        self.blobs.write().remove(key);
        Ok(())
    }
}

struct MemoryWriteSink {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
    key: String,
}

#[async_trait]
impl WriteSink for MemoryWriteSink {
    async fn write(&mut self, chunk: Bytes) -> BlobResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BlobError::backend(std::io::Error::other(
                "simulated write failure",
            )));
        }
        // Write through so partial blobs are readable for resumption.
        let mut blobs = self.blobs.write();
        blobs.entry(self.key.clone()).or_default().extend_from_slice(&chunk);
        Ok(())
    }

    async fn close(self: Box<Self>) -> BlobResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BlobError::backend(std::io::Error::other(
                "simulated close failure",
            )));
        }
        Ok(())
    }
}
