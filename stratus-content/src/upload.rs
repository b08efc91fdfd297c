use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use tracing::{debug, warn};

use stratus_blob::{BlobStore, WriteSink};

use crate::config::ContentConfig;
use crate::dal::RpcDal;
use crate::error::{ContentError, ContentResult};
use crate::pipeline::{HashPipeline, HashSnapshot};
use crate::types::{
    ContentHash, Generation, MagicHash, Node, NodeKind, ShareId, UploadId, UserId, VolumeId,
};
use crate::uploadjob::UploadRecord;

/// Upload-corrupt message for an inflated size that disagrees with its hint
pub const INFLATED_SIZE_MISMATCH: &str = "inflated size mismatch";
/// Upload-corrupt message for a deflated size that disagrees with its hint
pub const DEFLATED_SIZE_MISMATCH: &str = "deflated size mismatch";
/// Upload-corrupt message for a content hash that disagrees with its hint
pub const CONTENT_HASH_MISMATCH: &str = "hash mismatch";
/// Upload-corrupt message for a crc32 that disagrees with its hint
pub const CRC32_MISMATCH: &str = "crc32 mismatch";
/// Upload-corrupt message for a magic hash that disagrees with its hint
pub const MAGIC_HASH_MISMATCH: &str = "magic hash mismatch";

/// Client-supplied attributes of the content about to be uploaded
#[derive(Debug, Clone)]
pub struct UploadHints {
    pub hash: ContentHash,
    pub crc32: u32,
    pub inflated_size: u64,
    pub deflated_size: u64,
    pub magic_hash: Option<MagicHash>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum JobState {
    Created,
    Connected,
    Committed,
    Cancelled,
}

/// Per-PUT upload state machine.
///
/// Wires the upload record, the blob writer and the hash pipeline
/// together: `connect` decides between a real upload and the dedup
/// shortcut, `add_data` streams deflated bytes through digests and into
/// the writer, `commit` validates every hint and publishes the new
/// content version.
pub struct UploadJob {
    dal: Arc<dyn RpcDal>,
    blobs: Arc<dyn BlobStore>,
    config: Arc<ContentConfig>,
    user_id: UserId,
    volume_id: VolumeId,
    share: Option<ShareId>,
    node: Node,
    previous_hash: Option<ContentHash>,
    hints: UploadHints,
    record: UploadRecord,
    pipeline: HashPipeline,
    writer: Option<Box<dyn WriteSink>>,
    dedup: Option<ContentHash>,
    offset: u64,
    unflushed: u64,
    canceling: bool,
    state: JobState,
}

impl UploadJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dal: Arc<dyn RpcDal>,
        blobs: Arc<dyn BlobStore>,
        config: Arc<ContentConfig>,
        user_id: UserId,
        volume_id: VolumeId,
        share: Option<ShareId>,
        node: Node,
        previous_hash: Option<ContentHash>,
        hints: UploadHints,
        record: UploadRecord,
    ) -> Self {
        let pipeline = HashPipeline::new(&config.magic_hash_salt);
        Self {
            dal,
            blobs,
            config,
            user_id,
            volume_id,
            share,
            node,
            previous_hash,
            hints,
            record,
            pipeline,
            writer: None,
            dedup: None,
            offset: 0,
            unflushed: 0,
            canceling: false,
            state: JobState::Created,
        }
    }

    /// Resolve the upload path: dedup shortcut or a blob writer at the
    /// record's offset.
    ///
    /// Quota is enforced here, before a writer is opened or a single byte
    /// is accepted.
    pub async fn connect(&mut self) -> ContentResult<()> {
        if self.node.kind == NodeKind::Directory {
            return Err(ContentError::no_permission(
                "cannot put content on a directory",
            ));
        }

        let owner = self.dal.get_volume_owner(self.volume_id).await?;
        let free_bytes = self.dal.get_free_bytes(owner).await?;
        if self.hints.inflated_size > free_bytes {
            return Err(ContentError::QuotaExceeded {
                free_bytes,
                share: self.share,
            });
        }

        let reusable = self
            .dal
            .get_reusable_content(
                self.user_id,
                &self.hints.hash,
                self.hints.magic_hash.as_ref(),
            )
            .await?;
        if let Some(blob) = reusable {
            debug!(hash = %blob.hash, "content blob reused, skipping upload");
            self.dedup = Some(blob.hash);
            self.offset = self.hints.deflated_size;
            self.state = JobState::Connected;
            return Ok(());
        }

        let resume_from = self.record.uploaded_bytes();
        if resume_from > 0 {
            self.reprime(resume_from).await?;
            if let Err(e) = self.record.touch().await {
                warn!(error = %e, "failed to refresh upload record on resume");
            }
        }
        let sink = self
            .blobs
            .open_put(self.record.storage_key().as_str(), resume_from)
            .await
            .map_err(ContentError::try_again)?;
        self.writer = Some(sink);
        self.offset = resume_from;
        self.state = JobState::Connected;
        Ok(())
    }

    /// Feed deflated bytes in arrival order.
    ///
    /// Bytes after `cancel`/`stop` and on the dedup path are discarded
    /// silently. Failures surface on the call that hit them, so the
    /// request terminates immediately rather than at end of transfer.
    pub async fn add_data(&mut self, data: Bytes) -> ContentResult<()> {
        if self.canceling || self.state == JobState::Cancelled {
            return Ok(());
        }
        if self.dedup.is_some() {
            return Ok(());
        }

        if let Err(e) = self.pipeline.add_data(&data) {
            self.abandon().await;
            return Err(e);
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ContentError::internal("add_data before connect"))?;
        if let Err(e) = writer.write(data.clone()).await {
            // Record and partial bytes stay: the client may retry with the
            // same upload id.
            self.writer = None;
            return Err(ContentError::try_again(e));
        }

        self.unflushed += data.len() as u64;
        let chunk = self.config.storage_chunk_size;
        while self.unflushed >= chunk {
            self.record.add_part(chunk).await?;
            self.unflushed -= chunk;
        }
        Ok(())
    }

    /// Validate every hint against the streamed digests, close the writer
    /// durably and publish the new content version.
    pub async fn commit(&mut self) -> ContentResult<Generation> {
        if self.canceling || self.state == JobState::Cancelled {
            return Err(ContentError::Cancelled);
        }
        let snapshot = self.pipeline.finish()?;
        if self.dedup.is_none() {
            if let Err(e) = self.validate_hints(&snapshot) {
                self.abandon().await;
                return Err(e);
            }
        }

        let result = match &self.dedup {
            Some(hash) => {
                let hash = hash.clone();
                self.dal
                    .make_content_from_blob(
                        self.user_id,
                        self.volume_id,
                        self.node.id,
                        self.previous_hash.as_ref(),
                        &hash,
                    )
                    .await
            }
            None => {
                let writer = self
                    .writer
                    .take()
                    .ok_or_else(|| ContentError::internal("commit before connect"))?;
                if let Err(e) = writer.close().await {
                    // Durable close failed: keep the record for a retry.
                    return Err(ContentError::try_again(e));
                }
                let storage_key = self.record.storage_key().clone();
                self.dal
                    .make_content(
                        self.user_id,
                        self.volume_id,
                        self.node.id,
                        self.previous_hash.as_ref(),
                        &self.hints.hash,
                        self.hints.crc32,
                        snapshot.inflated_size,
                        snapshot.deflated_size,
                        &storage_key,
                        Some(&snapshot.magic_hash),
                    )
                    .await
            }
        };

        match result {
            Ok(generation) => {
                self.state = JobState::Committed;
                if let Err(e) = self.record.delete().await {
                    warn!(error = %e, "failed to delete upload record after commit");
                }
                Ok(generation)
            }
            Err(e) => {
                // The original failure wins; deletion trouble is only logged.
                if self.dedup.is_none() {
                    let _ = self
                        .blobs
                        .delete(self.record.storage_key().as_str())
                        .await;
                }
                if let Err(de) = self.record.delete().await {
                    warn!(error = %de, "failed to delete upload record after commit error");
                }
                self.state = JobState::Cancelled;
                Err(e)
            }
        }
    }

    /// Stop the writer, drop the partial bytes and release the record.
    ///
    /// Idempotent; bytes arriving afterwards are discarded silently.
    pub async fn cancel(&mut self) {
        if matches!(self.state, JobState::Cancelled | JobState::Committed) {
            return;
        }
        self.canceling = true;
        self.abandon().await;
    }

    /// Graceful variant of `cancel`: future `add_data` becomes a no-op
    pub fn stop(&mut self) {
        self.canceling = true;
    }

    /// Offset the client should continue from, valid after `connect`
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The client-visible resume token
    pub fn upload_id(&self) -> &UploadId {
        self.record.multipart_key()
    }

    /// Whether this upload is served from an existing blob
    pub fn is_deduped(&self) -> bool {
        self.dedup.is_some()
    }

    /// Whether `stop` or `cancel` has been requested
    pub fn canceling(&self) -> bool {
        self.canceling
    }

    /// The node this upload targets
    pub fn node(&self) -> &Node {
        &self.node
    }

    fn validate_hints(&self, snapshot: &HashSnapshot) -> ContentResult<()> {
        if snapshot.inflated_size != self.hints.inflated_size {
            return Err(ContentError::UploadCorrupt(INFLATED_SIZE_MISMATCH));
        }
        if snapshot.deflated_size != self.hints.deflated_size {
            return Err(ContentError::UploadCorrupt(DEFLATED_SIZE_MISMATCH));
        }
        if snapshot.content_hash != self.hints.hash {
            return Err(ContentError::UploadCorrupt(CONTENT_HASH_MISMATCH));
        }
        if snapshot.crc32 != self.hints.crc32 {
            return Err(ContentError::UploadCorrupt(CRC32_MISMATCH));
        }
        if let Some(magic) = &self.hints.magic_hash {
            if *magic != snapshot.magic_hash {
                return Err(ContentError::UploadCorrupt(MAGIC_HASH_MISMATCH));
            }
        }
        Ok(())
    }

    /// Re-feed the digests with the partial blob so a resumed upload
    /// hashes from byte zero.
    async fn reprime(&mut self, upto: u64) -> ContentResult<()> {
        let mut source = self
            .blobs
            .open_get(self.record.storage_key().as_str())
            .await
            .map_err(ContentError::try_again)?;
        let mut remaining = upto as usize;
        while remaining > 0 {
            match source.stream.next().await {
                Some(Ok(chunk)) => {
                    let take = chunk.len().min(remaining);
                    self.pipeline.add_data(&chunk[..take])?;
                    remaining -= take;
                }
                Some(Err(e)) => return Err(ContentError::try_again(e)),
                None => {
                    return Err(ContentError::try_again(std::io::Error::other(
                        "partial upload is shorter than its record",
                    )))
                }
            }
        }
        Ok(())
    }

    async fn abandon(&mut self) {
        self.writer = None;
        if self.dedup.is_none() {
            let _ = self
                .blobs
                .delete(self.record.storage_key().as_str())
                .await;
        }
        if let Err(e) = self.record.delete().await {
            warn!(error = %e, "failed to delete upload record");
        }
        self.state = JobState::Cancelled;
    }
}
