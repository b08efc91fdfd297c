use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::dal::RpcDal;
use crate::error::ContentResult;
use crate::types::{ContentHash, NodeId, StorageKey, UploadId, UserId, VolumeId};

/// A resumable upload record persisted through the metadata layer.
///
/// The row is exclusively owned by one upload job for its lifetime; the
/// `multipart_key` doubles as the client-visible resume token.
pub struct DbUploadJob {
    dal: Arc<dyn RpcDal>,
    user_id: UserId,
    volume_id: VolumeId,
    node_id: NodeId,
    uploadjob_id: UploadId,
    multipart_key: UploadId,
    storage_key: StorageKey,
    uploaded_bytes: u64,
    chunk_count: u32,
    when_last_active: DateTime<Utc>,
}

impl DbUploadJob {
    /// Create a fresh record with zeroed progress
    #[allow(clippy::too_many_arguments)]
    pub async fn make(
        dal: Arc<dyn RpcDal>,
        user: UserId,
        volume: VolumeId,
        node: NodeId,
        previous_hash: Option<&ContentHash>,
        hash: &ContentHash,
        crc32: u32,
        inflated_size: u64,
    ) -> ContentResult<Self> {
        let multipart_key = UploadId::new();
        let row = dal
            .make_uploadjob(
                user,
                volume,
                node,
                previous_hash,
                hash,
                crc32,
                inflated_size,
                &multipart_key,
            )
            .await?;
        Ok(Self::from_row(dal, user, row))
    }

    /// Exact-match lookup for the resume path; hint mismatches are
    /// `DoesNotExist`
    pub async fn get(
        dal: Arc<dyn RpcDal>,
        user: UserId,
        volume: VolumeId,
        node: NodeId,
        upload_id: &UploadId,
        hash: &ContentHash,
        crc32: u32,
    ) -> ContentResult<Self> {
        let row = dal
            .get_uploadjob(user, volume, node, upload_id, hash, crc32)
            .await?;
        Ok(Self::from_row(dal, user, row))
    }

    fn from_row(dal: Arc<dyn RpcDal>, user: UserId, row: crate::dal::UploadJobRow) -> Self {
        Self {
            dal,
            user_id: user,
            volume_id: row.volume_id,
            node_id: row.node_id,
            uploadjob_id: row.uploadjob_id,
            multipart_key: row.multipart_key,
            storage_key: row.storage_key,
            uploaded_bytes: row.uploaded_bytes,
            chunk_count: row.chunk_count,
            when_last_active: row.when_last_active,
        }
    }

    pub async fn add_part(&mut self, chunk_size: u64) -> ContentResult<()> {
        self.dal
            .add_part_to_uploadjob(self.user_id, self.volume_id, &self.uploadjob_id, chunk_size)
            .await?;
        self.uploaded_bytes += chunk_size;
        self.chunk_count += 1;
        Ok(())
    }

    pub async fn touch(&mut self) -> ContentResult<()> {
        self.when_last_active = self
            .dal
            .touch_uploadjob(self.user_id, self.volume_id, &self.uploadjob_id)
            .await?;
        Ok(())
    }

    pub async fn delete(&self) -> ContentResult<()> {
        self.dal
            .delete_uploadjob(self.user_id, self.volume_id, &self.uploadjob_id)
            .await
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn when_last_active(&self) -> DateTime<Utc> {
        self.when_last_active
    }
}

/// The not-going-to-the-database record used when a whole upload fits in
/// one metadata chunk: same surface, no row.
pub struct BogusUploadJob {
    multipart_key: UploadId,
    storage_key: StorageKey,
}

impl BogusUploadJob {
    pub fn new() -> Self {
        Self {
            multipart_key: UploadId::new(),
            storage_key: StorageKey::new(),
        }
    }
}

impl Default for BogusUploadJob {
    fn default() -> Self {
        Self::new()
    }
}

/// Record handle held by an upload job.
///
/// Kept as an explicit enum rather than trait objects so the transient
/// variant stays visibly a no-op.
pub enum UploadRecord {
    Durable(DbUploadJob),
    Transient(BogusUploadJob),
}

impl UploadRecord {
    /// The client-visible resume token
    pub fn multipart_key(&self) -> &UploadId {
        match self {
            UploadRecord::Durable(job) => &job.multipart_key,
            UploadRecord::Transient(job) => &job.multipart_key,
        }
    }

    /// The blob-store key this upload writes to
    pub fn storage_key(&self) -> &StorageKey {
        match self {
            UploadRecord::Durable(job) => &job.storage_key,
            UploadRecord::Transient(job) => &job.storage_key,
        }
    }

    /// Bytes already committed to the blob writer in earlier sessions
    pub fn uploaded_bytes(&self) -> u64 {
        match self {
            UploadRecord::Durable(job) => job.uploaded_bytes,
            UploadRecord::Transient(_) => 0,
        }
    }

    /// Whether this record survives reconnects
    pub fn is_durable(&self) -> bool {
        matches!(self, UploadRecord::Durable(_))
    }

    pub async fn add_part(&mut self, chunk_size: u64) -> ContentResult<()> {
        match self {
            UploadRecord::Durable(job) => job.add_part(chunk_size).await,
            UploadRecord::Transient(_) => Ok(()),
        }
    }

    pub async fn touch(&mut self) -> ContentResult<()> {
        match self {
            UploadRecord::Durable(job) => job.touch().await,
            UploadRecord::Transient(_) => Ok(()),
        }
    }

    pub async fn delete(&self) -> ContentResult<()> {
        match self {
            UploadRecord::Durable(job) => job.delete().await,
            UploadRecord::Transient(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::MemoryDal;
    use crate::types::ContentHash;

    async fn fixture() -> (Arc<MemoryDal>, UserId, VolumeId, NodeId) {
        let dal = Arc::new(MemoryDal::new());
        let user = dal.add_user("fred", 1 << 20);
        let (root, _) = dal.get_root(user.id).await.unwrap();
        let created = dal
            .make_file(user.id, user.root_volume_id, root, "big", false)
            .await
            .unwrap();
        (dal, user.id, user.root_volume_id, created.node_id)
    }

    #[tokio::test]
    async fn test_make_then_get_roundtrip() {
        let (dal, user, volume, node) = fixture().await;
        let hash = ContentHash::of(b"data");

        let made = DbUploadJob::make(dal.clone(), user, volume, node, None, &hash, 5, 1_000)
            .await
            .unwrap();
        let got = DbUploadJob::get(
            dal.clone(),
            user,
            volume,
            node,
            &made.multipart_key,
            &hash,
            5,
        )
        .await
        .unwrap();

        assert_eq!(got.multipart_key, made.multipart_key);
        assert_eq!(got.storage_key, made.storage_key);
        assert_eq!(got.uploaded_bytes, 0);
    }

    #[tokio::test]
    async fn test_add_part_accumulates() {
        let (dal, user, volume, node) = fixture().await;
        let hash = ContentHash::of(b"data");
        let mut record = UploadRecord::Durable(
            DbUploadJob::make(dal.clone(), user, volume, node, None, &hash, 5, 1_000)
                .await
                .unwrap(),
        );

        record.add_part(65_536).await.unwrap();
        record.add_part(65_536).await.unwrap();
        assert_eq!(record.uploaded_bytes(), 131_072);

        let key = record.multipart_key().clone();
        let got = DbUploadJob::get(dal.clone(), user, volume, node, &key, &hash, 5)
            .await
            .unwrap();
        assert_eq!(got.uploaded_bytes, 131_072);
        assert_eq!(got.chunk_count, 2);
    }

    #[tokio::test]
    async fn test_delete_releases_row() {
        let (dal, user, volume, node) = fixture().await;
        let hash = ContentHash::of(b"data");
        let record = UploadRecord::Durable(
            DbUploadJob::make(dal.clone(), user, volume, node, None, &hash, 5, 1_000)
                .await
                .unwrap(),
        );
        let key = record.multipart_key().clone();

        record.delete().await.unwrap();
        assert!(!dal.has_uploadjob(&key));
        assert!(
            DbUploadJob::get(dal.clone(), user, volume, node, &key, &hash, 5)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_transient_record_touches_nothing() {
        let (dal, ..) = fixture().await;
        let mut record = UploadRecord::Transient(BogusUploadJob::new());

        assert_eq!(record.uploaded_bytes(), 0);
        assert!(!record.is_durable());
        record.add_part(123).await.unwrap();
        record.touch().await.unwrap();
        record.delete().await.unwrap();
        assert_eq!(record.uploaded_bytes(), 0);
        assert_eq!(dal.uploadjob_count(), 0);
    }
}
