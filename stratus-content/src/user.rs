use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use stratus_blob::BlobStore;

use crate::config::ContentConfig;
use crate::dal::RpcDal;
use crate::download::DownloadJob;
use crate::error::{ContentError, ContentResult};
use crate::types::{
    ContentHash, DeltaResult, Generation, Node, NodeCreated, NodeId, ShareId, Unlinked, UploadId,
    UserId, UserInfo, VolumeId,
};
use crate::upload::{UploadHints, UploadJob};
use crate::uploadjob::{BogusUploadJob, DbUploadJob, UploadRecord};

/// Per-authenticated-session façade over the metadata layer.
///
/// One instance is shared by every concurrent request of a session (and
/// across sessions via the content manager cache), so all interior state
/// is advisory caches behind locks. Authoritative values always come from
/// the RPC layer.
pub struct User {
    dal: Arc<dyn RpcDal>,
    blobs: Arc<dyn BlobStore>,
    config: Arc<ContentConfig>,
    pub id: UserId,
    pub root_volume_id: VolumeId,
    pub username: String,
    free_bytes_cache: RwLock<HashMap<VolumeId, u64>>,
    generation_cache: RwLock<HashMap<VolumeId, Generation>>,
}

impl User {
    pub fn new(
        dal: Arc<dyn RpcDal>,
        blobs: Arc<dyn BlobStore>,
        config: Arc<ContentConfig>,
        info: UserInfo,
    ) -> Self {
        Self {
            dal,
            blobs,
            config,
            id: info.id,
            root_volume_id: info.root_volume_id,
            username: info.username,
            free_bytes_cache: RwLock::new(HashMap::new()),
            generation_cache: RwLock::new(HashMap::new()),
        }
    }

    /// The engine configuration this session runs under
    pub fn config(&self) -> &Arc<ContentConfig> {
        &self.config
    }

    fn volume_or_root(&self, volume: Option<VolumeId>) -> VolumeId {
        volume.unwrap_or(self.root_volume_id)
    }

    fn note_generation(&self, volume: VolumeId, generation: Generation) {
        self.generation_cache.write().insert(volume, generation);
    }

    /// Root node id and generation of the root volume
    pub async fn get_root(&self) -> ContentResult<(NodeId, Generation)> {
        let (node, generation) = self.dal.get_root(self.id).await?;
        self.note_generation(self.root_volume_id, generation);
        Ok((node, generation))
    }

    /// Volume containing `node`
    pub async fn get_volume_id(&self, node: NodeId) -> ContentResult<VolumeId> {
        self.dal.get_volume_id(self.id, node).await
    }

    /// Fetch a node in `volume`
    pub async fn get_node(&self, volume: Option<VolumeId>, node: NodeId) -> ContentResult<Node> {
        let volume = self.volume_or_root(volume);
        self.dal.get_node(self.id, volume, node).await
    }

    /// Create a file under `parent`
    pub async fn make_file(
        &self,
        volume: Option<VolumeId>,
        parent: NodeId,
        name: &str,
        is_public: bool,
    ) -> ContentResult<NodeCreated> {
        let volume = self.volume_or_root(volume);
        let created = self
            .dal
            .make_file(self.id, volume, parent, name, is_public)
            .await?;
        self.note_generation(volume, created.generation);
        Ok(created)
    }

    /// Create a directory under `parent`
    pub async fn make_dir(
        &self,
        volume: Option<VolumeId>,
        parent: NodeId,
        name: &str,
    ) -> ContentResult<NodeCreated> {
        let volume = self.volume_or_root(volume);
        let created = self.dal.make_dir(self.id, volume, parent, name).await?;
        self.note_generation(volume, created.generation);
        Ok(created)
    }

    /// Unlink a node; recursive for directories
    pub async fn unlink(&self, volume: Option<VolumeId>, node: NodeId) -> ContentResult<Unlinked> {
        let volume = self.volume_or_root(volume);
        let unlinked = self.dal.unlink_node(self.id, volume, node).await?;
        self.note_generation(volume, unlinked.generation);
        Ok(unlinked)
    }

    /// Move and/or rename a node
    pub async fn move_node(
        &self,
        volume: Option<VolumeId>,
        node: NodeId,
        new_parent: NodeId,
        new_name: &str,
    ) -> ContentResult<Generation> {
        let volume = self.volume_or_root(volume);
        let generation = self
            .dal
            .move_node(self.id, volume, node, new_parent, new_name)
            .await?;
        self.note_generation(volume, generation);
        Ok(generation)
    }

    /// Build the upload job for a PUT_CONTENT request.
    ///
    /// Resumes the durable record named by `upload_id` when its hints
    /// still match, falls back to a fresh record otherwise, and skips the
    /// database entirely for uploads that fit one metadata chunk.
    #[allow(clippy::too_many_arguments)]
    pub async fn get_upload_job(
        &self,
        volume: Option<VolumeId>,
        node: NodeId,
        share: Option<ShareId>,
        previous_hash: Option<ContentHash>,
        hints: UploadHints,
        upload_id: Option<UploadId>,
    ) -> ContentResult<UploadJob> {
        let volume = self.volume_or_root(volume);
        let node = self.dal.get_node(self.id, volume, node).await?;

        let record = if hints.deflated_size <= self.config.storage_chunk_size {
            UploadRecord::Transient(BogusUploadJob::new())
        } else {
            let resumed = match &upload_id {
                Some(upload_id) => {
                    match DbUploadJob::get(
                        self.dal.clone(),
                        self.id,
                        volume,
                        node.id,
                        upload_id,
                        &hints.hash,
                        hints.crc32,
                    )
                    .await
                    {
                        Ok(job) => Some(job),
                        Err(ContentError::DoesNotExist(_)) => None,
                        Err(e) => return Err(e),
                    }
                }
                None => None,
            };
            let job = match resumed {
                Some(job) => job,
                None => {
                    DbUploadJob::make(
                        self.dal.clone(),
                        self.id,
                        volume,
                        node.id,
                        previous_hash.as_ref(),
                        &hints.hash,
                        hints.crc32,
                        hints.inflated_size,
                    )
                    .await?
                }
            };
            UploadRecord::Durable(job)
        };

        Ok(UploadJob::new(
            self.dal.clone(),
            self.blobs.clone(),
            self.config.clone(),
            self.id,
            volume,
            share,
            node,
            previous_hash,
            hints,
            record,
        ))
    }

    /// Open the download job for a GET_CONTENT request
    pub async fn get_content(
        &self,
        volume: Option<VolumeId>,
        node: NodeId,
        offset: u64,
    ) -> ContentResult<DownloadJob> {
        let volume = self.volume_or_root(volume);
        DownloadJob::open(
            self.dal.clone(),
            self.blobs.clone(),
            self.id,
            volume,
            node,
            offset,
            self.config.bytes_payload,
        )
        .await
    }

    /// Free quota bytes.
    ///
    /// With a share, quota belongs to the share's owner; an inactive
    /// owner reads as gone.
    pub async fn get_free_bytes(&self, share: Option<ShareId>) -> ContentResult<u64> {
        let (volume, free) = match share {
            None => {
                let free = self.dal.get_free_bytes(self.id).await?;
                (self.root_volume_id, free)
            }
            Some(share) => {
                let share = self.dal.get_share(self.id, share).await?;
                let owner = self.dal.get_user(share.owner_id).await?;
                if !owner.active {
                    return Err(ContentError::does_not_exist(format!(
                        "user {}",
                        share.owner_id
                    )));
                }
                let free = self.dal.get_free_bytes(owner.id).await?;
                (share.volume_id, free)
            }
        };
        self.free_bytes_cache.write().insert(volume, free);
        Ok(free)
    }

    /// Node mutations in the half-open generation range `(from, end]`
    pub async fn get_delta(
        &self,
        volume: Option<VolumeId>,
        from_generation: Generation,
        limit: Option<usize>,
    ) -> ContentResult<DeltaResult> {
        let volume = self.volume_or_root(volume);
        let delta = self
            .dal
            .get_delta(self.id, volume, from_generation, limit)
            .await?;
        self.note_generation(volume, delta.end_generation);
        self.free_bytes_cache.write().insert(volume, delta.free_bytes);
        Ok(delta)
    }

    /// Every live node of the volume, for clients with no usable delta
    pub async fn get_from_scratch(
        &self,
        volume: Option<VolumeId>,
    ) -> ContentResult<DeltaResult> {
        let volume = self.volume_or_root(volume);
        let listing = self.dal.get_from_scratch(self.id, volume).await?;
        self.note_generation(volume, listing.end_generation);
        Ok(listing)
    }

    /// Toggle public access; returns the public URL when enabling
    pub async fn change_public_access(
        &self,
        volume: Option<VolumeId>,
        node: NodeId,
        is_public: bool,
    ) -> ContentResult<Option<String>> {
        let volume = self.volume_or_root(volume);
        let (generation, url) = self
            .dal
            .change_public_access(self.id, volume, node, is_public)
            .await?;
        self.note_generation(volume, generation);
        Ok(url)
    }

    /// All live public files of this user
    pub async fn list_public_files(&self) -> ContentResult<Vec<Node>> {
        self.dal.list_public_files(self.id).await
    }

    /// Last observed generation for a volume, if any (advisory)
    pub fn cached_generation(&self, volume: Option<VolumeId>) -> Option<Generation> {
        let volume = self.volume_or_root(volume);
        self.generation_cache.read().get(&volume).copied()
    }

    /// Last observed free bytes for a volume, if any (advisory)
    pub fn cached_free_bytes(&self, volume: Option<VolumeId>) -> Option<u64> {
        let volume = self.volume_or_root(volume);
        self.free_bytes_cache.read().get(&volume).copied()
    }
}
