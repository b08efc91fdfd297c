//! Typed seam over the metadata RPC data-access layer.
//!
//! The transfer engine never talks to the metadata database directly; it
//! calls these methods, which a production deployment backs with the RPC
//! client and tests back with [`MemoryDal`].

mod memory;

pub use memory::MemoryDal;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ContentResult;
use crate::types::{
    ContentBlob, ContentHash, DeltaResult, Generation, MagicHash, Node, NodeCreated, NodeId,
    ShareId, ShareInfo, StorageKey, Unlinked, UploadId, UserId, UserInfo, VolumeId,
};

/// A persisted in-progress upload row
#[derive(Debug, Clone, PartialEq)]
pub struct UploadJobRow {
    pub uploadjob_id: UploadId,
    pub multipart_key: UploadId,
    pub volume_id: VolumeId,
    pub node_id: NodeId,
    pub storage_key: StorageKey,
    pub hash_hint: ContentHash,
    pub crc32_hint: u32,
    pub inflated_size_hint: u64,
    pub previous_hash: Option<ContentHash>,
    pub uploaded_bytes: u64,
    pub chunk_count: u32,
    pub when_last_active: DateTime<Utc>,
}

/// Metadata data-access layer consumed by the transfer engine
#[async_trait]
pub trait RpcDal: Send + Sync {
    /// Fetch an authenticated user by id
    async fn get_user(&self, id: UserId) -> ContentResult<UserInfo>;

    /// Root node and current generation of the user's root volume
    async fn get_root(&self, user: UserId) -> ContentResult<(NodeId, Generation)>;

    /// Fetch a node the user may read
    async fn get_node(&self, user: UserId, volume: VolumeId, node: NodeId)
        -> ContentResult<Node>;

    /// Volume containing a node the user may read
    async fn get_volume_id(&self, user: UserId, node: NodeId) -> ContentResult<VolumeId>;

    /// Owner of a volume
    async fn get_volume_owner(&self, volume: VolumeId) -> ContentResult<UserId>;

    /// Create a file node under `parent`
    async fn make_file(
        &self,
        user: UserId,
        volume: VolumeId,
        parent: NodeId,
        name: &str,
        is_public: bool,
    ) -> ContentResult<NodeCreated>;

    /// Create a directory node under `parent`
    async fn make_dir(
        &self,
        user: UserId,
        volume: VolumeId,
        parent: NodeId,
        name: &str,
    ) -> ContentResult<NodeCreated>;

    /// Create a file node already bound to content
    #[allow(clippy::too_many_arguments)]
    async fn make_file_with_content(
        &self,
        user: UserId,
        volume: VolumeId,
        parent: NodeId,
        name: &str,
        hash: &ContentHash,
        crc32: u32,
        size: u64,
        deflated_size: u64,
        storage_key: &StorageKey,
        magic_hash: Option<&MagicHash>,
    ) -> ContentResult<NodeCreated>;

    /// Unlink a node; recursive for directories
    async fn unlink_node(
        &self,
        user: UserId,
        volume: VolumeId,
        node: NodeId,
    ) -> ContentResult<Unlinked>;

    /// Move and/or rename a node
    async fn move_node(
        &self,
        user: UserId,
        volume: VolumeId,
        node: NodeId,
        new_parent: NodeId,
        new_name: &str,
    ) -> ContentResult<Generation>;

    /// Bind `node` to freshly uploaded content, creating the blob row.
    ///
    /// Fails `Conflict` unless the node's current content hash equals
    /// `previous_hash`.
    #[allow(clippy::too_many_arguments)]
    async fn make_content(
        &self,
        user: UserId,
        volume: VolumeId,
        node: NodeId,
        previous_hash: Option<&ContentHash>,
        hash: &ContentHash,
        crc32: u32,
        size: u64,
        deflated_size: u64,
        storage_key: &StorageKey,
        magic_hash: Option<&MagicHash>,
    ) -> ContentResult<Generation>;

    /// Bind `node` to an existing blob (the dedup path)
    async fn make_content_from_blob(
        &self,
        user: UserId,
        volume: VolumeId,
        node: NodeId,
        previous_hash: Option<&ContentHash>,
        hash: &ContentHash,
    ) -> ContentResult<Generation>;

    /// Look up a blob the user is allowed to reuse.
    ///
    /// A blob is reusable when the user already owns a node carrying its
    /// hash, or when `magic_hash` matches the stored magic hash.
    async fn get_reusable_content(
        &self,
        user: UserId,
        hash: &ContentHash,
        magic_hash: Option<&MagicHash>,
    ) -> ContentResult<Option<ContentBlob>>;

    /// Free quota bytes for a user
    async fn get_free_bytes(&self, user: UserId) -> ContentResult<u64>;

    /// Fetch a share grant visible to `user`
    async fn get_share(&self, user: UserId, share: ShareId) -> ContentResult<ShareInfo>;

    /// Nodes mutated in the half-open generation range `(from, end]`
    async fn get_delta(
        &self,
        user: UserId,
        volume: VolumeId,
        from_generation: Generation,
        limit: Option<usize>,
    ) -> ContentResult<DeltaResult>;

    /// All live nodes of a volume plus its current generation
    async fn get_from_scratch(&self, user: UserId, volume: VolumeId)
        -> ContentResult<DeltaResult>;

    /// Toggle a node's public flag; returns the public URL when enabling
    async fn change_public_access(
        &self,
        user: UserId,
        volume: VolumeId,
        node: NodeId,
        is_public: bool,
    ) -> ContentResult<(Generation, Option<String>)>;

    /// All live public files owned by the user
    async fn list_public_files(&self, user: UserId) -> ContentResult<Vec<Node>>;

    /// Exact-match lookup of a resumable upload row.
    ///
    /// Any mismatch of node, hash or crc32 is `DoesNotExist`, forcing the
    /// caller to start a fresh job.
    async fn get_uploadjob(
        &self,
        user: UserId,
        volume: VolumeId,
        node: NodeId,
        upload_id: &UploadId,
        hash: &ContentHash,
        crc32: u32,
    ) -> ContentResult<UploadJobRow>;

    /// Create an upload row with zeroed progress
    #[allow(clippy::too_many_arguments)]
    async fn make_uploadjob(
        &self,
        user: UserId,
        volume: VolumeId,
        node: NodeId,
        previous_hash: Option<&ContentHash>,
        hash: &ContentHash,
        crc32: u32,
        inflated_size: u64,
        multipart_key: &UploadId,
    ) -> ContentResult<UploadJobRow>;

    /// Record `chunk_size` more bytes as durably written
    async fn add_part_to_uploadjob(
        &self,
        user: UserId,
        volume: VolumeId,
        uploadjob_id: &UploadId,
        chunk_size: u64,
    ) -> ContentResult<()>;

    /// Refresh the row's last-active timestamp
    async fn touch_uploadjob(
        &self,
        user: UserId,
        volume: VolumeId,
        uploadjob_id: &UploadId,
    ) -> ContentResult<DateTime<Utc>>;

    /// Release an upload row
    async fn delete_uploadjob(
        &self,
        user: UserId,
        volume: VolumeId,
        uploadjob_id: &UploadId,
    ) -> ContentResult<()>;

    /// Drop upload rows idle since before `last_active_before`; returns
    /// how many were removed
    async fn delete_stale_uploadjobs(
        &self,
        last_active_before: DateTime<Utc>,
    ) -> ContentResult<u64>;
}
