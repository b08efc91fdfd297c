use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;

use crate::config::{Clock, SystemClock};
use crate::dal::{RpcDal, UploadJobRow};
use crate::error::{ContentError, ContentResult};
use crate::types::{
    ContentBlob, ContentHash, DeltaResult, Generation, MagicHash, Node, NodeCreated, NodeId,
    NodeKind, ShareId, ShareInfo, StorageKey, Unlinked, UploadId, UserId, UserInfo, VolumeId,
};

struct UserRow {
    info: UserInfo,
    max_storage_bytes: u64,
    used_storage_bytes: u64,
}

struct VolumeRow {
    owner: UserId,
    generation: Generation,
    root_node: NodeId,
}

struct ShareRow {
    info: ShareInfo,
    grantee: UserId,
}

#[derive(Default)]
struct State {
    users: HashMap<UserId, UserRow>,
    volumes: HashMap<VolumeId, VolumeRow>,
    nodes: HashMap<NodeId, Node>,
    blobs: HashMap<String, ContentBlob>,
    uploadjobs: HashMap<String, UploadJobRow>,
    shares: HashMap<ShareId, ShareRow>,
    next_user_id: u64,
}

impl State {
    fn read_access(&self, user: UserId, volume: VolumeId) -> bool {
        match self.volumes.get(&volume) {
            Some(v) if v.owner == user => true,
            Some(_) => self
                .shares
                .values()
                .any(|s| s.grantee == user && s.info.volume_id == volume),
            None => false,
        }
    }

    fn write_access(&self, user: UserId, volume: VolumeId) -> bool {
        match self.volumes.get(&volume) {
            Some(v) if v.owner == user => true,
            Some(_) => self
                .shares
                .values()
                .any(|s| s.grantee == user && s.info.volume_id == volume && s.info.writable),
            None => false,
        }
    }

    fn bump(&mut self, volume: VolumeId) -> ContentResult<Generation> {
        let row = self
            .volumes
            .get_mut(&volume)
            .ok_or_else(|| ContentError::does_not_exist(format!("volume {volume}")))?;
        row.generation += 1;
        Ok(row.generation)
    }

    fn live_node(&self, volume: VolumeId, node: NodeId) -> ContentResult<&Node> {
        self.nodes
            .get(&node)
            .filter(|n| n.is_live && n.volume_id == volume)
            .ok_or_else(|| ContentError::does_not_exist(format!("node {node}")))
    }

    fn free_bytes_of(&self, user: UserId) -> u64 {
        self.users
            .get(&user)
            .map(|u| u.max_storage_bytes.saturating_sub(u.used_storage_bytes))
            .unwrap_or(0)
    }

    fn charge_owner(&mut self, volume: VolumeId, new_size: u64, old_size: u64) {
        if let Some(owner) = self.volumes.get(&volume).map(|v| v.owner) {
            if let Some(row) = self.users.get_mut(&owner) {
                row.used_storage_bytes =
                    row.used_storage_bytes.saturating_sub(old_size) + new_size;
            }
        }
    }

    fn attach_content(
        &mut self,
        user: UserId,
        volume: VolumeId,
        node_id: NodeId,
        previous_hash: Option<&ContentHash>,
        blob: ContentBlob,
    ) -> ContentResult<Generation> {
        if !self.write_access(user, volume) {
            return Err(ContentError::no_permission("volume is not writable"));
        }
        let node = self.live_node(volume, node_id)?;
        if node.kind != NodeKind::File {
            return Err(ContentError::no_permission(
                "cannot put content on a directory",
            ));
        }
        if node.content_hash.as_ref() != previous_hash {
            return Err(ContentError::conflict("The File changed while uploading."));
        }
        let old_size = if node.has_content() { node.size } else { 0 };
        self.charge_owner(volume, blob.size, old_size);
        let generation = self.bump(volume)?;
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| ContentError::does_not_exist(format!("node {node_id}")))?;
        node.content_hash = Some(blob.hash.clone());
        node.crc32 = blob.crc32;
        node.size = blob.size;
        node.deflated_size = blob.deflated_size;
        node.storage_key = Some(blob.storage_key.clone());
        node.generation = generation;
        Ok(generation)
    }
}

/// In-memory metadata backend for testing and development.
///
/// Implements the full `RpcDal` semantics: per-volume monotonic
/// generations, quota accounting against the volume owner, share grants,
/// blob rows with optional magic hashes, and upload rows keyed by their
/// multipart key.
pub struct MemoryDal {
    state: RwLock<State>,
    clock: Arc<dyn Clock>,
    user_fetches: AtomicU64,
    user_fetch_gate: Mutex<Option<Arc<Semaphore>>>,
    public_url_base: String,
}

impl MemoryDal {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(State::default()),
            clock,
            user_fetches: AtomicU64::new(0),
            user_fetch_gate: Mutex::new(None),
            public_url_base: "https://public.stratus.test".to_string(),
        }
    }

    /// Provision a user with a root volume and root directory
    pub fn add_user(&self, username: &str, max_storage_bytes: u64) -> UserInfo {
        let mut st = self.state.write();
        st.next_user_id += 1;
        let id = UserId(st.next_user_id);
        let volume_id = VolumeId::new();
        let root = Node {
            id: NodeId::new(),
            volume_id,
            parent_id: None,
            name: "".to_string(),
            kind: NodeKind::Directory,
            generation: 0,
            content_hash: None,
            crc32: 0,
            size: 0,
            deflated_size: 0,
            storage_key: None,
            is_public: false,
            is_live: true,
        };
        let info = UserInfo {
            id,
            root_volume_id: volume_id,
            username: username.to_string(),
            active: true,
        };
        st.volumes.insert(
            volume_id,
            VolumeRow {
                owner: id,
                generation: 0,
                root_node: root.id,
            },
        );
        st.nodes.insert(root.id, root);
        st.users.insert(
            id,
            UserRow {
                info: info.clone(),
                max_storage_bytes,
                used_storage_bytes: 0,
            },
        );
        info
    }

    /// Grant `grantee` access to `owner`'s root volume
    pub fn add_share(&self, owner: UserId, grantee: UserId, writable: bool) -> ContentResult<ShareId> {
        let mut st = self.state.write();
        let volume_id = st
            .users
            .get(&owner)
            .map(|u| u.info.root_volume_id)
            .ok_or_else(|| ContentError::does_not_exist(format!("user {owner}")))?;
        let id = ShareId::new();
        st.shares.insert(
            id,
            ShareRow {
                info: ShareInfo {
                    id,
                    owner_id: owner,
                    volume_id,
                    writable,
                },
                grantee,
            },
        );
        Ok(id)
    }

    /// Change a user's storage allowance (test helper)
    pub fn set_max_storage_bytes(&self, user: UserId, bytes: u64) {
        if let Some(row) = self.state.write().users.get_mut(&user) {
            row.max_storage_bytes = bytes;
        }
    }

    /// Mark a user active or inactive (test helper)
    pub fn set_active(&self, user: UserId, active: bool) {
        if let Some(row) = self.state.write().users.get_mut(&user) {
            row.info.active = active;
        }
    }

    /// Current snapshot of a node
    pub fn node(&self, node: NodeId) -> Option<Node> {
        self.state.read().nodes.get(&node).cloned()
    }

    /// Current blob row for a content hash
    pub fn blob(&self, hash: &ContentHash) -> Option<ContentBlob> {
        self.state.read().blobs.get(hash.as_str()).cloned()
    }

    /// Storage bytes currently charged to a user
    pub fn used_bytes(&self, user: UserId) -> u64 {
        self.state
            .read()
            .users
            .get(&user)
            .map(|u| u.used_storage_bytes)
            .unwrap_or(0)
    }

    /// Number of live upload rows
    pub fn uploadjob_count(&self) -> usize {
        self.state.read().uploadjobs.len()
    }

    /// Whether an upload row exists for this multipart key
    pub fn has_uploadjob(&self, multipart_key: &UploadId) -> bool {
        self.state
            .read()
            .uploadjobs
            .contains_key(multipart_key.as_str())
    }

    /// How many `get_user` calls have been made
    pub fn user_fetch_count(&self) -> u64 {
        self.user_fetches.load(Ordering::SeqCst)
    }

    /// Gate `get_user` calls behind a semaphore so tests can hold two
    /// callers in flight at once (test helper)
    pub fn gate_user_fetches(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.user_fetch_gate.lock() = Some(gate.clone());
        gate
    }

    fn public_url(&self, node: NodeId) -> String {
        format!("{}/{}", self.public_url_base, node)
    }
}

impl Default for MemoryDal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RpcDal for MemoryDal {
    async fn get_user(&self, id: UserId) -> ContentResult<UserInfo> {
        self.user_fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.user_fetch_gate.lock().clone();
        if let Some(sem) = gate {
            let _permit = sem
                .acquire()
                .await
                .map_err(|e| ContentError::internal(e.to_string()))?;
        }
        self.state
            .read()
            .users
            .get(&id)
            .map(|u| u.info.clone())
            .ok_or_else(|| ContentError::does_not_exist(format!("user {id}")))
    }

    async fn get_root(&self, user: UserId) -> ContentResult<(NodeId, Generation)> {
        let st = self.state.read();
        let volume_id = st
            .users
            .get(&user)
            .map(|u| u.info.root_volume_id)
            .ok_or_else(|| ContentError::does_not_exist(format!("user {user}")))?;
        let volume = st
            .volumes
            .get(&volume_id)
            .ok_or_else(|| ContentError::does_not_exist(format!("volume {volume_id}")))?;
        Ok((volume.root_node, volume.generation))
    }

    async fn get_node(
        &self,
        user: UserId,
        volume: VolumeId,
        node: NodeId,
    ) -> ContentResult<Node> {
        let st = self.state.read();
        if !st.read_access(user, volume) {
            return Err(ContentError::does_not_exist(format!("node {node}")));
        }
        st.live_node(volume, node).cloned()
    }

    async fn get_volume_id(&self, user: UserId, node: NodeId) -> ContentResult<VolumeId> {
        let st = self.state.read();
        let found = st
            .nodes
            .get(&node)
            .filter(|n| n.is_live)
            .ok_or_else(|| ContentError::does_not_exist(format!("node {node}")))?;
        if !st.read_access(user, found.volume_id) {
            return Err(ContentError::does_not_exist(format!("node {node}")));
        }
        Ok(found.volume_id)
    }

    async fn get_volume_owner(&self, volume: VolumeId) -> ContentResult<UserId> {
        self.state
            .read()
            .volumes
            .get(&volume)
            .map(|v| v.owner)
            .ok_or_else(|| ContentError::does_not_exist(format!("volume {volume}")))
    }

    async fn make_file(
        &self,
        user: UserId,
        volume: VolumeId,
        parent: NodeId,
        name: &str,
        is_public: bool,
    ) -> ContentResult<NodeCreated> {
        let mut st = self.state.write();
        if !st.write_access(user, volume) {
            return Err(ContentError::no_permission("volume is not writable"));
        }
        let parent_node = st.live_node(volume, parent)?;
        if parent_node.kind != NodeKind::Directory {
            return Err(ContentError::no_permission("parent is not a directory"));
        }
        let generation = st.bump(volume)?;
        let node = Node {
            id: NodeId::new(),
            volume_id: volume,
            parent_id: Some(parent),
            name: name.to_string(),
            kind: NodeKind::File,
            generation,
            content_hash: None,
            crc32: 0,
            size: 0,
            deflated_size: 0,
            storage_key: None,
            is_public,
            is_live: true,
        };
        let node_id = node.id;
        st.nodes.insert(node_id, node);
        Ok(NodeCreated {
            node_id,
            generation,
        })
    }

    async fn make_dir(
        &self,
        user: UserId,
        volume: VolumeId,
        parent: NodeId,
        name: &str,
    ) -> ContentResult<NodeCreated> {
        let mut st = self.state.write();
        if !st.write_access(user, volume) {
            return Err(ContentError::no_permission("volume is not writable"));
        }
        let parent_node = st.live_node(volume, parent)?;
        if parent_node.kind != NodeKind::Directory {
            return Err(ContentError::no_permission("parent is not a directory"));
        }
        let generation = st.bump(volume)?;
        let node = Node {
            id: NodeId::new(),
            volume_id: volume,
            parent_id: Some(parent),
            name: name.to_string(),
            kind: NodeKind::Directory,
            generation,
            content_hash: None,
            crc32: 0,
            size: 0,
            deflated_size: 0,
            storage_key: None,
            is_public: false,
            is_live: true,
        };
        let node_id = node.id;
        st.nodes.insert(node_id, node);
        Ok(NodeCreated {
            node_id,
            generation,
        })
    }

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
    ) -> ContentResult<NodeCreated> {
        let created = self.make_file(user, volume, parent, name, false).await?;
        let mut st = self.state.write();
        let blob = st
            .blobs
            .entry(hash.as_str().to_string())
            .or_insert_with(|| ContentBlob {
                hash: hash.clone(),
                magic_hash: magic_hash.cloned(),
                crc32,
                size,
                deflated_size,
                storage_key: storage_key.clone(),
            })
            .clone();
        let generation = st.attach_content(user, volume, created.node_id, None, blob)?;
        Ok(NodeCreated {
            node_id: created.node_id,
            generation,
        })
    }

    async fn unlink_node(
        &self,
        user: UserId,
        volume: VolumeId,
        node: NodeId,
    ) -> ContentResult<Unlinked> {
        let mut st = self.state.write();
        if !st.write_access(user, volume) {
            return Err(ContentError::no_permission("volume is not writable"));
        }
        let target = st.live_node(volume, node)?.clone();

        // Collect the subtree before mutating anything.
        let mut doomed = vec![target.id];
        let mut frontier = vec![target.id];
        while let Some(parent) = frontier.pop() {
            let children: Vec<NodeId> = st
                .nodes
                .values()
                .filter(|n| n.is_live && n.parent_id == Some(parent))
                .map(|n| n.id)
                .collect();
            doomed.extend(&children);
            frontier.extend(children);
        }

        let generation = st.bump(volume)?;
        let mut freed = 0u64;
        for id in &doomed {
            if let Some(n) = st.nodes.get_mut(id) {
                if n.has_content() {
                    freed += n.size;
                }
                n.is_live = false;
                n.generation = generation;
            }
        }
        st.charge_owner(volume, 0, freed);
        Ok(Unlinked {
            generation,
            kind: target.kind,
            name: target.name,
        })
    }

    async fn move_node(
        &self,
        user: UserId,
        volume: VolumeId,
        node: NodeId,
        new_parent: NodeId,
        new_name: &str,
    ) -> ContentResult<Generation> {
        let mut st = self.state.write();
        if !st.write_access(user, volume) {
            return Err(ContentError::no_permission("volume is not writable"));
        }
        st.live_node(volume, node)?;
        let parent_node = st.live_node(volume, new_parent)?;
        if parent_node.kind != NodeKind::Directory {
            return Err(ContentError::no_permission("parent is not a directory"));
        }
        let generation = st.bump(volume)?;
        let n = st
            .nodes
            .get_mut(&node)
            .ok_or_else(|| ContentError::does_not_exist(format!("node {node}")))?;
        n.parent_id = Some(new_parent);
        n.name = new_name.to_string();
        n.generation = generation;
        Ok(generation)
    }

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
    ) -> ContentResult<Generation> {
        let mut st = self.state.write();
        let blob = {
            let blob = st
                .blobs
                .entry(hash.as_str().to_string())
                .or_insert_with(|| ContentBlob {
                    hash: hash.clone(),
                    magic_hash: None,
                    crc32,
                    size,
                    deflated_size,
                    storage_key: storage_key.clone(),
                });
            if blob.magic_hash.is_none() {
                blob.magic_hash = magic_hash.cloned();
            }
            blob.clone()
        };
        st.attach_content(user, volume, node, previous_hash, blob)
    }

    async fn make_content_from_blob(
        &self,
        user: UserId,
        volume: VolumeId,
        node: NodeId,
        previous_hash: Option<&ContentHash>,
        hash: &ContentHash,
    ) -> ContentResult<Generation> {
        let mut st = self.state.write();
        let blob = st
            .blobs
            .get(hash.as_str())
            .cloned()
            .ok_or_else(|| ContentError::does_not_exist(format!("content blob {hash}")))?;
        st.attach_content(user, volume, node, previous_hash, blob)
    }

    async fn get_reusable_content(
        &self,
        user: UserId,
        hash: &ContentHash,
        magic_hash: Option<&MagicHash>,
    ) -> ContentResult<Option<ContentBlob>> {
        let st = self.state.read();
        let blob = match st.blobs.get(hash.as_str()) {
            Some(blob) => blob,
            None => return Ok(None),
        };
        if let (Some(supplied), Some(stored)) = (magic_hash, &blob.magic_hash) {
            if supplied == stored {
                return Ok(Some(blob.clone()));
            }
        }
        let owns_one = st.nodes.values().any(|n| {
            n.is_live
                && n.content_hash.as_ref() == Some(hash)
                && st
                    .volumes
                    .get(&n.volume_id)
                    .map(|v| v.owner == user)
                    .unwrap_or(false)
        });
        Ok(owns_one.then(|| blob.clone()))
    }

    async fn get_free_bytes(&self, user: UserId) -> ContentResult<u64> {
        let st = self.state.read();
        if !st.users.contains_key(&user) {
            return Err(ContentError::does_not_exist(format!("user {user}")));
        }
        Ok(st.free_bytes_of(user))
    }

    async fn get_share(&self, user: UserId, share: ShareId) -> ContentResult<ShareInfo> {
        let st = self.state.read();
        st.shares
            .get(&share)
            .filter(|s| s.grantee == user || s.info.owner_id == user)
            .map(|s| s.info.clone())
            .ok_or_else(|| ContentError::does_not_exist(format!("share {share}")))
    }

    async fn get_delta(
        &self,
        user: UserId,
        volume: VolumeId,
        from_generation: Generation,
        limit: Option<usize>,
    ) -> ContentResult<DeltaResult> {
        let st = self.state.read();
        if !st.read_access(user, volume) {
            return Err(ContentError::does_not_exist(format!("volume {volume}")));
        }
        let end_generation = st
            .volumes
            .get(&volume)
            .map(|v| v.generation)
            .unwrap_or(0);
        let mut nodes: Vec<Node> = st
            .nodes
            .values()
            .filter(|n| n.volume_id == volume && n.generation > from_generation)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.generation);
        if let Some(limit) = limit {
            nodes.truncate(limit);
        }
        let owner = st.volumes.get(&volume).map(|v| v.owner).unwrap_or(user);
        Ok(DeltaResult {
            nodes,
            end_generation,
            free_bytes: st.free_bytes_of(owner),
        })
    }

    async fn get_from_scratch(
        &self,
        user: UserId,
        volume: VolumeId,
    ) -> ContentResult<DeltaResult> {
        let st = self.state.read();
        if !st.read_access(user, volume) {
            return Err(ContentError::does_not_exist(format!("volume {volume}")));
        }
        let end_generation = st
            .volumes
            .get(&volume)
            .map(|v| v.generation)
            .unwrap_or(0);
        let mut nodes: Vec<Node> = st
            .nodes
            .values()
            .filter(|n| n.volume_id == volume && n.is_live)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.generation);
        let owner = st.volumes.get(&volume).map(|v| v.owner).unwrap_or(user);
        Ok(DeltaResult {
            nodes,
            end_generation,
            free_bytes: st.free_bytes_of(owner),
        })
    }

    async fn change_public_access(
        &self,
        user: UserId,
        volume: VolumeId,
        node: NodeId,
        is_public: bool,
    ) -> ContentResult<(Generation, Option<String>)> {
        let mut st = self.state.write();
        if !st.write_access(user, volume) {
            return Err(ContentError::no_permission("volume is not writable"));
        }
        let target = st.live_node(volume, node)?;
        if target.kind != NodeKind::File {
            return Err(ContentError::no_permission("only files can be public"));
        }
        let generation = st.bump(volume)?;
        let n = st
            .nodes
            .get_mut(&node)
            .ok_or_else(|| ContentError::does_not_exist(format!("node {node}")))?;
        n.is_public = is_public;
        n.generation = generation;
        let url = is_public.then(|| self.public_url(node));
        Ok((generation, url))
    }

    async fn list_public_files(&self, user: UserId) -> ContentResult<Vec<Node>> {
        let st = self.state.read();
        let mut nodes: Vec<Node> = st
            .nodes
            .values()
            .filter(|n| {
                n.is_live
                    && n.is_public
                    && n.kind == NodeKind::File
                    && st
                        .volumes
                        .get(&n.volume_id)
                        .map(|v| v.owner == user)
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    async fn get_uploadjob(
        &self,
        user: UserId,
        volume: VolumeId,
        node: NodeId,
        upload_id: &UploadId,
        hash: &ContentHash,
        crc32: u32,
    ) -> ContentResult<UploadJobRow> {
        let st = self.state.read();
        if !st.write_access(user, volume) {
            return Err(ContentError::does_not_exist(format!(
                "upload job {upload_id}"
            )));
        }
        st.uploadjobs
            .get(upload_id.as_str())
            .filter(|row| {
                row.volume_id == volume
                    && row.node_id == node
                    && &row.hash_hint == hash
                    && row.crc32_hint == crc32
            })
            .cloned()
            .ok_or_else(|| ContentError::does_not_exist(format!("upload job {upload_id}")))
    }

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
    ) -> ContentResult<UploadJobRow> {
        let mut st = self.state.write();
        if !st.write_access(user, volume) {
            return Err(ContentError::no_permission("volume is not writable"));
        }
        st.live_node(volume, node)?;
        let row = UploadJobRow {
            uploadjob_id: UploadId::new(),
            multipart_key: multipart_key.clone(),
            volume_id: volume,
            node_id: node,
            storage_key: StorageKey::new(),
            hash_hint: hash.clone(),
            crc32_hint: crc32,
            inflated_size_hint: inflated_size,
            previous_hash: previous_hash.cloned(),
            uploaded_bytes: 0,
            chunk_count: 0,
            when_last_active: self.clock.now(),
        };
        st.uploadjobs
            .insert(multipart_key.as_str().to_string(), row.clone());
        Ok(row)
    }

    async fn add_part_to_uploadjob(
        &self,
        _user: UserId,
        volume: VolumeId,
        uploadjob_id: &UploadId,
        chunk_size: u64,
    ) -> ContentResult<()> {
        let now = self.clock.now();
        let mut st = self.state.write();
        let row = st
            .uploadjobs
            .values_mut()
            .find(|r| r.uploadjob_id == *uploadjob_id && r.volume_id == volume)
            .ok_or_else(|| {
                ContentError::does_not_exist(format!("upload job {uploadjob_id}"))
            })?;
        row.uploaded_bytes += chunk_size;
        row.chunk_count += 1;
        row.when_last_active = now;
        Ok(())
    }

    async fn touch_uploadjob(
        &self,
        _user: UserId,
        volume: VolumeId,
        uploadjob_id: &UploadId,
    ) -> ContentResult<DateTime<Utc>> {
        let now = self.clock.now();
        let mut st = self.state.write();
        let row = st
            .uploadjobs
            .values_mut()
            .find(|r| r.uploadjob_id == *uploadjob_id && r.volume_id == volume)
            .ok_or_else(|| {
                ContentError::does_not_exist(format!("upload job {uploadjob_id}"))
            })?;
        row.when_last_active = now;
        Ok(now)
    }

    async fn delete_uploadjob(
        &self,
        _user: UserId,
        volume: VolumeId,
        uploadjob_id: &UploadId,
    ) -> ContentResult<()> {
        let mut st = self.state.write();
        st.uploadjobs
            .retain(|_, r| !(r.uploadjob_id == *uploadjob_id && r.volume_id == volume));
        Ok(())
    }

    async fn delete_stale_uploadjobs(
        &self,
        last_active_before: DateTime<Utc>,
    ) -> ContentResult<u64> {
        let mut st = self.state.write();
        let before = st.uploadjobs.len();
        st.uploadjobs
            .retain(|_, r| r.when_last_active >= last_active_before);
        Ok((before - st.uploadjobs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dal_with_user() -> (MemoryDal, UserInfo) {
        let dal = MemoryDal::new();
        let user = dal.add_user("fred", 1 << 20);
        (dal, user)
    }

    #[tokio::test]
    async fn test_generation_is_monotonic_per_volume() {
        let (dal, user) = dal_with_user();
        let (root, gen0) = dal.get_root(user.id).await.unwrap();
        assert_eq!(gen0, 0);

        let a = dal
            .make_file(user.id, user.root_volume_id, root, "a", false)
            .await
            .unwrap();
        let b = dal
            .make_dir(user.id, user.root_volume_id, root, "b")
            .await
            .unwrap();
        assert_eq!(a.generation, 1);
        assert_eq!(b.generation, 2);
    }

    #[tokio::test]
    async fn test_make_content_conflict_on_stale_previous_hash() {
        let (dal, user) = dal_with_user();
        let (root, _) = dal.get_root(user.id).await.unwrap();
        let created = dal
            .make_file(user.id, user.root_volume_id, root, "f", false)
            .await
            .unwrap();

        let hash = ContentHash::of(b"first");
        dal.make_content(
            user.id,
            user.root_volume_id,
            created.node_id,
            None,
            &hash,
            1,
            5,
            5,
            &StorageKey::new(),
            None,
        )
        .await
        .unwrap();

        // Second write still claiming the node is empty must conflict.
        let err = dal
            .make_content(
                user.id,
                user.root_volume_id,
                created.node_id,
                None,
                &ContentHash::of(b"second"),
                2,
                6,
                6,
                &StorageKey::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ContentError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_reusable_content_rules() {
        let (dal, alice) = dal_with_user();
        let bob = dal.add_user("bob", 1 << 20);
        let (root, _) = dal.get_root(alice.id).await.unwrap();

        let data = b"shared bytes";
        let hash = ContentHash::of(data);
        let magic = MagicHash::of(b"salt", data);
        dal.make_file_with_content(
            alice.id,
            alice.root_volume_id,
            root,
            "f",
            &hash,
            9,
            12,
            12,
            &StorageKey::new(),
            Some(&magic),
        )
        .await
        .unwrap();

        // Owner may reuse without a magic hash.
        assert!(dal
            .get_reusable_content(alice.id, &hash, None)
            .await
            .unwrap()
            .is_some());
        // Another user may not, unless the magic hash matches.
        assert!(dal
            .get_reusable_content(bob.id, &hash, None)
            .await
            .unwrap()
            .is_none());
        assert!(dal
            .get_reusable_content(bob.id, &hash, Some(&magic))
            .await
            .unwrap()
            .is_some());
        assert!(dal
            .get_reusable_content(bob.id, &hash, Some(&MagicHash::of(b"wrong", data)))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_uploadjob_lifecycle() {
        let (dal, user) = dal_with_user();
        let (root, _) = dal.get_root(user.id).await.unwrap();
        let created = dal
            .make_file(user.id, user.root_volume_id, root, "big", false)
            .await
            .unwrap();

        let hash = ContentHash::of(b"payload");
        let key = UploadId::new();
        let row = dal
            .make_uploadjob(
                user.id,
                user.root_volume_id,
                created.node_id,
                None,
                &hash,
                7,
                1_000_000,
                &key,
            )
            .await
            .unwrap();
        assert_eq!(row.uploaded_bytes, 0);
        assert_eq!(row.multipart_key, key);

        dal.add_part_to_uploadjob(user.id, user.root_volume_id, &row.uploadjob_id, 65_536)
            .await
            .unwrap();
        let found = dal
            .get_uploadjob(
                user.id,
                user.root_volume_id,
                created.node_id,
                &key,
                &hash,
                7,
            )
            .await
            .unwrap();
        assert_eq!(found.uploaded_bytes, 65_536);
        assert_eq!(found.chunk_count, 1);
        assert_eq!(found.storage_key, row.storage_key);

        // Mismatched hints force a fresh job.
        let err = dal
            .get_uploadjob(
                user.id,
                user.root_volume_id,
                created.node_id,
                &key,
                &ContentHash::of(b"other"),
                7,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ContentError::DoesNotExist(_)));

        dal.delete_uploadjob(user.id, user.root_volume_id, &row.uploadjob_id)
            .await
            .unwrap();
        assert_eq!(dal.uploadjob_count(), 0);
    }

    #[tokio::test]
    async fn test_delta_and_from_scratch() {
        let (dal, user) = dal_with_user();
        let (root, _) = dal.get_root(user.id).await.unwrap();
        let mut created = Vec::new();
        for i in 0..5 {
            created.push(
                dal.make_file(user.id, user.root_volume_id, root, &format!("f{i}"), false)
                    .await
                    .unwrap(),
            );
        }
        dal.unlink_node(user.id, user.root_volume_id, created[4].node_id)
            .await
            .unwrap();

        let delta = dal
            .get_delta(user.id, user.root_volume_id, 2, None)
            .await
            .unwrap();
        assert_eq!(delta.end_generation, 6);
        // f2, f3 and the unlinked f4 all sit past generation 2.
        assert_eq!(delta.nodes.len(), 3);
        assert!(delta.nodes.iter().any(|n| !n.is_live));

        let scratch = dal
            .get_from_scratch(user.id, user.root_volume_id)
            .await
            .unwrap();
        // root + four surviving files
        assert_eq!(scratch.nodes.len(), 5);
        assert!(scratch.nodes.iter().all(|n| n.is_live));

        let tail = dal
            .get_delta(user.id, user.root_volume_id, 6, None)
            .await
            .unwrap();
        assert!(tail.nodes.is_empty());
        assert_eq!(tail.end_generation, 6);
    }

    #[tokio::test]
    async fn test_quota_accounting_replaces_old_content() {
        let (dal, user) = dal_with_user();
        let (root, _) = dal.get_root(user.id).await.unwrap();
        let created = dal
            .make_file(user.id, user.root_volume_id, root, "f", false)
            .await
            .unwrap();

        dal.make_content(
            user.id,
            user.root_volume_id,
            created.node_id,
            None,
            &ContentHash::of(b"v1"),
            1,
            1000,
            900,
            &StorageKey::new(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(dal.used_bytes(user.id), 1000);

        let old_hash = ContentHash::of(b"v1");
        dal.make_content(
            user.id,
            user.root_volume_id,
            created.node_id,
            Some(&old_hash),
            &ContentHash::of(b"v2"),
            2,
            300,
            250,
            &StorageKey::new(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(dal.used_bytes(user.id), 300);

        dal.unlink_node(user.id, user.root_volume_id, created.node_id)
            .await
            .unwrap();
        assert_eq!(dal.used_bytes(user.id), 0);
    }

    #[tokio::test]
    async fn test_share_access() {
        let (dal, alice) = dal_with_user();
        let bob = dal.add_user("bob", 1 << 20);
        let (alice_root, _) = dal.get_root(alice.id).await.unwrap();

        // No share yet: bob can't see alice's nodes.
        assert!(dal
            .get_node(bob.id, alice.root_volume_id, alice_root)
            .await
            .is_err());

        let share = dal.add_share(alice.id, bob.id, true).unwrap();
        assert!(dal
            .get_node(bob.id, alice.root_volume_id, alice_root)
            .await
            .is_ok());
        let info = dal.get_share(bob.id, share).await.unwrap();
        assert_eq!(info.owner_id, alice.id);
        assert!(info.writable);

        dal.make_file(bob.id, alice.root_volume_id, alice_root, "from-bob", false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stale_uploadjob_reaping() {
        let (dal, user) = dal_with_user();
        let (root, _) = dal.get_root(user.id).await.unwrap();
        let created = dal
            .make_file(user.id, user.root_volume_id, root, "f", false)
            .await
            .unwrap();
        dal.make_uploadjob(
            user.id,
            user.root_volume_id,
            created.node_id,
            None,
            &ContentHash::of(b"x"),
            1,
            10,
            &UploadId::new(),
        )
        .await
        .unwrap();

        let removed = dal
            .delete_stale_uploadjobs(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 0);

        let removed = dal
            .delete_stale_uploadjobs(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }
}
