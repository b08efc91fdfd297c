use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use uuid::Uuid;

/// Per-volume monotonic mutation counter
pub type Generation = u64;

/// Unique identifier for a node (file or directory)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Generate a new unique node ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeId(pub Uuid);

impl VolumeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VolumeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a storage user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a share grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShareId(pub Uuid);

impl ShareId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ShareId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-visible resume token for an upload (the multipart key)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(pub String);

impl UploadId {
    /// Generate a new random upload ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle for blob retrieval, minted by the metadata layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageKey(pub String);

impl StorageKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for StorageKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content hash of the inflated plaintext, formatted `sha1:<40 hex>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
    /// Hash of `data`
    pub fn of(data: &[u8]) -> Self {
        let mut sha = Sha1::new();
        sha.update(data);
        Self::from_digest(sha.finalize().into())
    }

    /// Wrap a raw sha1 digest
    pub fn from_digest(digest: [u8; 20]) -> Self {
        Self(format!("sha1:{}", hex::encode(digest)))
    }

    /// Hash of the empty plaintext
    pub fn empty_file() -> Self {
        Self::of(b"")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Secondary hash over a private salt plus the plaintext.
///
/// Supplying it proves possession of the plaintext, which is what allows a
/// blob to be reused across users.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MagicHash(pub String);

impl MagicHash {
    /// Hash of `salt || data`
    pub fn of(salt: &[u8], data: &[u8]) -> Self {
        let mut sha = Sha1::new();
        sha.update(salt);
        sha.update(data);
        Self(format!("sha1:{}", hex::encode(sha.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MagicHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Directory,
}

/// A metadata node as seen by the transfer engine.
///
/// Owned by the metadata layer; the engine treats it as a value snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub volume_id: VolumeId,
    pub parent_id: Option<NodeId>,
    pub name: String,
    pub kind: NodeKind,
    pub generation: Generation,
    pub content_hash: Option<ContentHash>,
    pub crc32: u32,
    pub size: u64,
    pub deflated_size: u64,
    pub storage_key: Option<StorageKey>,
    pub is_public: bool,
    pub is_live: bool,
}

impl Node {
    /// Whether the node currently points at stored content
    pub fn has_content(&self) -> bool {
        self.content_hash.is_some() && self.storage_key.is_some()
    }
}

/// A content blob row in the blob registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlob {
    pub hash: ContentHash,
    pub magic_hash: Option<MagicHash>,
    pub crc32: u32,
    pub size: u64,
    pub deflated_size: u64,
    pub storage_key: StorageKey,
}

/// An authenticated storage user as returned by the metadata layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: UserId,
    pub root_volume_id: VolumeId,
    pub username: String,
    pub active: bool,
}

/// A share grant: `user` may operate inside `volume` owned by `owner`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareInfo {
    pub id: ShareId,
    pub owner_id: UserId,
    pub volume_id: VolumeId,
    pub writable: bool,
}

/// Result of creating a node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCreated {
    pub node_id: NodeId,
    pub generation: Generation,
}

/// Result of unlinking a node
#[derive(Debug, Clone, PartialEq)]
pub struct Unlinked {
    pub generation: Generation,
    pub kind: NodeKind,
    pub name: String,
}

/// A delta or from-scratch listing plus its end generation
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaResult {
    pub nodes: Vec<Node>,
    pub end_generation: Generation,
    pub free_bytes: u64,
}
