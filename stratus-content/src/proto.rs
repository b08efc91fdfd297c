//! Typed request and response payloads of the transfer protocol.
//!
//! Framing, authentication and message dispatch live in the protocol
//! server outside this crate; the controllers consume and produce these
//! values only.

use bytes::Bytes;

use crate::error::WireError;
use crate::types::{ContentHash, Generation, MagicHash, NodeId, ShareId, UploadId, VolumeId};

/// PUT_CONTENT request payload
#[derive(Debug, Clone, PartialEq)]
pub struct PutContentRequest {
    pub volume: VolumeId,
    pub node: NodeId,
    /// Set when the request addresses a volume shared by another user
    pub share: Option<ShareId>,
    /// Hash the client believes the node currently holds; `None` for a
    /// node without content
    pub previous_hash: Option<ContentHash>,
    pub hash: ContentHash,
    pub crc32: u32,
    pub size: u64,
    pub deflated_size: u64,
    pub magic_hash: Option<MagicHash>,
    /// Resume token from an earlier BEGIN_CONTENT, if any
    pub upload_id: Option<UploadId>,
}

/// GET_CONTENT request payload
#[derive(Debug, Clone, PartialEq)]
pub struct GetContentRequest {
    pub volume: VolumeId,
    pub node: NodeId,
    pub share: Option<ShareId>,
    pub hash: Option<ContentHash>,
    pub offset: u64,
}

/// BEGIN_CONTENT payload.
///
/// Uploads carry `offset` and `upload_id`; downloads carry the content
/// attributes. The remaining fields ride along with protocol defaults.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BeginContent {
    pub offset: u64,
    pub upload_id: Option<UploadId>,
    pub hash: Option<ContentHash>,
    pub crc32: Option<u32>,
    pub size: Option<u64>,
    pub deflated_size: Option<u64>,
}

impl BeginContent {
    /// BEGIN_CONTENT answering a PUT: transmit from `offset`
    pub fn for_upload(offset: u64, upload_id: Option<UploadId>) -> Self {
        Self {
            offset,
            upload_id,
            ..Self::default()
        }
    }

    /// BEGIN_CONTENT answering a GET: content attributes ahead of bytes
    pub fn for_download(
        hash: ContentHash,
        crc32: u32,
        size: u64,
        deflated_size: u64,
    ) -> Self {
        Self {
            offset: 0,
            upload_id: None,
            hash: Some(hash),
            crc32: Some(crc32),
            size: Some(size),
            deflated_size: Some(deflated_size),
        }
    }
}

/// Server-to-client message of a transfer request
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    BeginContent(BeginContent),
    Bytes(Bytes),
    Eof,
    Ok { new_generation: Generation },
    Error(ErrorFrame),
}

impl ServerFrame {
    /// Whether this frame terminates its request
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServerFrame::Eof | ServerFrame::Ok { .. } | ServerFrame::Error(_)
        )
    }
}

/// Error payload; QUOTA_EXCEEDED carries its quota attributes
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorFrame {
    pub code: WireError,
    pub message: String,
    pub free_bytes: Option<u64>,
    pub share: Option<ShareId>,
}

impl ErrorFrame {
    pub fn new(code: WireError, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            free_bytes: None,
            share: None,
        }
    }

    /// Translate an engine error into its wire form
    pub fn from_error(err: &crate::error::ContentError) -> Self {
        let mut frame = Self::new(err.wire_code(), err.to_string());
        if let crate::error::ContentError::QuotaExceeded { free_bytes, share } = err {
            frame.free_bytes = Some(*free_bytes);
            frame.share = *share;
        }
        frame
    }
}
