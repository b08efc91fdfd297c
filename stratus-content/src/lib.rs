//! # stratus-content: the content transfer engine
//!
//! The core of the stratus personal-cloud file-sync server: everything
//! between a parsed PUT_CONTENT/GET_CONTENT request and the blob store.
//!
//! ## What lives here
//!
//! - [`HashPipeline`]: streaming zlib inflation with sha1/magic/crc32
//!   digests computed while upload bytes flow
//! - [`UploadJob`] / [`DownloadJob`]: the per-request transfer state
//!   machines, including the magic-hash dedup shortcut and byte-exact
//!   upload resumption
//! - [`UploadRecord`]: durable upload rows (and their transient
//!   single-chunk sibling) addressed by the client-visible multipart key
//! - [`User`]: the per-session façade for node, quota, generation and
//!   delta operations
//! - [`ContentManager`]: the process-wide user cache with single-flight
//!   fills
//! - [`PutController`] / [`GetController`]: protocol-side glue turning
//!   requests into jobs, with strict assign-before-release ordering
//! - [`RpcDal`]: the typed seam to the metadata layer, with an in-memory
//!   backend for tests and development
//! - [`UploadReaper`]: garbage collection of abandoned uploads
//!
//! Blob storage itself is the `stratus-blob` crate; protocol framing and
//! authentication live in the server binary outside this crate.

pub mod config;
pub mod dal;
pub mod download;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod pipeline;
pub mod proto;
pub mod reaper;
pub mod server;
pub mod types;
pub mod upload;
pub mod uploadjob;
pub mod user;

pub use config::{Clock, ContentConfig, SystemClock};
pub use dal::{MemoryDal, RpcDal, UploadJobRow};
pub use download::{DownloadAttrs, DownloadJob, ProducerHandle, Termination};
pub use error::{ContentError, ContentResult, WireError};
pub use manager::ContentManager;
pub use metrics::{LiveMetrics, MetricsSink, NullMetrics};
pub use pipeline::{HashPipeline, HashSnapshot};
pub use proto::{
    BeginContent, ErrorFrame, GetContentRequest, PutContentRequest, ServerFrame,
};
pub use reaper::UploadReaper;
pub use server::{
    AdmissionPermit, DownloadState, GetController, MemoryTransport, PutController, RequestGate,
    Transport, UploadState,
};
pub use types::{
    ContentBlob, ContentHash, DeltaResult, Generation, MagicHash, Node, NodeCreated, NodeId,
    NodeKind, ShareId, ShareInfo, StorageKey, Unlinked, UploadId, UserId, UserInfo, VolumeId,
};
pub use upload::{UploadHints, UploadJob};
pub use uploadjob::{BogusUploadJob, DbUploadJob, UploadRecord};
pub use user::User;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ContentConfig, ContentError, ContentManager, ContentResult, GetController,
        PutController, RpcDal, UploadHints, UploadJob, User,
    };
    pub use stratus_blob::{BlobStore, ByteStream};
}
