use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use stratus_blob::{BlobStore, ReadSource};

use crate::dal::RpcDal;
use crate::error::{ContentError, ContentResult, WireError};
use crate::proto::{ErrorFrame, ServerFrame};
use crate::server::Transport;
use crate::types::{ContentHash, NodeId, NodeKind, UserId, VolumeId};

/// Content attributes announced ahead of a download
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadAttrs {
    pub hash: ContentHash,
    pub crc32: u32,
    pub size: u64,
    pub deflated_size: u64,
}

/// How a producer run ended
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// Every byte was pushed and EOF sent
    Completed,
    /// A read failed mid-stream; the error frame has been sent
    NotAvailable(String),
    /// The producer was stopped before completion
    Cancelled,
}

/// Per-GET download state machine.
///
/// `open` resolves the node to its blob and captures the content
/// attributes; `start` attaches the producer task that frames bytes out
/// on the transport. BEGIN_CONTENT is the controller's to send, strictly
/// before `start`.
pub struct DownloadJob {
    source: ReadSource,
    attrs: DownloadAttrs,
    start_offset: u64,
    payload_size: usize,
}

impl std::fmt::Debug for DownloadJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadJob")
            .field("attrs", &self.attrs)
            .field("start_offset", &self.start_offset)
            .field("payload_size", &self.payload_size)
            .finish()
    }
}

impl DownloadJob {
    /// Resolve `node` to readable content.
    ///
    /// Nodes without content, and directories, do not exist as far as a
    /// download is concerned.
    pub async fn open(
        dal: Arc<dyn RpcDal>,
        blobs: Arc<dyn BlobStore>,
        user: UserId,
        volume: VolumeId,
        node: NodeId,
        offset: u64,
        payload_size: usize,
    ) -> ContentResult<Self> {
        let node = dal.get_node(user, volume, node).await?;
        if node.kind != NodeKind::File || !node.has_content() {
            return Err(ContentError::does_not_exist(format!(
                "content for node {}",
                node.id
            )));
        }
        let (hash, storage_key) = match (&node.content_hash, &node.storage_key) {
            (Some(hash), Some(key)) => (hash.clone(), key.clone()),
            _ => {
                return Err(ContentError::does_not_exist(format!(
                    "content for node {}",
                    node.id
                )))
            }
        };
        let source = blobs
            .open_get(storage_key.as_str())
            .await
            .map_err(|e| ContentError::not_available(e.to_string()))?;
        Ok(Self {
            source,
            attrs: DownloadAttrs {
                hash,
                crc32: node.crc32,
                size: node.size,
                deflated_size: node.deflated_size,
            },
            start_offset: offset,
            payload_size,
        })
    }

    /// Attributes for the BEGIN_CONTENT frame
    pub fn attrs(&self) -> &DownloadAttrs {
        &self.attrs
    }

    /// Spawn the producer task pushing BYTES frames onto `transport`
    pub fn start(self, transport: Arc<dyn Transport>) -> ProducerHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(produce(
            self.source,
            transport,
            self.start_offset,
            self.payload_size,
            cancel_rx,
        ));
        ProducerHandle {
            cancel_tx,
            task: parking_lot::Mutex::new(Some(task)),
            done: parking_lot::Mutex::new(None),
        }
    }
}

/// Handle to a running producer: stop it, or wait for how it ended
pub struct ProducerHandle {
    cancel_tx: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<Termination>>>,
    done: parking_lot::Mutex<Option<Termination>>,
}

impl ProducerHandle {
    /// Stop producing; idempotent
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Wait for the producer to finish and report its termination
    pub async fn wait(&self) -> Termination {
        let task = self.task.lock().take();
        match task {
            Some(task) => {
                let termination = match task.await {
                    Ok(t) => t,
                    Err(e) => Termination::NotAvailable(e.to_string()),
                };
                *self.done.lock() = Some(termination.clone());
                termination
            }
            None => self
                .done
                .lock()
                .clone()
                .unwrap_or(Termination::Cancelled),
        }
    }
}

async fn produce(
    mut source: ReadSource,
    transport: Arc<dyn Transport>,
    start_offset: u64,
    payload_size: usize,
    mut cancel_rx: watch::Receiver<bool>,
) -> Termination {
    let mut to_skip = start_offset as usize;
    let mut pushed = 0u64;
    loop {
        if *cancel_rx.borrow() {
            return Termination::Cancelled;
        }
        let next = tokio::select! {
            _ = cancel_rx.changed() => return Termination::Cancelled,
            next = source.stream.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                let chunk = if to_skip > 0 {
                    let skipped = chunk.len().min(to_skip);
                    to_skip -= skipped;
                    chunk.slice(skipped..)
                } else {
                    chunk
                };
                let mut rest = chunk;
                while !rest.is_empty() {
                    let take = rest.len().min(payload_size);
                    let frame = rest.split_to(take);
                    pushed += frame.len() as u64;
                    if transport.send(ServerFrame::Bytes(frame)).await.is_err() {
                        return Termination::Cancelled;
                    }
                    if *cancel_rx.borrow() {
                        return Termination::Cancelled;
                    }
                }
            }
            Some(Err(e)) => {
                let _ = transport
                    .send(ServerFrame::Error(ErrorFrame::new(
                        WireError::NotAvailable,
                        format!("not available: {e}"),
                    )))
                    .await;
                return Termination::NotAvailable(e.to_string());
            }
            None => {
                debug!(bytes = pushed, "download complete");
                let _ = transport.send(ServerFrame::Eof).await;
                return Termination::Completed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::MemoryDal;
    use crate::server::MemoryTransport;
    use bytes::Bytes;
    use crate::types::StorageKey;
    use stratus_blob::MemoryBlobStore;

    struct Fixture {
        dal: Arc<MemoryDal>,
        blobs: Arc<MemoryBlobStore>,
        user: crate::types::UserInfo,
        node: NodeId,
        deflated: Vec<u8>,
    }

    async fn fixture() -> Fixture {
        let dal = Arc::new(MemoryDal::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let user = dal.add_user("fred", 1 << 20);
        let (root, _) = dal.get_root(user.id).await.unwrap();

        let deflated: Vec<u8> = (0..150_000u32).map(|i| (i % 241) as u8).collect();
        let key = StorageKey::new();
        let mut sink = blobs.open_put(key.as_str(), 0).await.unwrap();
        sink.write(Bytes::from(deflated.clone())).await.unwrap();
        sink.close().await.unwrap();

        let created = dal
            .make_file_with_content(
                user.id,
                user.root_volume_id,
                root,
                "file",
                &ContentHash::of(b"plaintext"),
                7,
                200_000,
                deflated.len() as u64,
                &key,
                None,
            )
            .await
            .unwrap();

        Fixture {
            dal,
            blobs,
            user,
            node: created.node_id,
            deflated,
        }
    }

    #[tokio::test]
    async fn test_download_pushes_all_bytes_then_eof() {
        let fx = fixture().await;
        let transport = Arc::new(MemoryTransport::new());
        let job = DownloadJob::open(
            fx.dal.clone(),
            fx.blobs.clone(),
            fx.user.id,
            fx.user.root_volume_id,
            fx.node,
            0,
            64 * 1024,
        )
        .await
        .unwrap();
        assert_eq!(job.attrs().deflated_size, fx.deflated.len() as u64);

        let handle = job.start(transport.clone());
        assert_eq!(handle.wait().await, Termination::Completed);

        assert_eq!(transport.byte_payload(), fx.deflated);
        assert!(matches!(
            transport.frames().last(),
            Some(ServerFrame::Eof)
        ));
    }

    #[tokio::test]
    async fn test_frames_respect_payload_size() {
        let fx = fixture().await;
        let transport = Arc::new(MemoryTransport::new());
        let payload = 500;
        let job = DownloadJob::open(
            fx.dal.clone(),
            fx.blobs.clone(),
            fx.user.id,
            fx.user.root_volume_id,
            fx.node,
            0,
            payload,
        )
        .await
        .unwrap();
        let handle = job.start(transport.clone());
        handle.wait().await;

        for frame in transport.frames() {
            if let ServerFrame::Bytes(chunk) = frame {
                assert!(chunk.len() <= payload);
            }
        }
        assert_eq!(
            transport.bytes_frame_count(),
            fx.deflated.len().div_ceil(payload)
        );
    }

    #[tokio::test]
    async fn test_offset_skips_leading_bytes() {
        let fx = fixture().await;
        let transport = Arc::new(MemoryTransport::new());
        let offset = 100_001u64;
        let job = DownloadJob::open(
            fx.dal.clone(),
            fx.blobs.clone(),
            fx.user.id,
            fx.user.root_volume_id,
            fx.node,
            offset,
            64 * 1024,
        )
        .await
        .unwrap();
        let handle = job.start(transport.clone());
        assert_eq!(handle.wait().await, Termination::Completed);
        assert_eq!(transport.byte_payload(), fx.deflated[offset as usize..]);
    }

    #[tokio::test]
    async fn test_node_without_content_does_not_exist() {
        let fx = fixture().await;
        let (root, _) = fx.dal.get_root(fx.user.id).await.unwrap();
        let empty = fx
            .dal
            .make_file(fx.user.id, fx.user.root_volume_id, root, "empty", false)
            .await
            .unwrap();
        let err = DownloadJob::open(
            fx.dal.clone(),
            fx.blobs.clone(),
            fx.user.id,
            fx.user.root_volume_id,
            empty.node_id,
            0,
            64 * 1024,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ContentError::DoesNotExist(_)));
    }

    #[tokio::test]
    async fn test_read_error_surfaces_not_available() {
        let fx = fixture().await;
        let transport = Arc::new(MemoryTransport::new());
        let job = DownloadJob::open(
            fx.dal.clone(),
            fx.blobs.clone(),
            fx.user.id,
            fx.user.root_volume_id,
            fx.node,
            0,
            64 * 1024,
        )
        .await
        .unwrap();
        fx.blobs.set_fail_reads(true);
        let handle = job.start(transport.clone());
        assert!(matches!(
            handle.wait().await,
            Termination::NotAvailable(_)
        ));
        assert!(transport
            .frames()
            .iter()
            .any(|f| matches!(f, ServerFrame::Error(e) if e.code == WireError::NotAvailable)));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let fx = fixture().await;
        let transport = Arc::new(MemoryTransport::new());
        let job = DownloadJob::open(
            fx.dal.clone(),
            fx.blobs.clone(),
            fx.user.id,
            fx.user.root_volume_id,
            fx.node,
            0,
            64 * 1024,
        )
        .await
        .unwrap();
        let handle = job.start(transport.clone());
        handle.cancel();
        handle.cancel();
        let outcome = handle.wait().await;
        assert!(matches!(
            outcome,
            Termination::Cancelled | Termination::Completed
        ));
    }
}
