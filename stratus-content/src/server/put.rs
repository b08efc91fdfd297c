use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::error::{ContentError, ContentResult};
use crate::metrics::MetricsSink;
use crate::proto::{BeginContent, ErrorFrame, PutContentRequest, ServerFrame};
use crate::server::{AdmissionPermit, Transport};
use crate::upload::{UploadHints, UploadJob};
use crate::user::User;

/// States of a PUT_CONTENT request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Init,
    Connecting,
    Uploading,
    Committing,
    Done,
    Cancelling,
    Errored,
}

/// Per-request controller driving an [`UploadJob`].
///
/// Holds the connection's admission permit for the prelude only: the
/// `upload_job` slot is populated strictly before the permit is
/// released, so a CANCEL_REQUEST processed right after the release
/// always finds the job it must stop.
#[derive(Clone)]
pub struct PutController {
    inner: Arc<PutInner>,
}

struct PutInner {
    user: Arc<User>,
    transport: Arc<dyn Transport>,
    metrics: Arc<dyn MetricsSink>,
    state: parking_lot::Mutex<UploadState>,
    job: tokio::sync::Mutex<Option<UploadJob>>,
    expected: AtomicU64,
    received: AtomicU64,
}

impl PutController {
    pub fn new(
        user: Arc<User>,
        transport: Arc<dyn Transport>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            inner: Arc::new(PutInner {
                user,
                transport,
                metrics,
                state: parking_lot::Mutex::new(UploadState::Init),
                job: tokio::sync::Mutex::new(None),
                expected: AtomicU64::new(0),
                received: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> UploadState {
        *self.inner.state.lock()
    }

    fn set_state(&self, state: UploadState) {
        *self.inner.state.lock() = state;
    }

    /// Whether the upload job slot has been assigned
    pub fn has_upload_job(&self) -> bool {
        self.inner
            .job
            .try_lock()
            .map(|slot| slot.is_some())
            .unwrap_or(true)
    }

    /// Run the request prelude: build and connect the job, assign it,
    /// release the permit, answer BEGIN_CONTENT.
    pub async fn start(
        &self,
        request: PutContentRequest,
        permit: AdmissionPermit,
    ) -> ContentResult<()> {
        self.set_state(UploadState::Connecting);
        match self.connect(request, permit).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // A commit failure inside the prelude has already been
                // reported by commit() itself.
                if self.state() != UploadState::Errored {
                    self.fail(&e).await;
                }
                Err(e)
            }
        }
    }

    async fn connect(
        &self,
        request: PutContentRequest,
        permit: AdmissionPermit,
    ) -> ContentResult<()> {
        let hints = UploadHints {
            hash: request.hash.clone(),
            crc32: request.crc32,
            inflated_size: request.size,
            deflated_size: request.deflated_size,
            magic_hash: request.magic_hash.clone(),
        };
        let mut job = self
            .inner
            .user
            .get_upload_job(
                Some(request.volume),
                request.node,
                request.share,
                request.previous_hash.clone(),
                hints,
                request.upload_id.clone(),
            )
            .await?;
        job.connect().await?;

        let offset = job.offset();
        let upload_id = job.upload_id().clone();
        let deduped = job.is_deduped();

        *self.inner.job.lock().await = Some(job);
        permit.release();

        if self.state() == UploadState::Cancelling {
            return Ok(());
        }

        if deduped {
            self.inner
                .metrics
                .gauge("MagicUploadJob.upload", request.deflated_size);
            self.inner.metrics.meter("MagicUploadJob.upload.begin", 1);
        } else {
            self.inner.metrics.gauge("UploadJob.upload", offset);
            self.inner.metrics.meter("UploadJob.upload.begin", 1);
        }
        debug!("UploadJob begin content from offset {offset}");

        self.inner
            .expected
            .store(request.deflated_size.saturating_sub(offset), Ordering::SeqCst);
        self.inner
            .transport
            .send(ServerFrame::BeginContent(BeginContent::for_upload(
                offset,
                Some(upload_id),
            )))
            .await?;
        self.set_state(UploadState::Uploading);

        // Nothing left to transmit: dedup shortcut or an already-complete
        // resume commits on the spot.
        if self.inner.expected.load(Ordering::SeqCst) == 0 {
            self.commit().await?;
        }
        Ok(())
    }

    /// Feed one BYTES frame; commits once the expected byte count is in
    pub async fn handle_bytes(&self, payload: Bytes) -> ContentResult<()> {
        if self.state() != UploadState::Uploading {
            return Ok(());
        }
        let added = {
            let mut slot = self.inner.job.lock().await;
            match slot.as_mut() {
                Some(job) => job.add_data(payload.clone()).await,
                None => Ok(()),
            }
        };
        if let Err(e) = added {
            self.fail(&e).await;
            return Err(e);
        }
        let len = payload.len() as u64;
        let received = self.inner.received.fetch_add(len, Ordering::SeqCst) + len;
        if received >= self.inner.expected.load(Ordering::SeqCst) {
            self.commit().await?;
        }
        Ok(())
    }

    async fn commit(&self) -> ContentResult<()> {
        self.set_state(UploadState::Committing);
        let committed = {
            let mut slot = self.inner.job.lock().await;
            match slot.as_mut() {
                Some(job) => job.commit().await,
                None => Err(ContentError::internal("commit without an upload job")),
            }
        };
        match committed {
            Ok(new_generation) => {
                self.inner
                    .transport
                    .send(ServerFrame::Ok { new_generation })
                    .await?;
                self.set_state(UploadState::Done);
                Ok(())
            }
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    /// Handle CANCEL_REQUEST: stop the job, answer REQUEST_CANCELLED
    pub async fn cancel(&self) {
        {
            let mut state = self.inner.state.lock();
            if matches!(
                *state,
                UploadState::Done | UploadState::Errored | UploadState::Cancelling
            ) {
                return;
            }
            *state = UploadState::Cancelling;
        }
        if let Some(job) = self.inner.job.lock().await.as_mut() {
            job.cancel().await;
        }
        let _ = self
            .inner
            .transport
            .send(ServerFrame::Error(ErrorFrame::new(
                crate::error::WireError::RequestCancelled,
                "request cancelled",
            )))
            .await;
    }

    async fn fail(&self, err: &ContentError) {
        let _ = self
            .inner
            .transport
            .send(ServerFrame::Error(ErrorFrame::from_error(err)))
            .await;
        if matches!(err, ContentError::Internal(_)) {
            self.inner.transport.shutdown();
        }
        self.set_state(UploadState::Errored);
    }
}
