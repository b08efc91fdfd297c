use std::sync::Arc;

use tracing::debug;

use crate::download::{DownloadJob, ProducerHandle, Termination};
use crate::error::{ContentError, ContentResult, WireError};
use crate::metrics::MetricsSink;
use crate::proto::{BeginContent, ErrorFrame, GetContentRequest, ServerFrame};
use crate::server::{AdmissionPermit, Transport};
use crate::user::User;

/// States of a GET_CONTENT request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Init,
    Connecting,
    Downloading,
    Done,
    Cancelling,
    Errored,
}

enum Producer {
    Pending(DownloadJob),
    Running(Arc<ProducerHandle>),
}

/// Per-request controller driving a [`DownloadJob`].
///
/// Mirrors the upload controller's resource ordering: the producer slot
/// is assigned strictly before the admission permit is released, and
/// BEGIN_CONTENT goes out before the first BYTES frame.
#[derive(Clone)]
pub struct GetController {
    inner: Arc<GetInner>,
}

struct GetInner {
    user: Arc<User>,
    transport: Arc<dyn Transport>,
    metrics: Arc<dyn MetricsSink>,
    state: parking_lot::Mutex<DownloadState>,
    producer: parking_lot::Mutex<Option<Producer>>,
}

impl GetController {
    pub fn new(
        user: Arc<User>,
        transport: Arc<dyn Transport>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            inner: Arc::new(GetInner {
                user,
                transport,
                metrics,
                state: parking_lot::Mutex::new(DownloadState::Init),
                producer: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> DownloadState {
        *self.inner.state.lock()
    }

    fn set_state(&self, state: DownloadState) {
        *self.inner.state.lock() = state;
    }

    /// Whether the producer slot has been assigned
    pub fn has_producer(&self) -> bool {
        self.inner.producer.lock().is_some()
    }

    /// Run the whole request: prelude, streaming, termination
    pub async fn start(
        &self,
        request: GetContentRequest,
        permit: AdmissionPermit,
    ) -> ContentResult<()> {
        self.set_state(DownloadState::Connecting);
        let handle = match self.connect(request, permit).await {
            Ok(Some(handle)) => handle,
            // Cancelled during the prelude; cancel() has answered.
            Ok(None) => return Ok(()),
            Err(e) => {
                self.fail(&e).await;
                return Err(e);
            }
        };
        self.set_state(DownloadState::Downloading);
        match handle.wait().await {
            Termination::Completed => {
                // A cancel that arrived after the last byte still wins.
                if self.state() == DownloadState::Downloading {
                    self.set_state(DownloadState::Done);
                }
                Ok(())
            }
            Termination::NotAvailable(message) => {
                // The producer already reported the error frame.
                self.set_state(DownloadState::Errored);
                Err(ContentError::not_available(message))
            }
            Termination::Cancelled => Ok(()),
        }
    }

    async fn connect(
        &self,
        request: GetContentRequest,
        permit: AdmissionPermit,
    ) -> ContentResult<Option<Arc<ProducerHandle>>> {
        let job = self
            .inner
            .user
            .get_content(Some(request.volume), request.node, request.offset)
            .await?;
        let attrs = job.attrs().clone();

        *self.inner.producer.lock() = Some(Producer::Pending(job));
        permit.release();

        self.inner
            .metrics
            .gauge("DownloadJob.download", request.offset);
        self.inner.metrics.meter("DownloadJob.download.begin", 1);
        let offset = request.offset;
        debug!("DownloadJob begin content from offset {offset}");

        self.inner
            .transport
            .send(ServerFrame::BeginContent(BeginContent::for_download(
                attrs.hash,
                attrs.crc32,
                attrs.size,
                attrs.deflated_size,
            )))
            .await?;

        // Attach the producer unless a cancel raced the prelude.
        let pending = {
            let mut slot = self.inner.producer.lock();
            match slot.take() {
                Some(Producer::Pending(job)) => Some(job),
                other => {
                    *slot = other;
                    None
                }
            }
        };
        match pending {
            Some(job) => {
                let handle = Arc::new(job.start(self.inner.transport.clone()));
                *self.inner.producer.lock() = Some(Producer::Running(handle.clone()));
                Ok(Some(handle))
            }
            None => Ok(None),
        }
    }

    /// Handle CANCEL_REQUEST: stop the producer, answer REQUEST_CANCELLED
    pub async fn cancel(&self) {
        {
            let mut state = self.inner.state.lock();
            if matches!(
                *state,
                DownloadState::Done | DownloadState::Errored | DownloadState::Cancelling
            ) {
                return;
            }
            *state = DownloadState::Cancelling;
        }
        let producer = self.inner.producer.lock().take();
        if let Some(Producer::Running(handle)) = producer {
            handle.cancel();
        }
        let _ = self
            .inner
            .transport
            .send(ServerFrame::Error(ErrorFrame::new(
                WireError::RequestCancelled,
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
        self.set_state(DownloadState::Errored);
    }
}
