//! Protocol-side glue: the transfer controllers and their seams.
//!
//! The protocol server owns framing and authentication; per request it
//! hands a controller the parsed payload, a [`Transport`] to answer on
//! and the connection's [`AdmissionPermit`]. The controller must assign
//! its job/producer slot before releasing the permit so a racing
//! CANCEL_REQUEST always finds the resource it targets.

mod get;
mod put;

pub use get::{DownloadState, GetController};
pub use put::{PutController, UploadState};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{ContentError, ContentResult};
use crate::proto::ServerFrame;

/// Connection seam the controllers answer on.
///
/// `send` applies transport backpressure by suspending; `shutdown` marks
/// the connection as going away after a fatal error.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: ServerFrame) -> ContentResult<()>;

    fn shutdown(&self);
}

/// Serialises request preludes on one connection.
///
/// A request holds the permit for its non-streaming prelude only
/// (lookup, job construction, resource assignment) and releases it the
/// moment its controller slot is populated.
pub struct RequestGate {
    sem: Arc<Semaphore>,
}

impl RequestGate {
    pub fn new() -> Self {
        Self {
            sem: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait for the connection's request slot
    pub async fn admit(&self) -> ContentResult<AdmissionPermit> {
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ContentError::internal(e.to_string()))?;
        Ok(AdmissionPermit {
            permit: Some(permit),
            observer: None,
        })
    }

    /// Whether a request currently holds the permit
    pub fn is_locked(&self) -> bool {
        self.sem.available_permits() == 0
    }
}

impl Default for RequestGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Token for a request's critical prelude; dropping it releases the gate
pub struct AdmissionPermit {
    permit: Option<OwnedSemaphorePermit>,
    observer: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("permit", &self.permit)
            .field("observer", &self.observer.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl AdmissionPermit {
    /// A permit bound to no gate, for requests outside a connection
    pub fn detached() -> Self {
        Self {
            permit: None,
            observer: None,
        }
    }

    /// Run `f` at the moment the permit is released (test seam)
    pub fn with_observer<F: FnOnce() + Send + 'static>(mut self, f: F) -> Self {
        self.observer = Some(Box::new(f));
        self
    }

    /// Release the gate explicitly
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(observer) = self.observer.take() {
            observer();
        }
        self.permit.take();
    }
}

/// Transport double that records every frame, for tests and development
pub struct MemoryTransport {
    frames: parking_lot::Mutex<Vec<ServerFrame>>,
    shutdown: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            frames: parking_lot::Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Every frame sent so far
    pub fn frames(&self) -> Vec<ServerFrame> {
        self.frames.lock().clone()
    }

    /// Concatenated payload of all BYTES frames
    pub fn byte_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for frame in self.frames.lock().iter() {
            if let ServerFrame::Bytes(chunk) = frame {
                out.extend_from_slice(chunk);
            }
        }
        out
    }

    /// Number of BYTES frames sent
    pub fn bytes_frame_count(&self) -> usize {
        self.frames
            .lock()
            .iter()
            .filter(|f| matches!(f, ServerFrame::Bytes(_)))
            .count()
    }

    /// Whether the connection was marked shutting down
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: ServerFrame) -> ContentResult<()> {
        self.frames.lock().push(frame);
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gate_admits_one_at_a_time() {
        let gate = RequestGate::new();
        assert!(!gate.is_locked());

        let permit = gate.admit().await.unwrap();
        assert!(gate.is_locked());
        permit.release();
        assert!(!gate.is_locked());
    }

    #[tokio::test]
    async fn test_observer_fires_on_release() {
        let gate = RequestGate::new();
        let fired = Arc::new(AtomicBool::new(false));
        let permit = gate.admit().await.unwrap().with_observer({
            let fired = fired.clone();
            move || fired.store(true, Ordering::SeqCst)
        });
        assert!(!fired.load(Ordering::SeqCst));
        permit.release();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_second_admit_parks_until_release() {
        use tokio_test::{assert_pending, assert_ready, task};

        let gate = RequestGate::new();
        let first = tokio_test::block_on(gate.admit()).unwrap();

        let mut second = task::spawn(gate.admit());
        assert_pending!(second.poll());

        first.release();
        assert!(second.is_woken());
        let permit = assert_ready!(second.poll()).unwrap();
        assert!(gate.is_locked());
        permit.release();
        assert!(!gate.is_locked());
    }
}
