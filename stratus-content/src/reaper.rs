use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Clock;
use crate::dal::RpcDal;
use crate::error::ContentResult;

/// Background reaper for abandoned uploads.
///
/// Upload records whose `when_last_active` is older than the configured
/// cutoff are dropped, releasing their multipart keys. Clients holding a
/// reaped upload id simply start over from offset zero.
pub struct UploadReaper {
    dal: Arc<dyn RpcDal>,
    clock: Arc<dyn Clock>,
    stale_after: chrono::Duration,
    interval: Duration,
}

impl UploadReaper {
    pub fn new(dal: Arc<dyn RpcDal>, clock: Arc<dyn Clock>, stale_after: chrono::Duration) -> Self {
        Self {
            dal,
            clock,
            stale_after,
            interval: Duration::from_secs(300),
        }
    }

    /// Create a reaper with a custom sweep interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run the reaper loop until the task is dropped
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        info!(interval = ?self.interval, "starting upload reaper");
        loop {
            ticker.tick().await;
            match self.reap_once().await {
                Ok(0) => debug!("no stale uploads found"),
                Ok(reaped) => info!(reaped, "dropped stale upload records"),
                Err(e) => warn!(error = %e, "upload reaping failed"),
            }
        }
    }

    /// Run one sweep; returns how many records were dropped
    pub async fn reap_once(&self) -> ContentResult<u64> {
        let cutoff = self.clock.now() - self.stale_after;
        self.dal.delete_stale_uploadjobs(cutoff).await
    }
}
