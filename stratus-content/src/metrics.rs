use parking_lot::RwLock;

/// Sink for operational metrics emitted by the transfer controllers
pub trait MetricsSink: Send + Sync {
    /// Record a gauge sample
    fn gauge(&self, name: &str, value: u64);

    /// Record a meter increment
    fn meter(&self, name: &str, count: u64);
}

/// Metrics sink that drops everything
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn gauge(&self, _name: &str, _value: u64) {}
    fn meter(&self, _name: &str, _count: u64) {}
}

/// In-memory metrics collector keeping every sample, for tests and
/// development introspection
pub struct LiveMetrics {
    gauges: RwLock<Vec<(String, u64)>>,
    meters: RwLock<Vec<(String, u64)>>,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self {
            gauges: RwLock::new(Vec::new()),
            meters: RwLock::new(Vec::new()),
        }
    }

    /// All gauge samples recorded so far
    pub fn gauges(&self) -> Vec<(String, u64)> {
        self.gauges.read().clone()
    }

    /// All meter samples recorded so far
    pub fn meters(&self) -> Vec<(String, u64)> {
        self.meters.read().clone()
    }

    /// Whether a gauge sample with this exact name and value was recorded
    pub fn has_gauge(&self, name: &str, value: u64) -> bool {
        self.gauges.read().iter().any(|(n, v)| n == name && *v == value)
    }

    /// Whether a meter sample with this exact name and count was recorded
    pub fn has_meter(&self, name: &str, count: u64) -> bool {
        self.meters.read().iter().any(|(n, v)| n == name && *v == count)
    }
}

impl Default for LiveMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for LiveMetrics {
    fn gauge(&self, name: &str, value: u64) {
        self.gauges.write().push((name.to_string(), value));
    }

    fn meter(&self, name: &str, count: u64) {
        self.meters.write().push((name.to_string(), count));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_metrics_record_samples() {
        let metrics = LiveMetrics::new();
        metrics.gauge("UploadJob.upload", 0);
        metrics.meter("UploadJob.upload.begin", 1);

        assert!(metrics.has_gauge("UploadJob.upload", 0));
        assert!(metrics.has_meter("UploadJob.upload.begin", 1));
        assert!(!metrics.has_gauge("UploadJob.upload", 99));
    }
}
