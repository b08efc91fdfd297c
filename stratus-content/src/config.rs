use chrono::{DateTime, Duration, Utc};

/// Configuration for the content transfer engine
#[derive(Debug, Clone)]
pub struct ContentConfig {
    /// Metadata chunk size: one `add_part` is recorded per this many
    /// deflated bytes committed to the blob writer, and uploads whose
    /// whole deflated payload fits in a single chunk skip the durable
    /// upload record.
    pub storage_chunk_size: u64,

    /// Maximum payload carried by one outgoing BYTES frame
    pub bytes_payload: usize,

    /// Upper bound on a single protocol message
    pub max_message_size: usize,

    /// Private salt mixed into the magic hash
    pub magic_hash_salt: Vec<u8>,

    /// Upload records idle longer than this are eligible for reaping
    pub upload_stale_after: Duration,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            storage_chunk_size: 64 * 1024,
            bytes_payload: 64 * 1024,
            max_message_size: 128 * 1024,
            magic_hash_salt: b"stratus-magic-v1".to_vec(),
            upload_stale_after: Duration::hours(24),
        }
    }
}

impl ContentConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the metadata chunk size
    pub fn with_storage_chunk_size(mut self, bytes: u64) -> Self {
        self.storage_chunk_size = bytes;
        self
    }

    /// Set the outgoing frame payload size
    pub fn with_bytes_payload(mut self, bytes: usize) -> Self {
        self.bytes_payload = bytes;
        self
    }

    /// Set the maximum protocol message size
    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Set the magic hash salt
    pub fn with_magic_hash_salt<S: Into<Vec<u8>>>(mut self, salt: S) -> Self {
        self.magic_hash_salt = salt.into();
        self
    }

    /// Set the upload staleness cutoff
    pub fn with_upload_stale_after(mut self, cutoff: Duration) -> Self {
        self.upload_stale_after = cutoff;
        self
    }
}

/// Time source seam so record timestamps and reaping are testable
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
