use thiserror::Error;

use crate::types::ShareId;

/// Result type for content transfer operations
pub type ContentResult<T> = Result<T, ContentError>;

/// Errors raised by the content transfer engine.
///
/// Each variant maps onto exactly one wire error code via
/// [`ContentError::wire_code`]; the taxonomy decides how a controller
/// recovers (validation and precondition errors keep the connection alive,
/// internal errors tear it down after responding).
#[derive(Error, Debug)]
pub enum ContentError {
    #[error("does not exist: {0}")]
    DoesNotExist(String),

    #[error("no permission: {0}")]
    NoPermission(String),

    #[error("quota exceeded: {free_bytes} bytes free")]
    QuotaExceeded {
        free_bytes: u64,
        share: Option<ShareId>,
    },

    #[error("upload corrupt: {0}")]
    UploadCorrupt(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("try again: {source}")]
    TryAgain {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("not available: {0}")]
    NotAvailable(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ContentError {
    /// Create a does-not-exist error
    pub fn does_not_exist<S: Into<String>>(what: S) -> Self {
        Self::DoesNotExist(what.into())
    }

    /// Create a no-permission error
    pub fn no_permission<S: Into<String>>(why: S) -> Self {
        Self::NoPermission(why.into())
    }

    /// Create a conflict error
    pub fn conflict<S: Into<String>>(why: S) -> Self {
        Self::Conflict(why.into())
    }

    /// Wrap an infrastructure fault the client may retry
    pub fn try_again<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::TryAgain {
            source: Box::new(source),
        }
    }

    /// Create a not-available error
    pub fn not_available<S: Into<String>>(why: S) -> Self {
        Self::NotAvailable(why.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(why: S) -> Self {
        Self::Internal(why.into())
    }

    /// The wire error code this error is reported as
    pub fn wire_code(&self) -> WireError {
        match self {
            ContentError::DoesNotExist(_) => WireError::DoesNotExist,
            ContentError::NoPermission(_) => WireError::NoPermission,
            ContentError::QuotaExceeded { .. } => WireError::QuotaExceeded,
            ContentError::UploadCorrupt(_) => WireError::UploadCorrupt,
            ContentError::Conflict(_) => WireError::Conflict,
            ContentError::TryAgain { .. } => WireError::TryAgain,
            ContentError::NotAvailable(_) => WireError::NotAvailable,
            ContentError::Cancelled => WireError::RequestCancelled,
            ContentError::Internal(_) => WireError::InternalError,
        }
    }
}

/// Error codes as they appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireError {
    DoesNotExist,
    NoPermission,
    QuotaExceeded,
    UploadCorrupt,
    TryAgain,
    NotAvailable,
    Conflict,
    InternalError,
    RequestCancelled,
}

impl WireError {
    /// Protocol-level name of the code
    pub fn name(&self) -> &'static str {
        match self {
            WireError::DoesNotExist => "DOES_NOT_EXIST",
            WireError::NoPermission => "NO_PERMISSION",
            WireError::QuotaExceeded => "QUOTA_EXCEEDED",
            WireError::UploadCorrupt => "UPLOAD_CORRUPT",
            WireError::TryAgain => "TRY_AGAIN",
            WireError::NotAvailable => "NOT_AVAILABLE",
            WireError::Conflict => "CONFLICT",
            WireError::InternalError => "INTERNAL_ERROR",
            WireError::RequestCancelled => "REQUEST_CANCELLED",
        }
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_code_mapping() {
        assert_eq!(
            ContentError::does_not_exist("node").wire_code(),
            WireError::DoesNotExist
        );
        assert_eq!(
            ContentError::QuotaExceeded {
                free_bytes: 1,
                share: None
            }
            .wire_code(),
            WireError::QuotaExceeded
        );
        assert_eq!(ContentError::Cancelled.wire_code().name(), "REQUEST_CANCELLED");
    }

    #[test]
    fn test_try_again_preserves_cause() {
        let err = ContentError::try_again(std::io::Error::other("writer crash"));
        assert!(err.to_string().contains("writer crash"));
    }
}
