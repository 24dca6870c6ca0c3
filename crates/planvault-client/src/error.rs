//! Error types for the sync client.

use planvault_core::CryptoError;
use thiserror::Error;
use uuid::Uuid;

/// Retry policy class for API failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Errors from talking to the planvault server
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-success response other than a version conflict
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// 409 from a compare-and-swap write
    #[error("Version conflict (server at {current_version})")]
    Conflict { current_version: i64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// HTTP status if the server answered
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Conflict { .. } => Some(409),
            _ => None,
        }
    }

    /// Classify error for retry policy
    pub fn retry_class(&self) -> ApiRetryClass {
        match self {
            Self::Api { status, .. } => match *status {
                401 | 403 => ApiRetryClass::ReauthRequired,
                408 | 423 | 425 | 429 => ApiRetryClass::Retryable,
                500..=599 => ApiRetryClass::Retryable,
                _ => ApiRetryClass::Permanent,
            },
            Self::Conflict { .. } => ApiRetryClass::Retryable,
            Self::Http(_) => ApiRetryClass::Retryable,
            Self::Json(_) | Self::InvalidRequest(_) => ApiRetryClass::Permanent,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        self.retry_class() == ApiRetryClass::ReauthRequired
    }
}

/// Errors raised by a [`LocalStore`](crate::local_store::LocalStore)
#[derive(Debug, Error)]
pub enum LocalStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Slot {slot} holds unreadable data: {reason}")]
    Corrupt { slot: &'static str, reason: String },

    #[error("Local store lock poisoned")]
    Poisoned,
}

/// Errors surfaced by the workspace [`SyncManager`](crate::manager::SyncManager)
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another sync holds the sync lock
    #[error("Sync already in progress")]
    SyncInProgress,

    /// The user is typing; sync refused until they stop
    #[error("User is editing")]
    UserIsEditing,

    /// The remote blob could not be opened with the current key
    #[error("Cannot decrypt remote workspace: {reason}")]
    DecryptionFailure { ciphertext: String, reason: String },

    /// A decryption failure is outstanding; retry with a new key or force
    /// overwrite first
    #[error("Sync blocked by an unresolved decryption failure: {reason}")]
    DecryptionBlocked { reason: String },

    /// Pushing an empty workspace over non-empty remote state was refused
    #[error("Refusing to overwrite remote data with an empty workspace")]
    EmptyDataRejected { handler_configured: bool },

    /// Another device won the compare-and-swap; retry later
    #[error("Version race (server at {current_version})")]
    VersionRace { current_version: i64 },

    /// Local edits landed while the sync was in flight, so remote state was
    /// not applied locally; the next sync sees both sides
    #[error("Local workspace changed during sync")]
    LocalChangedDuringSync,

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Local store error: {0}")]
    LocalStore(#[from] LocalStoreError),
}

impl SyncError {
    /// 401/403 from the server: the session is gone or lost its rights
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Api { status: 401 | 403, .. })
    }

    /// Transient failures that a later sync will most likely get past
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SyncInProgress
            | Self::UserIsEditing
            | Self::VersionRace { .. }
            | Self::LocalChangedDuringSync => true,
            Self::Http(_) => true,
            Self::Api { status, .. } => matches!(*status, 408 | 429 | 500..=599),
            _ => false,
        }
    }
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Http(e) => Self::Http(e),
            ApiError::Json(e) => Self::Json(e),
            ApiError::Api { status, message } => Self::Api { status, message },
            ApiError::Conflict { current_version } => Self::VersionRace { current_version },
            ApiError::InvalidRequest(message) => Self::Api {
                status: 400,
                message,
            },
        }
    }
}

/// Errors surfaced by [`SharedTableSync`](crate::shared::SharedTableSync)
#[derive(Debug, Error)]
pub enum ShareError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Table {0} not found in the local workspace")]
    TableNotFound(String),

    /// The caller holds only view permission on this share
    #[error("Share {0} is read-only for this user")]
    ReadOnly(Uuid),

    /// The write conflicted again after re-fetching and merging
    #[error("Share {share_id} changed again while retrying; giving up")]
    RetryExhausted { share_id: Uuid },
}

impl ShareError {
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Self::Api(e) => e.is_auth_failure(),
            Self::Sync(e) => e.is_auth_failure(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_class_for_auth_error_is_reauth() {
        let err = ApiError::api(401, "unauthorized");
        assert_eq!(err.retry_class(), ApiRetryClass::ReauthRequired);
        assert!(err.is_auth_failure());
        assert_eq!(
            ApiError::api(404, "missing").retry_class(),
            ApiRetryClass::Permanent
        );
    }

    #[test]
    fn test_conflict_becomes_version_race() {
        let err: SyncError = ApiError::Conflict { current_version: 7 }.into();
        assert!(matches!(err, SyncError::VersionRace { current_version: 7 }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_forbidden_is_auth_failure() {
        let err: SyncError = ApiError::api(403, "Subscription required").into();
        assert!(err.is_auth_failure());
        assert!(!err.is_retryable());

        let share_err = ShareError::from(ApiError::api(401, "expired"));
        assert!(share_err.is_auth_failure());
    }
}
