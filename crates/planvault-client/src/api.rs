//! Server collaborators consumed by the sync engine.
//!
//! [`HttpClient`](crate::http::HttpClient) implements both traits over HTTP;
//! tests substitute in-process fakes.

use async_trait::async_trait;
use planvault_core::protocol::{
    CreateShareRequest, CreateShareResponse, IncomingShare, OutgoingShare, OwnedShare,
    PatchShareRequest, PublicKeyResponse, PushRecord, ShareView, WorkspaceResponse,
    WriteShareRequest,
};
use uuid::Uuid;

use crate::error::ApiError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Result of a compare-and-swap write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { version: i64 },
    Conflict { current_version: i64 },
}

impl SaveOutcome {
    /// Fold a 409 error into an outcome; other errors pass through
    pub fn from_result(result: ApiResult<i64>) -> ApiResult<Self> {
        match result {
            Ok(version) => Ok(SaveOutcome::Saved { version }),
            Err(ApiError::Conflict { current_version }) => {
                Ok(SaveOutcome::Conflict { current_version })
            }
            Err(e) => Err(e),
        }
    }
}

/// The per-user versioned workspace blob
#[async_trait]
pub trait WorkspaceApi: Send + Sync {
    /// `GET /workspace/version`
    async fn version(&self) -> ApiResult<i64>;

    /// `GET /workspace`
    async fn fetch(&self) -> ApiResult<WorkspaceResponse>;

    /// `POST /workspace` with the proposed new version
    async fn save(&self, data: &str, expected_version: i64) -> ApiResult<SaveOutcome>;
}

/// Shared tables and the public-key directory
#[async_trait]
pub trait ShareApi: Send + Sync {
    async fn create_share(&self, request: &CreateShareRequest) -> ApiResult<CreateShareResponse>;

    async fn incoming(&self) -> ApiResult<Vec<IncomingShare>>;

    async fn owned(&self) -> ApiResult<Vec<OwnedShare>>;

    async fn outgoing(&self) -> ApiResult<Vec<OutgoingShare>>;

    async fn share(&self, share_id: Uuid) -> ApiResult<ShareView>;

    /// `PUT /shares/{id}`
    async fn write(&self, share_id: Uuid, request: &WriteShareRequest) -> ApiResult<SaveOutcome>;

    /// `POST /shares/{id}/resolve`
    async fn resolve(&self, share_id: Uuid, request: &WriteShareRequest)
        -> ApiResult<SaveOutcome>;

    async fn pending_pushes(&self, share_id: Uuid) -> ApiResult<Vec<PushRecord>>;

    async fn patch(&self, share_id: Uuid, request: &PatchShareRequest) -> ApiResult<()>;

    async fn delete(&self, share_id: Uuid) -> ApiResult<()>;

    /// `PUT /keys`
    async fn publish_key(&self, public_key: &str) -> ApiResult<()>;

    /// `GET /keys/{email}`
    async fn lookup_key(&self, email: &str) -> ApiResult<PublicKeyResponse>;
}
