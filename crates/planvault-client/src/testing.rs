//! In-process server collaborators for unit tests: the server's memory
//! store driven directly, one instance per signed-in user.

use std::sync::Arc;

use async_trait::async_trait;
use planvault_core::protocol::{
    CreateShareRequest, CreateShareResponse, IncomingShare, OutgoingShare, OwnedShare,
    PatchShareRequest, PublicKeyResponse, PushRecord, ShareView, WorkspaceResponse,
    WriteShareRequest,
};
use planvault_server::error::AppError;
use planvault_server::store::{
    AccountStore, CasOutcome, MemoryStore, NewShare, ShareStore, ShareWrite, WorkspaceStore,
    WriteKind,
};
use uuid::Uuid;

use crate::api::{ApiResult, SaveOutcome, ShareApi, WorkspaceApi};
use crate::error::ApiError;

pub(crate) struct InProcess {
    pub store: Arc<MemoryStore>,
    pub user: Uuid,
}

impl InProcess {
    pub async fn sign_up(store: &Arc<MemoryStore>, email: &str) -> Arc<Self> {
        let user = store.seed_user(email, &format!("token-{}", email)).await;
        Arc::new(Self {
            store: store.clone(),
            user,
        })
    }

    async fn share_write(
        &self,
        share_id: Uuid,
        request: &WriteShareRequest,
        kind: WriteKind,
    ) -> ApiResult<SaveOutcome> {
        let entitled = self.store.has_entitlement(self.user).await.map_err(api_error)?;
        let outcome = self
            .store
            .write(ShareWrite {
                share_id,
                caller: self.user,
                entitled,
                encrypted_table_data: request.encrypted_table_data.clone(),
                version: request.version,
                kind,
            })
            .await
            .map_err(api_error)?;
        Ok(save_outcome(outcome))
    }
}

fn api_error(err: AppError) -> ApiError {
    match err {
        AppError::Conflict { current_version } => ApiError::Conflict { current_version },
        AppError::Unauthorized(m) => ApiError::api(401, m),
        AppError::Forbidden(m) => ApiError::api(403, m),
        AppError::NotFound(m) => ApiError::api(404, m),
        AppError::BadRequest(m) => ApiError::api(400, m),
        other => ApiError::api(500, other.to_string()),
    }
}

fn save_outcome(outcome: CasOutcome) -> SaveOutcome {
    match outcome {
        CasOutcome::Committed { version } => SaveOutcome::Saved { version },
        CasOutcome::Conflict { current_version } => SaveOutcome::Conflict { current_version },
    }
}

#[async_trait]
impl WorkspaceApi for InProcess {
    async fn version(&self) -> ApiResult<i64> {
        self.store.version(self.user).await.map_err(api_error)
    }

    async fn fetch(&self) -> ApiResult<WorkspaceResponse> {
        let stored = WorkspaceStore::load(&*self.store, self.user)
            .await
            .map_err(api_error)?;
        Ok(match stored {
            Some(w) => WorkspaceResponse {
                data: Some(w.data),
                version: w.version,
            },
            None => WorkspaceResponse {
                data: None,
                version: 0,
            },
        })
    }

    async fn save(&self, data: &str, expected_version: i64) -> ApiResult<SaveOutcome> {
        let outcome = WorkspaceStore::save(&*self.store, self.user, data, expected_version)
            .await
            .map_err(api_error)?;
        Ok(save_outcome(outcome))
    }
}

#[async_trait]
impl ShareApi for InProcess {
    async fn create_share(&self, request: &CreateShareRequest) -> ApiResult<CreateShareResponse> {
        let recipient = self
            .store
            .find_by_email(&request.recipient_email)
            .await
            .map_err(api_error)?
            .ok_or_else(|| ApiError::api(404, "No such user"))?;
        self.store
            .create_or_extend(NewShare {
                owner_id: self.user,
                recipient_id: recipient.id,
                source_table_id: request.table_id.clone(),
                permission: request.permission,
                encrypted_table_data: request.encrypted_table_data.clone(),
                encrypted_dek: request.encrypted_dek.clone(),
                wrapped_dek_for_owner: request.wrapped_dek_for_owner.clone(),
            })
            .await
            .map_err(api_error)
    }

    async fn incoming(&self) -> ApiResult<Vec<IncomingShare>> {
        ShareStore::incoming(&*self.store, self.user)
            .await
            .map_err(api_error)
    }

    async fn owned(&self) -> ApiResult<Vec<OwnedShare>> {
        ShareStore::owned(&*self.store, self.user)
            .await
            .map_err(api_error)
    }

    async fn outgoing(&self) -> ApiResult<Vec<OutgoingShare>> {
        ShareStore::outgoing(&*self.store, self.user)
            .await
            .map_err(api_error)
    }

    async fn share(&self, share_id: Uuid) -> ApiResult<ShareView> {
        self.store.view(share_id, self.user).await.map_err(api_error)
    }

    async fn write(&self, share_id: Uuid, request: &WriteShareRequest) -> ApiResult<SaveOutcome> {
        self.share_write(share_id, request, WriteKind::Write).await
    }

    async fn resolve(
        &self,
        share_id: Uuid,
        request: &WriteShareRequest,
    ) -> ApiResult<SaveOutcome> {
        self.share_write(share_id, request, WriteKind::Resolve)
            .await
    }

    async fn pending_pushes(&self, share_id: Uuid) -> ApiResult<Vec<PushRecord>> {
        self.store
            .pending_pushes(share_id, self.user)
            .await
            .map_err(api_error)
    }

    async fn patch(&self, share_id: Uuid, request: &PatchShareRequest) -> ApiResult<()> {
        let change = request
            .change()
            .map_err(|m| ApiError::api(400, m))?;
        self.store
            .update_recipient(share_id, self.user, request.recipient_user_id, change)
            .await
            .map_err(api_error)
    }

    async fn delete(&self, share_id: Uuid) -> ApiResult<()> {
        ShareStore::delete(&*self.store, share_id, self.user)
            .await
            .map_err(api_error)
    }

    async fn publish_key(&self, public_key: &str) -> ApiResult<()> {
        AccountStore::publish_key(&*self.store, self.user, public_key)
            .await
            .map_err(api_error)
    }

    async fn lookup_key(&self, email: &str) -> ApiResult<PublicKeyResponse> {
        let account = self
            .store
            .find_by_email(email)
            .await
            .map_err(api_error)?
            .ok_or_else(|| ApiError::api(404, "No such user"))?;
        let public_key = account
            .public_key
            .ok_or_else(|| ApiError::api(404, "No published key"))?;
        Ok(PublicKeyResponse {
            user_id: account.id,
            email: account.email,
            public_key,
        })
    }
}
