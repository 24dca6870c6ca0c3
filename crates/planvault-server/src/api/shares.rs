use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use planvault_core::protocol::{
    CreateShareRequest, CreateShareResponse, IncomingShare, OutgoingShare, OwnedShare,
    PatchShareRequest, PushRecord, ShareView, VersionResponse, WriteShareRequest,
};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::AppError;
use crate::store::{NewShare, ShareWrite, WriteKind};
use crate::AppState;

/// Share a table with a recipient, or add the recipient to an existing share
async fn create_share(
    State(state): State<AppState>,
    Extension(AuthUser(owner_id)): Extension<AuthUser>,
    Json(req): Json<CreateShareRequest>,
) -> Result<(StatusCode, Json<CreateShareResponse>), AppError> {
    if req.table_id.trim().is_empty() {
        return Err(AppError::BadRequest("tableId must not be empty".to_string()));
    }

    let recipient = state
        .accounts
        .find_by_email(&req.recipient_email)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!("No user with email {}", req.recipient_email))
        })?;
    if recipient.id == owner_id {
        return Err(AppError::BadRequest(
            "Cannot share a table with yourself".to_string(),
        ));
    }

    let response = state
        .shares
        .create_or_extend(NewShare {
            owner_id,
            recipient_id: recipient.id,
            source_table_id: req.table_id,
            permission: req.permission,
            encrypted_table_data: req.encrypted_table_data,
            encrypted_dek: req.encrypted_dek,
            wrapped_dek_for_owner: req.wrapped_dek_for_owner,
        })
        .await?;

    tracing::info!(
        share_id = %response.share_id,
        recipient = %recipient.id,
        created = response.created,
        "Table shared"
    );
    let status = if response.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}

async fn list_incoming(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Json<Vec<IncomingShare>>, AppError> {
    Ok(Json(state.shares.incoming(user_id).await?))
}

async fn list_owned(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Json<Vec<OwnedShare>>, AppError> {
    Ok(Json(state.shares.owned(user_id).await?))
}

async fn list_outgoing(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Json<Vec<OutgoingShare>>, AppError> {
    Ok(Json(state.shares.outgoing(user_id).await?))
}

async fn get_share(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<ShareView>, AppError> {
    Ok(Json(state.shares.view(id, user_id).await?))
}

/// Owner or edit-recipient write. Entitlement is looked up live, right
/// before the locked write.
async fn write_share(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<WriteShareRequest>,
) -> Result<Json<VersionResponse>, AppError> {
    let entitled = state.accounts.has_entitlement(user_id).await?;
    let version = state
        .shares
        .write(ShareWrite {
            share_id: id,
            caller: user_id,
            entitled,
            encrypted_table_data: req.encrypted_table_data,
            version: req.version,
            kind: WriteKind::Write,
        })
        .await?
        .into_result()?;
    Ok(Json(VersionResponse { version }))
}

/// Owner commits a merged result and advances the pending-push cursor
async fn resolve_share(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<WriteShareRequest>,
) -> Result<Json<VersionResponse>, AppError> {
    let version = state
        .shares
        .write(ShareWrite {
            share_id: id,
            caller: user_id,
            entitled: true,
            encrypted_table_data: req.encrypted_table_data,
            version: req.version,
            kind: WriteKind::Resolve,
        })
        .await?
        .into_result()?;

    tracing::info!(share_id = %id, version, "Shared table resolved");
    Ok(Json(VersionResponse { version }))
}

async fn list_pushes(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<PushRecord>>, AppError> {
    Ok(Json(state.shares.pending_pushes(id, user_id).await?))
}

/// Permission change, revocation or auto-accept toggle; exactly one per call
async fn patch_share(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<PatchShareRequest>,
) -> Result<StatusCode, AppError> {
    let change = req
        .change()
        .map_err(|msg| AppError::BadRequest(msg.to_string()))?;
    state
        .shares
        .update_recipient(id, user_id, req.recipient_user_id, change)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_share(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.shares.delete(id, user_id).await?;
    tracing::info!(share_id = %id, "Share deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/shares", post(create_share))
        .route("/shares/incoming", get(list_incoming))
        .route("/shares/owned", get(list_owned))
        .route("/shares/outgoing", get(list_outgoing))
        .route(
            "/shares/{id}",
            get(get_share)
                .put(write_share)
                .patch(patch_share)
                .delete(delete_share),
        )
        .route("/shares/{id}/pushes", get(list_pushes))
        .route("/shares/{id}/resolve", post(resolve_share))
}
