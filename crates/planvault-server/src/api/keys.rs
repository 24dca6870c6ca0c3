use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, put},
    Extension, Json, Router,
};
use planvault_core::crypto::is_valid_public_key;
use planvault_core::protocol::{PublicKeyResponse, PublishKeyRequest};

use crate::auth::AuthUser;
use crate::error::AppError;
use crate::AppState;

/// Publish the caller's X25519 public key so owners can wrap table keys for them
async fn publish_key(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(req): Json<PublishKeyRequest>,
) -> Result<StatusCode, AppError> {
    if !is_valid_public_key(&req.public_key) {
        return Err(AppError::BadRequest(
            "publicKey must be a base64 X25519 public key".to_string(),
        ));
    }
    state.accounts.publish_key(user_id, &req.public_key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn lookup_key(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<Json<PublicKeyResponse>, AppError> {
    let account = state
        .accounts
        .find_by_email(&email)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No user with email {}", email)))?;
    let public_key = account
        .public_key
        .ok_or_else(|| AppError::NotFound(format!("{} has not published a key", email)))?;

    Ok(Json(PublicKeyResponse {
        user_id: account.id,
        email: account.email,
        public_key,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/keys", put(publish_key))
        .route("/keys/{email}", get(lookup_key))
}
