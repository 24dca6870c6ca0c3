use axum::{extract::State, routing::get, Extension, Json, Router};
use planvault_core::protocol::{SaveWorkspaceRequest, VersionResponse, WorkspaceResponse};

use crate::auth::AuthUser;
use crate::error::AppError;
use crate::AppState;

/// Current stored version, 0 before the first push
async fn get_version(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Json<VersionResponse>, AppError> {
    let version = state.workspaces.version(user_id).await?;
    Ok(Json(VersionResponse { version }))
}

/// Encrypted workspace blob
async fn get_workspace(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Json<WorkspaceResponse>, AppError> {
    let response = match state.workspaces.load(user_id).await? {
        Some(stored) => WorkspaceResponse {
            data: Some(stored.data),
            version: stored.version,
        },
        None => WorkspaceResponse {
            data: None,
            version: 0,
        },
    };
    Ok(Json(response))
}

/// Compare-and-swap save; 409 with the current version when the race is lost
async fn save_workspace(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(req): Json<SaveWorkspaceRequest>,
) -> Result<Json<VersionResponse>, AppError> {
    if req.data.is_empty() {
        return Err(AppError::BadRequest("data must not be empty".to_string()));
    }

    let outcome = state
        .workspaces
        .save(user_id, &req.data, req.expected_version)
        .await?;
    let version = outcome.into_result().inspect_err(|_| {
        tracing::info!(user_id = %user_id, proposed = req.expected_version, "Workspace save lost CAS race");
    })?;

    tracing::debug!(user_id = %user_id, version, "Workspace saved");
    Ok(Json(VersionResponse { version }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/workspace", get(get_workspace).post(save_workspace))
        .route("/workspace/version", get(get_version))
}
