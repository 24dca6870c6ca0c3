use chrono::{DateTime, Utc};
use planvault_core::Permission;
use uuid::Uuid;

use crate::error::AppError;

/// Workspace row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkspaceRow {
    pub data: String,
    pub version: i64,
}

/// Shared table row, as locked by writers
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SharedTableRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub source_table_id: String,
    pub encrypted_table_data: String,
    pub version: i64,
    pub wrapped_dek_for_owner: String,
    pub last_pushed_by_user_id: Option<Uuid>,
    pub last_resolved_at: Option<DateTime<Utc>>,
}

/// Recipient row joined with the recipient's email
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RecipientRow {
    pub shared_table_id: Uuid,
    pub user_id: Uuid,
    pub email: String,
    pub encrypted_dek: String,
    pub permission: String,
    pub always_accept_from: bool,
}

/// A share joined with the caller's recipient row and the owner's email
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IncomingRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub owner_email: String,
    pub source_table_id: String,
    pub encrypted_table_data: String,
    pub encrypted_dek: String,
    pub permission: String,
    pub version: i64,
}

/// Push log entry joined with the author's auto-accept flag
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PushRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub encrypted_table_data: String,
    pub version: i64,
    pub pushed_at: DateTime<Utc>,
    pub always_accept_from: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub email: String,
    pub public_key: Option<String>,
}

/// Parse the `permission` column, which a CHECK constraint keeps valid
pub fn parse_permission(raw: &str) -> Result<Permission, AppError> {
    raw.parse().map_err(AppError::Internal)
}
