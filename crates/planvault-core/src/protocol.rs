//! Request and response bodies exchanged between the sync client and server.
//!
//! Every opaque field is ciphertext produced by [`crate::crypto`]; the server
//! stores and returns it without looking inside.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Access level a recipient holds on a shared table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    View,
    Edit,
}

impl Permission {
    pub fn can_edit(self) -> bool {
        matches!(self, Permission::Edit)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Permission::View => "view",
            Permission::Edit => "edit",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "view" => Ok(Permission::View),
            "edit" => Ok(Permission::Edit),
            other => Err(format!("unknown permission: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceResponse {
    /// `None` until the first successful push
    pub data: Option<String>,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveWorkspaceRequest {
    pub data: String,
    /// The version this write proposes to create (stored version + 1)
    pub expected_version: i64,
}

/// Body of every 409 response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResponse {
    pub error: String,
    pub current_version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateShareRequest {
    pub table_id: String,
    pub recipient_email: String,
    pub permission: Permission,
    pub encrypted_table_data: String,
    /// DEK wrapped for the recipient
    pub encrypted_dek: String,
    /// Required the first time a table is shared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_dek_for_owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateShareResponse {
    pub share_id: Uuid,
    pub recipient_user_id: Uuid,
    pub version: i64,
    /// False when an existing share was extended
    pub created: bool,
}

/// A share as seen by one of its recipients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingShare {
    pub share_id: Uuid,
    pub owner_id: Uuid,
    pub owner_email: String,
    pub source_table_id: String,
    pub encrypted_table_data: String,
    /// DEK wrapped for the caller
    pub encrypted_dek: String,
    pub permission: Permission,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRecipient {
    pub user_id: Uuid,
    pub email: String,
    pub permission: Permission,
    pub always_accept_from: bool,
}

/// A share as seen by its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnedShare {
    pub share_id: Uuid,
    pub source_table_id: String,
    pub encrypted_table_data: String,
    pub version: i64,
    pub wrapped_dek_for_owner: String,
    pub last_pushed_by_user_id: Option<Uuid>,
    pub last_resolved_at: Option<DateTime<Utc>>,
    pub recipients: Vec<ShareRecipient>,
}

/// One row per (share, recipient), for the owner's sharing overview
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingShare {
    pub share_id: Uuid,
    pub source_table_id: String,
    pub recipient_user_id: Uuid,
    pub recipient_email: String,
    pub permission: Permission,
    pub always_accept_from: bool,
}

/// The current row of a share, with the DEK wrapped for whoever asked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareView {
    pub share_id: Uuid,
    pub owner_id: Uuid,
    pub source_table_id: String,
    pub encrypted_table_data: String,
    pub version: i64,
    pub wrapped_dek: String,
    /// `None` when the caller is the owner
    pub permission: Option<Permission>,
}

impl ShareView {
    pub fn is_owner(&self) -> bool {
        self.permission.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchShareRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_user_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<Permission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub always_accept_from: Option<bool>,
}

/// The single change a PATCH request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareChange {
    Permission(Permission),
    Revoke,
    AlwaysAccept(bool),
}

impl PatchShareRequest {
    pub fn permission(recipient: Uuid, permission: Permission) -> Self {
        Self {
            recipient_user_id: Some(recipient),
            permission: Some(permission),
            ..Self::default()
        }
    }

    pub fn revoke(recipient: Uuid) -> Self {
        Self {
            recipient_user_id: Some(recipient),
            revoke: Some(true),
            ..Self::default()
        }
    }

    pub fn always_accept(recipient: Uuid, enabled: bool) -> Self {
        Self {
            recipient_user_id: Some(recipient),
            always_accept_from: Some(enabled),
            ..Self::default()
        }
    }

    /// Exactly one of permission, revoke and alwaysAcceptFrom must be set
    pub fn change(&self) -> Result<ShareChange, &'static str> {
        match (self.permission, self.revoke, self.always_accept_from) {
            (Some(p), None, None) => Ok(ShareChange::Permission(p)),
            (None, Some(true), None) => Ok(ShareChange::Revoke),
            (None, Some(false), None) => Err("revoke must be true when present"),
            (None, None, Some(flag)) => Ok(ShareChange::AlwaysAccept(flag)),
            (None, None, None) => Err("no change requested"),
            _ => Err("permission, revoke and alwaysAcceptFrom are mutually exclusive"),
        }
    }
}

/// An entry of the append-only push log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub encrypted_table_data: String,
    pub version: i64,
    pub pushed_at: DateTime<Utc>,
    /// Whether the owner auto-accepts pushes from this author
    pub always_accept_from: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteShareRequest {
    pub encrypted_table_data: String,
    /// The version this write proposes to create
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishKeyRequest {
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyResponse {
    pub user_id: Uuid,
    pub email: String,
    pub public_key: String,
}
