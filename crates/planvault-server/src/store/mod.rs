pub mod memory;

use async_trait::async_trait;
use planvault_core::protocol::{
    CreateShareResponse, IncomingShare, OutgoingShare, OwnedShare, PushRecord, ShareChange,
    ShareView,
};
use planvault_core::Permission;
use uuid::Uuid;

use crate::error::AppError;

pub use memory::MemoryStore;

pub type StoreResult<T> = Result<T, AppError>;

/// Outcome of a compare-and-swap write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Committed { version: i64 },
    /// Nothing was written
    Conflict { current_version: i64 },
}

impl CasOutcome {
    /// Turn a lost race into the 409 error handlers return
    pub fn into_result(self) -> Result<i64, AppError> {
        match self {
            CasOutcome::Committed { version } => Ok(version),
            CasOutcome::Conflict { current_version } => Err(AppError::Conflict { current_version }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredWorkspace {
    pub data: String,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub public_key: Option<String>,
}

/// Input for creating a share or adding a recipient to an existing one
#[derive(Debug, Clone)]
pub struct NewShare {
    pub owner_id: Uuid,
    pub recipient_id: Uuid,
    pub source_table_id: String,
    pub permission: Permission,
    pub encrypted_table_data: String,
    pub encrypted_dek: String,
    pub wrapped_dek_for_owner: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// `PUT /shares/{id}` by the owner or an editor
    Write,
    /// `POST /shares/{id}/resolve`, owner only; moves the pending-push cursor
    Resolve,
}

#[derive(Debug, Clone)]
pub struct ShareWrite {
    pub share_id: Uuid,
    pub caller: Uuid,
    /// Live entitlement of the caller, looked up just before the write
    pub entitled: bool,
    pub encrypted_table_data: String,
    /// Proposed new version
    pub version: i64,
    pub kind: WriteKind,
}

/// Per-user singleton blob guarded by a version counter
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    /// Stored version, 0 when the user never pushed
    async fn version(&self, user_id: Uuid) -> StoreResult<i64>;

    async fn load(&self, user_id: Uuid) -> StoreResult<Option<StoredWorkspace>>;

    /// Store `data` as `expected_version` iff the stored version is
    /// `expected_version - 1`
    async fn save(&self, user_id: Uuid, data: &str, expected_version: i64)
        -> StoreResult<CasOutcome>;
}

/// Shared tables, their recipients and the push log
#[async_trait]
pub trait ShareStore: Send + Sync {
    async fn create_or_extend(&self, share: NewShare) -> StoreResult<CreateShareResponse>;

    /// The current row with the DEK wrapped for `caller`
    async fn view(&self, share_id: Uuid, caller: Uuid) -> StoreResult<ShareView>;

    async fn incoming(&self, user_id: Uuid) -> StoreResult<Vec<IncomingShare>>;

    async fn owned(&self, owner_id: Uuid) -> StoreResult<Vec<OwnedShare>>;

    async fn outgoing(&self, owner_id: Uuid) -> StoreResult<Vec<OutgoingShare>>;

    /// Locked CAS write; appends a push row only when it commits
    async fn write(&self, write: ShareWrite) -> StoreResult<CasOutcome>;

    /// Recipient pushes since the owner last resolved, oldest first
    async fn pending_pushes(&self, share_id: Uuid, caller: Uuid) -> StoreResult<Vec<PushRecord>>;

    async fn update_recipient(
        &self,
        share_id: Uuid,
        caller: Uuid,
        recipient: Option<Uuid>,
        change: ShareChange,
    ) -> StoreResult<()>;

    /// Remove the share and everything hanging off it; owner only
    async fn delete(&self, share_id: Uuid, caller: Uuid) -> StoreResult<()>;
}

/// Narrow view of the external account system
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn user_for_token(&self, token: &str) -> StoreResult<Option<Uuid>>;

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<Account>>;

    /// Whether the user currently holds a paid entitlement. Never cached.
    async fn has_entitlement(&self, user_id: Uuid) -> StoreResult<bool>;

    async fn publish_key(&self, user_id: Uuid, public_key: &str) -> StoreResult<()>;
}

/// Flatten owned shares into one row per recipient
pub(crate) fn outgoing_from_owned(owned: Vec<OwnedShare>) -> Vec<OutgoingShare> {
    owned
        .into_iter()
        .flat_map(|share| {
            let OwnedShare {
                share_id,
                source_table_id,
                recipients,
                ..
            } = share;
            recipients.into_iter().map(move |r| OutgoingShare {
                share_id,
                source_table_id: source_table_id.clone(),
                recipient_user_id: r.user_id,
                recipient_email: r.email,
                permission: r.permission,
                always_accept_from: r.always_accept_from,
            })
        })
        .collect()
}

pub(crate) fn share_not_found(share_id: Uuid) -> AppError {
    AppError::NotFound(format!("Share {} not found", share_id))
}

/// Reject proposed versions that can never be valid
pub(crate) fn validate_proposed_version(version: i64) -> StoreResult<()> {
    if version < 1 {
        return Err(AppError::BadRequest(format!(
            "version must be at least 1, got {}",
            version
        )));
    }
    Ok(())
}

/// Authorize a shared-table write against the locked row.
///
/// `permission` is the caller's recipient row, if any.
pub(crate) fn authorize_write(
    share_id: Uuid,
    owner_id: Uuid,
    caller: Uuid,
    permission: Option<Permission>,
    entitled: bool,
    kind: WriteKind,
) -> StoreResult<()> {
    if caller == owner_id {
        return Ok(());
    }
    let Some(permission) = permission else {
        return Err(share_not_found(share_id));
    };
    match kind {
        WriteKind::Resolve => Err(AppError::Forbidden(
            "Only the owner can resolve a shared table".to_string(),
        )),
        WriteKind::Write if !permission.can_edit() => Err(AppError::Forbidden(
            "View-only access to this table".to_string(),
        )),
        WriteKind::Write if !entitled => Err(AppError::Forbidden(
            "Editing shared tables requires an active subscription".to_string(),
        )),
        WriteKind::Write => Ok(()),
    }
}

/// Work out which recipient row a PATCH targets.
///
/// The owner may change any recipient and must name one. A recipient may
/// only revoke their own access.
pub(crate) fn patch_target(
    owner_id: Uuid,
    caller: Uuid,
    requested: Option<Uuid>,
    change: ShareChange,
) -> StoreResult<Uuid> {
    if caller == owner_id {
        return requested
            .ok_or_else(|| AppError::BadRequest("recipientUserId is required".to_string()));
    }
    match (change, requested) {
        (ShareChange::Revoke, None) => Ok(caller),
        (ShareChange::Revoke, Some(id)) if id == caller => Ok(caller),
        _ => Err(AppError::Forbidden(
            "Only the owner can change a share".to_string(),
        )),
    }
}
