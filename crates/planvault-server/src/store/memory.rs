use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use planvault_core::protocol::{
    CreateShareResponse, IncomingShare, OutgoingShare, OwnedShare, PushRecord, ShareChange,
    ShareRecipient, ShareView,
};
use planvault_core::Permission;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    authorize_write, outgoing_from_owned, patch_target, share_not_found,
    validate_proposed_version, Account, AccountStore, CasOutcome, NewShare, ShareStore,
    ShareWrite, StoreResult, StoredWorkspace, WorkspaceStore, WriteKind,
};
use crate::error::AppError;

/// In-process backend for local development and tests.
///
/// Every operation takes the single state lock, which gives the same
/// serialization the Postgres backend gets from row locks.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, MemUser>,
    sessions: HashMap<String, Uuid>,
    workspaces: HashMap<Uuid, StoredWorkspace>,
    shares: HashMap<Uuid, MemShare>,
    pushes: Vec<MemPush>,
    /// Monotonic clock for push/resolve ordering
    seq: u64,
}

struct MemUser {
    email: String,
    public_key: Option<String>,
    entitled: bool,
}

struct MemShare {
    id: Uuid,
    owner_id: Uuid,
    source_table_id: String,
    encrypted_table_data: String,
    version: i64,
    wrapped_dek_for_owner: String,
    last_pushed_by: Option<Uuid>,
    last_resolved_at: Option<DateTime<Utc>>,
    resolved_seq: Option<u64>,
    recipients: Vec<MemRecipient>,
}

impl MemShare {
    fn recipient(&self, user_id: Uuid) -> Option<&MemRecipient> {
        self.recipients.iter().find(|r| r.user_id == user_id)
    }

    fn recipient_mut(&mut self, user_id: Uuid) -> Option<&mut MemRecipient> {
        self.recipients.iter_mut().find(|r| r.user_id == user_id)
    }
}

struct MemRecipient {
    user_id: Uuid,
    encrypted_dek: String,
    permission: Permission,
    always_accept_from: bool,
}

struct MemPush {
    id: Uuid,
    share_id: Uuid,
    user_id: Uuid,
    encrypted_table_data: String,
    version: i64,
    pushed_at: DateTime<Utc>,
    seq: u64,
}

impl MemoryState {
    fn tick(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn email(&self, user_id: Uuid) -> String {
        self.users
            .get(&user_id)
            .map(|u| u.email.clone())
            .unwrap_or_default()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision an entitled user with a session token
    pub async fn seed_user(&self, email: &str, token: &str) -> Uuid {
        let id = Uuid::new_v4();
        let mut state = self.state.lock().await;
        state.users.insert(
            id,
            MemUser {
                email: email.trim().to_lowercase(),
                public_key: None,
                entitled: true,
            },
        );
        state.sessions.insert(token.to_string(), id);
        id
    }

    pub async fn set_entitlement(&self, user_id: Uuid, entitled: bool) {
        if let Some(user) = self.state.lock().await.users.get_mut(&user_id) {
            user.entitled = entitled;
        }
    }

    /// Drop a stored workspace, as an account reset would
    pub async fn reset_workspace(&self, user_id: Uuid) {
        self.state.lock().await.workspaces.remove(&user_id);
    }
}

#[async_trait]
impl WorkspaceStore for MemoryStore {
    async fn version(&self, user_id: Uuid) -> StoreResult<i64> {
        let state = self.state.lock().await;
        Ok(state.workspaces.get(&user_id).map_or(0, |w| w.version))
    }

    async fn load(&self, user_id: Uuid) -> StoreResult<Option<StoredWorkspace>> {
        Ok(self.state.lock().await.workspaces.get(&user_id).cloned())
    }

    async fn save(
        &self,
        user_id: Uuid,
        data: &str,
        expected_version: i64,
    ) -> StoreResult<CasOutcome> {
        validate_proposed_version(expected_version)?;
        let mut state = self.state.lock().await;
        let current = state.workspaces.get(&user_id).map_or(0, |w| w.version);
        if current != expected_version - 1 {
            return Ok(CasOutcome::Conflict {
                current_version: current,
            });
        }
        state.workspaces.insert(
            user_id,
            StoredWorkspace {
                data: data.to_string(),
                version: expected_version,
            },
        );
        Ok(CasOutcome::Committed {
            version: expected_version,
        })
    }
}

#[async_trait]
impl ShareStore for MemoryStore {
    async fn create_or_extend(&self, share: NewShare) -> StoreResult<CreateShareResponse> {
        let mut state = self.state.lock().await;

        let existing = state
            .shares
            .values_mut()
            .find(|s| s.owner_id == share.owner_id && s.source_table_id == share.source_table_id);

        if let Some(existing) = existing {
            match existing.recipient_mut(share.recipient_id) {
                Some(recipient) => {
                    recipient.encrypted_dek = share.encrypted_dek;
                    recipient.permission = share.permission;
                }
                None => existing.recipients.push(MemRecipient {
                    user_id: share.recipient_id,
                    encrypted_dek: share.encrypted_dek,
                    permission: share.permission,
                    always_accept_from: false,
                }),
            }
            return Ok(CreateShareResponse {
                share_id: existing.id,
                recipient_user_id: share.recipient_id,
                version: existing.version,
                created: false,
            });
        }

        let wrapped_dek_for_owner = share.wrapped_dek_for_owner.ok_or_else(|| {
            AppError::BadRequest("wrappedDekForOwner is required for a new share".to_string())
        })?;
        let id = Uuid::new_v4();
        state.shares.insert(
            id,
            MemShare {
                id,
                owner_id: share.owner_id,
                source_table_id: share.source_table_id,
                encrypted_table_data: share.encrypted_table_data,
                version: 1,
                wrapped_dek_for_owner,
                last_pushed_by: None,
                last_resolved_at: None,
                resolved_seq: None,
                recipients: vec![MemRecipient {
                    user_id: share.recipient_id,
                    encrypted_dek: share.encrypted_dek,
                    permission: share.permission,
                    always_accept_from: false,
                }],
            },
        );
        Ok(CreateShareResponse {
            share_id: id,
            recipient_user_id: share.recipient_id,
            version: 1,
            created: true,
        })
    }

    async fn view(&self, share_id: Uuid, caller: Uuid) -> StoreResult<ShareView> {
        let state = self.state.lock().await;
        let share = state
            .shares
            .get(&share_id)
            .ok_or_else(|| share_not_found(share_id))?;

        let (wrapped_dek, permission) = if share.owner_id == caller {
            (share.wrapped_dek_for_owner.clone(), None)
        } else {
            let recipient = share
                .recipient(caller)
                .ok_or_else(|| share_not_found(share_id))?;
            (recipient.encrypted_dek.clone(), Some(recipient.permission))
        };

        Ok(ShareView {
            share_id,
            owner_id: share.owner_id,
            source_table_id: share.source_table_id.clone(),
            encrypted_table_data: share.encrypted_table_data.clone(),
            version: share.version,
            wrapped_dek,
            permission,
        })
    }

    async fn incoming(&self, user_id: Uuid) -> StoreResult<Vec<IncomingShare>> {
        let state = self.state.lock().await;
        let mut shares: Vec<IncomingShare> = state
            .shares
            .values()
            .filter_map(|share| {
                share.recipient(user_id).map(|recipient| IncomingShare {
                    share_id: share.id,
                    owner_id: share.owner_id,
                    owner_email: state.email(share.owner_id),
                    source_table_id: share.source_table_id.clone(),
                    encrypted_table_data: share.encrypted_table_data.clone(),
                    encrypted_dek: recipient.encrypted_dek.clone(),
                    permission: recipient.permission,
                    version: share.version,
                })
            })
            .collect();
        shares.sort_by(|a, b| a.source_table_id.cmp(&b.source_table_id));
        Ok(shares)
    }

    async fn owned(&self, owner_id: Uuid) -> StoreResult<Vec<OwnedShare>> {
        let state = self.state.lock().await;
        let mut shares: Vec<OwnedShare> = state
            .shares
            .values()
            .filter(|share| share.owner_id == owner_id)
            .map(|share| OwnedShare {
                share_id: share.id,
                source_table_id: share.source_table_id.clone(),
                encrypted_table_data: share.encrypted_table_data.clone(),
                version: share.version,
                wrapped_dek_for_owner: share.wrapped_dek_for_owner.clone(),
                last_pushed_by_user_id: share.last_pushed_by,
                last_resolved_at: share.last_resolved_at,
                recipients: share
                    .recipients
                    .iter()
                    .map(|r| ShareRecipient {
                        user_id: r.user_id,
                        email: state.email(r.user_id),
                        permission: r.permission,
                        always_accept_from: r.always_accept_from,
                    })
                    .collect(),
            })
            .collect();
        shares.sort_by(|a, b| a.source_table_id.cmp(&b.source_table_id));
        Ok(shares)
    }

    async fn outgoing(&self, owner_id: Uuid) -> StoreResult<Vec<OutgoingShare>> {
        Ok(outgoing_from_owned(self.owned(owner_id).await?))
    }

    async fn write(&self, write: ShareWrite) -> StoreResult<CasOutcome> {
        validate_proposed_version(write.version)?;
        let mut state = self.state.lock().await;
        let seq = state.tick();

        let share = state
            .shares
            .get_mut(&write.share_id)
            .ok_or_else(|| share_not_found(write.share_id))?;
        let permission = share.recipient(write.caller).map(|r| r.permission);
        authorize_write(
            write.share_id,
            share.owner_id,
            write.caller,
            permission,
            write.entitled,
            write.kind,
        )?;

        if write.version != share.version + 1 {
            return Ok(CasOutcome::Conflict {
                current_version: share.version,
            });
        }

        let now = Utc::now();
        share.encrypted_table_data = write.encrypted_table_data.clone();
        share.version = write.version;
        share.last_pushed_by = Some(write.caller);
        if write.kind == WriteKind::Resolve {
            share.last_resolved_at = Some(now);
            share.resolved_seq = Some(seq);
        }

        state.pushes.push(MemPush {
            id: Uuid::new_v4(),
            share_id: write.share_id,
            user_id: write.caller,
            encrypted_table_data: write.encrypted_table_data,
            version: write.version,
            pushed_at: now,
            seq,
        });

        Ok(CasOutcome::Committed {
            version: write.version,
        })
    }

    async fn pending_pushes(&self, share_id: Uuid, caller: Uuid) -> StoreResult<Vec<PushRecord>> {
        let state = self.state.lock().await;
        let share = state
            .shares
            .get(&share_id)
            .ok_or_else(|| share_not_found(share_id))?;
        if share.owner_id != caller {
            return Err(AppError::Forbidden(
                "Only the owner can read pending pushes".to_string(),
            ));
        }

        Ok(state
            .pushes
            .iter()
            .filter(|p| p.share_id == share_id && p.user_id != share.owner_id)
            .filter(|p| share.resolved_seq.map_or(true, |resolved| p.seq > resolved))
            .map(|p| PushRecord {
                id: p.id,
                user_id: p.user_id,
                encrypted_table_data: p.encrypted_table_data.clone(),
                version: p.version,
                pushed_at: p.pushed_at,
                always_accept_from: share
                    .recipient(p.user_id)
                    .is_some_and(|r| r.always_accept_from),
            })
            .collect())
    }

    async fn update_recipient(
        &self,
        share_id: Uuid,
        caller: Uuid,
        recipient: Option<Uuid>,
        change: ShareChange,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let share = state
            .shares
            .get_mut(&share_id)
            .ok_or_else(|| share_not_found(share_id))?;
        if caller != share.owner_id && share.recipient(caller).is_none() {
            return Err(share_not_found(share_id));
        }
        let target = patch_target(share.owner_id, caller, recipient, change)?;

        match change {
            ShareChange::Revoke => {
                let before = share.recipients.len();
                share.recipients.retain(|r| r.user_id != target);
                if share.recipients.len() == before {
                    return Err(AppError::NotFound("Recipient not found".to_string()));
                }
            }
            ShareChange::Permission(permission) => {
                share
                    .recipient_mut(target)
                    .ok_or_else(|| AppError::NotFound("Recipient not found".to_string()))?
                    .permission = permission;
            }
            ShareChange::AlwaysAccept(flag) => {
                share
                    .recipient_mut(target)
                    .ok_or_else(|| AppError::NotFound("Recipient not found".to_string()))?
                    .always_accept_from = flag;
            }
        }
        Ok(())
    }

    async fn delete(&self, share_id: Uuid, caller: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let share = state
            .shares
            .get(&share_id)
            .ok_or_else(|| share_not_found(share_id))?;
        if share.owner_id != caller {
            return Err(AppError::Forbidden(
                "Only the owner can delete a share".to_string(),
            ));
        }
        state.shares.remove(&share_id);
        state.pushes.retain(|p| p.share_id != share_id);
        Ok(())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn user_for_token(&self, token: &str) -> StoreResult<Option<Uuid>> {
        Ok(self.state.lock().await.sessions.get(token).copied())
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<Account>> {
        let email = email.trim().to_lowercase();
        let state = self.state.lock().await;
        Ok(state
            .users
            .iter()
            .find(|(_, user)| user.email == email)
            .map(|(id, user)| Account {
                id: *id,
                email: user.email.clone(),
                public_key: user.public_key.clone(),
            }))
    }

    async fn has_entitlement(&self, user_id: Uuid) -> StoreResult<bool> {
        let state = self.state.lock().await;
        Ok(state.users.get(&user_id).is_some_and(|u| u.entitled))
    }

    async fn publish_key(&self, user_id: Uuid, public_key: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
        user.public_key = Some(public_key.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    async fn share_fixture(store: &MemoryStore) -> (Uuid, Uuid, Uuid) {
        let owner = store.seed_user("owner@example.com", "owner-token").await;
        let recipient = store.seed_user("friend@example.com", "friend-token").await;
        let created = store
            .create_or_extend(NewShare {
                owner_id: owner,
                recipient_id: recipient,
                source_table_id: "table-1".to_string(),
                permission: Permission::Edit,
                encrypted_table_data: "v1".to_string(),
                encrypted_dek: "dek-for-friend".to_string(),
                wrapped_dek_for_owner: Some("dek-for-owner".to_string()),
            })
            .await
            .unwrap();
        (created.share_id, owner, recipient)
    }

    fn write(share_id: Uuid, caller: Uuid, data: &str, version: i64) -> ShareWrite {
        ShareWrite {
            share_id,
            caller,
            entitled: true,
            encrypted_table_data: data.to_string(),
            version,
            kind: WriteKind::Write,
        }
    }

    #[tokio::test]
    async fn test_workspace_cas_is_monotonic() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();

        assert_eq!(store.version(user).await.unwrap(), 0);
        assert!(store.load(user).await.unwrap().is_none());

        assert_eq!(
            store.save(user, "a", 1).await.unwrap(),
            CasOutcome::Committed { version: 1 }
        );
        assert_eq!(
            store.save(user, "b", 2).await.unwrap(),
            CasOutcome::Committed { version: 2 }
        );

        // Replaying an old proposal loses and leaves the blob alone
        assert_eq!(
            store.save(user, "stale", 2).await.unwrap(),
            CasOutcome::Conflict { current_version: 2 }
        );
        assert_eq!(
            store.save(user, "skip", 4).await.unwrap(),
            CasOutcome::Conflict { current_version: 2 }
        );
        let stored = store.load(user).await.unwrap().unwrap();
        assert_eq!(stored.data, "b");
        assert_eq!(stored.version, 2);

        assert!(matches!(
            store.save(user, "zero", 0).await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_workspace_saves_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.save(user, &format!("device-{}", i), 1).await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if let CasOutcome::Committed { .. } = handle.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.version(user).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_extend_share_keeps_blob_and_updates_recipient() {
        let store = MemoryStore::new();
        let (share_id, owner, recipient) = share_fixture(&store).await;

        let again = store
            .create_or_extend(NewShare {
                owner_id: owner,
                recipient_id: recipient,
                source_table_id: "table-1".to_string(),
                permission: Permission::View,
                encrypted_table_data: "would-overwrite".to_string(),
                encrypted_dek: "rewrapped".to_string(),
                wrapped_dek_for_owner: None,
            })
            .await
            .unwrap();
        assert_eq!(again.share_id, share_id);
        assert!(!again.created);

        let view = store.view(share_id, recipient).await.unwrap();
        assert_eq!(view.encrypted_table_data, "v1");
        assert_eq!(view.wrapped_dek, "rewrapped");
        assert_eq!(view.permission, Some(Permission::View));

        let owner_view = store.view(share_id, owner).await.unwrap();
        assert!(owner_view.is_owner());
        assert_eq!(owner_view.wrapped_dek, "dek-for-owner");
    }

    #[tokio::test]
    async fn test_new_share_requires_owner_key() {
        let store = MemoryStore::new();
        let result = store
            .create_or_extend(NewShare {
                owner_id: Uuid::new_v4(),
                recipient_id: Uuid::new_v4(),
                source_table_id: "t".to_string(),
                permission: Permission::View,
                encrypted_table_data: "x".to_string(),
                encrypted_dek: "y".to_string(),
                wrapped_dek_for_owner: None,
            })
            .await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_concurrent_share_writes_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let (share_id, owner, recipient) = share_fixture(&store).await;

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.write(write(share_id, owner, "owner-v2", 2)).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(
                async move { store.write(write(share_id, recipient, "friend-v2", 2)).await },
            )
        };

        let outcomes = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
        let committed = outcomes
            .iter()
            .filter(|o| matches!(o, CasOutcome::Committed { version: 2 }))
            .count();
        assert_eq!(committed, 1);
        assert!(outcomes
            .iter()
            .any(|o| *o == CasOutcome::Conflict { current_version: 2 }));

        // The loser left no push row behind
        let view = store.view(share_id, owner).await.unwrap();
        assert_eq!(view.version, 2);
        let pending = store.pending_pushes(share_id, owner).await.unwrap();
        assert!(pending.len() <= 1);
    }

    #[tokio::test]
    async fn test_pending_pushes_follow_resolve_cursor() {
        let store = MemoryStore::new();
        let (share_id, owner, recipient) = share_fixture(&store).await;

        store
            .write(write(share_id, recipient, "friend-v2", 2))
            .await
            .unwrap();
        let pending = store.pending_pushes(share_id, owner).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].user_id, recipient);
        assert_eq!(pending[0].version, 2);
        assert!(!pending[0].always_accept_from);

        // Owner writes are logged but never reported back as pending
        store
            .write(ShareWrite {
                kind: WriteKind::Resolve,
                ..write(share_id, owner, "merged-v3", 3)
            })
            .await
            .unwrap();
        assert!(store
            .pending_pushes(share_id, owner)
            .await
            .unwrap()
            .is_empty());

        store
            .update_recipient(share_id, owner, Some(recipient), ShareChange::AlwaysAccept(true))
            .await
            .unwrap();
        store
            .write(write(share_id, recipient, "friend-v4", 4))
            .await
            .unwrap();
        let pending = store.pending_pushes(share_id, owner).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].always_accept_from);

        assert!(matches!(
            store.pending_pushes(share_id, recipient).await,
            Err(AppError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_lapsed_or_viewer_recipient_cannot_write() {
        let store = MemoryStore::new();
        let (share_id, owner, recipient) = share_fixture(&store).await;

        let lapsed = store
            .write(ShareWrite {
                entitled: false,
                ..write(share_id, recipient, "x", 2)
            })
            .await;
        assert!(matches!(lapsed, Err(AppError::Forbidden(_))));

        store
            .update_recipient(
                share_id,
                owner,
                Some(recipient),
                ShareChange::Permission(Permission::View),
            )
            .await
            .unwrap();
        let viewer = store.write(write(share_id, recipient, "x", 2)).await;
        assert!(matches!(viewer, Err(AppError::Forbidden(_))));
        assert_eq!(store.view(share_id, owner).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_revoke_and_delete() {
        let store = MemoryStore::new();
        let (share_id, owner, recipient) = share_fixture(&store).await;

        // A recipient may leave on their own
        store
            .update_recipient(share_id, recipient, None, ShareChange::Revoke)
            .await
            .unwrap();
        assert!(store.incoming(recipient).await.unwrap().is_empty());
        assert!(matches!(
            store.view(share_id, recipient).await,
            Err(AppError::NotFound(_))
        ));

        assert!(matches!(
            store.delete(share_id, recipient).await,
            Err(AppError::NotFound(_)) | Err(AppError::Forbidden(_))
        ));
        store.delete(share_id, owner).await.unwrap();
        assert!(store.owned(owner).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_listings() {
        let store = MemoryStore::new();
        let (share_id, owner, recipient) = share_fixture(&store).await;

        let incoming = store.incoming(recipient).await.unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].owner_email, "owner@example.com");
        assert_eq!(incoming[0].encrypted_dek, "dek-for-friend");

        let owned = store.owned(owner).await.unwrap();
        assert_eq!(owned[0].share_id, share_id);
        assert_eq!(owned[0].recipients[0].email, "friend@example.com");

        let outgoing = store.outgoing(owner).await.unwrap();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].recipient_user_id, recipient);
    }

    #[tokio::test]
    async fn test_accounts() {
        let store = MemoryStore::new();
        let id = store.seed_user("Ada@Example.com", "tok").await;

        assert_eq!(store.user_for_token("tok").await.unwrap(), Some(id));
        assert_eq!(store.user_for_token("nope").await.unwrap(), None);

        store.publish_key(id, "pubkey").await.unwrap();
        let account = store.find_by_email(" ada@example.com").await.unwrap().unwrap();
        assert_eq!(account.id, id);
        assert_eq!(account.public_key.as_deref(), Some("pubkey"));

        assert!(store.has_entitlement(id).await.unwrap());
        store.set_entitlement(id, false).await;
        assert!(!store.has_entitlement(id).await.unwrap());
    }
}
