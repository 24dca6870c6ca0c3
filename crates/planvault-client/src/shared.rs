//! Client side of shared tables.
//!
//! Owners fold recipients' pushes into their own table and resolve;
//! recipients write straight to the share. Plain writes retry once on a
//! version conflict: re-fetch, merge for the writing side, resubmit. A
//! resolve that conflicts folds the late pushes in before trying again.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use planvault_core::protocol::{
    CreateShareRequest, CreateShareResponse, IncomingShare, OutgoingShare, OwnedShare,
    PatchShareRequest, PushRecord, WriteShareRequest,
};
use planvault_core::{
    merge_for_write, merge_share_into_owner, tables_equal, CryptoError, DataKey, KeyPair,
    Permission, Table, WriteSide,
};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{SaveOutcome, ShareApi};
use crate::error::ShareError;
use crate::events::SyncEvent;
use crate::hooks::PushApprover;
use crate::manager::SyncManager;

pub type ShareResult<T> = Result<T, ShareError>;

/// A table shared with this user, decrypted
#[derive(Debug, Clone)]
pub struct IncomingTable {
    pub share: IncomingShare,
    pub table: Table,
}

/// Per-run counts from [`SharedTableSync::sync_owned`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SharedSyncSummary {
    /// Shares whose pending pushes were folded in and resolved
    pub resolved: usize,
    /// Shares updated with the owner's local edits
    pub pushed: usize,
    pub unchanged: usize,
    /// Shares whose table no longer exists locally
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OwnedOutcome {
    Resolved,
    Pushed,
    Unchanged,
    Skipped,
}

pub struct SharedTableSync {
    api: Arc<dyn ShareApi>,
    manager: Arc<SyncManager>,
    approver: Arc<dyn PushApprover>,
    /// Unwrapped table keys by share id
    keys: Mutex<HashMap<Uuid, DataKey>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SharedTableSync {
    pub fn new(
        api: Arc<dyn ShareApi>,
        manager: Arc<SyncManager>,
        approver: Arc<dyn PushApprover>,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            manager,
            approver,
            keys: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
        })
    }

    fn keypair(&self) -> Result<KeyPair, CryptoError> {
        self.manager.workspace_key().keypair()
    }

    /// Publish this user's public key so owners can share with them
    pub async fn publish_identity(&self) -> ShareResult<String> {
        let public_key = self.keypair()?.public_key();
        self.api.publish_key(&public_key).await?;
        info!("Public key published");
        Ok(public_key)
    }

    fn cached_key(&self, share_id: Uuid) -> Option<DataKey> {
        lock(&self.keys).get(&share_id).cloned()
    }

    fn cache_key(&self, share_id: Uuid, dek: DataKey) {
        lock(&self.keys).insert(share_id, dek);
    }

    /// Table key as the owner holds it, wrapped under the workspace key
    fn owner_key(&self, share_id: Uuid, wrapped: &str) -> Result<DataKey, CryptoError> {
        if let Some(dek) = self.cached_key(share_id) {
            return Ok(dek);
        }
        let dek = self.manager.workspace_key().unwrap_data_key(wrapped)?;
        self.cache_key(share_id, dek.clone());
        Ok(dek)
    }

    /// Table key as a recipient holds it, wrapped to their public key
    fn recipient_key(
        &self,
        keypair: &KeyPair,
        share_id: Uuid,
        wrapped: &str,
    ) -> Result<DataKey, CryptoError> {
        if let Some(dek) = self.cached_key(share_id) {
            return Ok(dek);
        }
        let dek = keypair.unwrap_data_key(wrapped)?;
        self.cache_key(share_id, dek.clone());
        Ok(dek)
    }

    /// Share a local table with `recipient_email`, or add them to the
    /// table's existing share
    pub async fn share_table(
        &self,
        table_id: &str,
        recipient_email: &str,
        permission: Permission,
    ) -> ShareResult<CreateShareResponse> {
        let table = self
            .manager
            .snapshot()?
            .table(table_id)
            .cloned()
            .ok_or_else(|| ShareError::TableNotFound(table_id.to_string()))?;
        let recipient = self.api.lookup_key(recipient_email).await?;

        let existing = self
            .api
            .owned()
            .await?
            .into_iter()
            .find(|s| s.source_table_id == table_id);
        let (dek, wrapped_dek_for_owner) = match &existing {
            Some(share) => (
                self.owner_key(share.share_id, &share.wrapped_dek_for_owner)?,
                None,
            ),
            None => {
                let dek = DataKey::generate();
                let wrapped = self.manager.workspace_key().wrap_data_key(&dek)?;
                (dek, Some(wrapped))
            }
        };

        let request = CreateShareRequest {
            table_id: table_id.to_string(),
            recipient_email: recipient_email.to_string(),
            permission,
            encrypted_table_data: dek.encrypt_json(&table)?,
            encrypted_dek: dek.wrap_for_recipient(&recipient.public_key)?,
            wrapped_dek_for_owner,
        };
        let response = self.api.create_share(&request).await?;
        self.cache_key(response.share_id, dek);

        info!(
            share_id = %response.share_id,
            table_id,
            recipient = %response.recipient_user_id,
            created = response.created,
            "Table shared"
        );
        Ok(response)
    }

    /// Reconcile every share this user owns with the local workspace
    pub async fn sync_owned(&self) -> ShareResult<SharedSyncSummary> {
        let mut summary = SharedSyncSummary::default();
        for share in self.api.owned().await? {
            match self.sync_owned_share(&share).await {
                Ok(OwnedOutcome::Resolved) => summary.resolved += 1,
                Ok(OwnedOutcome::Pushed) => summary.pushed += 1,
                Ok(OwnedOutcome::Unchanged) => summary.unchanged += 1,
                Ok(OwnedOutcome::Skipped) => summary.skipped += 1,
                Err(e) if e.is_auth_failure() => return Err(e),
                Err(e) => {
                    warn!(share_id = %share.share_id, error = %e, "Shared table sync failed");
                    summary.failed += 1;
                }
            }
        }
        debug!(?summary, "Owned shares synced");
        Ok(summary)
    }

    async fn sync_owned_share(&self, share: &OwnedShare) -> ShareResult<OwnedOutcome> {
        let dek = self.owner_key(share.share_id, &share.wrapped_dek_for_owner)?;
        let Some(local) = self
            .manager
            .snapshot()?
            .table(&share.source_table_id)
            .cloned()
        else {
            debug!(share_id = %share.share_id, "Shared table no longer exists locally");
            return Ok(OwnedOutcome::Skipped);
        };

        let pushes = self.api.pending_pushes(share.share_id).await?;
        if pushes.is_empty() {
            let current: Table = dek.decrypt_json(&share.encrypted_table_data)?;
            if tables_equal(&current, &local) {
                return Ok(OwnedOutcome::Unchanged);
            }
            let (version, _) = self
                .write_with_retry(share.share_id, &dek, local, share.version, WriteSide::Owner)
                .await?;
            info!(share_id = %share.share_id, version, "Owner edits pushed to share");
            self.manager.emit(SyncEvent::SharedTableSynced {
                share_id: share.share_id,
                version,
            });
            return Ok(OwnedOutcome::Pushed);
        }

        let mut seen = HashSet::new();
        let merged = self.fold_pushes(share, &dek, local.clone(), &pushes, &mut seen).await;
        self.commit_local(&local, &merged)?;
        let version = self.resolve_folded(share, &dek, merged, &mut seen).await?;

        info!(
            share_id = %share.share_id,
            version,
            pushes = seen.len(),
            "Shared table resolved"
        );
        self.manager.emit(SyncEvent::SharedTableSynced {
            share_id: share.share_id,
            version,
        });
        Ok(OwnedOutcome::Resolved)
    }

    /// Fold the pushes not yet in `seen` into `table`, asking the approver
    /// unless the pusher is always accepted
    async fn fold_pushes(
        &self,
        share: &OwnedShare,
        dek: &DataKey,
        mut table: Table,
        pushes: &[PushRecord],
        seen: &mut HashSet<Uuid>,
    ) -> Table {
        for push in pushes {
            if !seen.insert(push.id) {
                continue;
            }
            let pushed: Table = match dek.decrypt_json(&push.encrypted_table_data) {
                Ok(pushed) => pushed,
                Err(e) => {
                    warn!(push_id = %push.id, error = %e, "Skipping unreadable push");
                    continue;
                }
            };
            if push.always_accept_from || self.approver.approve(share, push, &pushed).await {
                table = merge_share_into_owner(&pushed, &table);
            } else {
                info!(push_id = %push.id, user = %push.user_id, "Push declined");
            }
        }
        table
    }

    /// Resolve the share with the folded table. A conflict means pushes
    /// arrived after they were listed: fold those in and resolve once more.
    /// A second conflict gives up without moving the resolve cursor.
    async fn resolve_folded(
        &self,
        share: &OwnedShare,
        dek: &DataKey,
        mut merged: Table,
        seen: &mut HashSet<Uuid>,
    ) -> ShareResult<i64> {
        let share_id = share.share_id;
        let mut base_version = share.version;
        let mut retried = false;
        loop {
            let request = WriteShareRequest {
                encrypted_table_data: dek.encrypt_json(&merged)?,
                version: base_version + 1,
            };
            let current_version = match self.api.resolve(share_id, &request).await? {
                SaveOutcome::Saved { version } => return Ok(version),
                SaveOutcome::Conflict { current_version } => current_version,
            };
            if retried {
                warn!(%share_id, current_version, "Shared table conflicted again during resolve");
                return Err(ShareError::RetryExhausted { share_id });
            }
            retried = true;

            debug!(%share_id, current_version, "Pushes arrived during resolve; folding them in");
            let pushes = self.api.pending_pushes(share_id).await?;
            let folded = self.fold_pushes(share, dek, merged.clone(), &pushes, seen).await;
            self.commit_local(&merged, &folded)?;
            merged = folded;
            base_version = current_version;
        }
    }

    /// Write `next` into the local workspace if it differs from `previous`
    fn commit_local(&self, previous: &Table, next: &Table) -> ShareResult<()> {
        if tables_equal(previous, next) {
            return Ok(());
        }
        let table = next.clone();
        self.manager.update_snapshot(move |s| s.upsert_table(table))?;
        Ok(())
    }

    /// Tables other users shared with this one
    pub async fn incoming(&self) -> ShareResult<Vec<IncomingTable>> {
        let keypair = self.keypair()?;
        let mut tables = Vec::new();
        for share in self.api.incoming().await? {
            let opened = self
                .recipient_key(&keypair, share.share_id, &share.encrypted_dek)
                .and_then(|dek| dek.decrypt_json::<Table>(&share.encrypted_table_data));
            match opened {
                Ok(table) => tables.push(IncomingTable { share, table }),
                Err(e) => {
                    warn!(share_id = %share.share_id, error = %e, "Cannot open shared table")
                }
            }
        }
        Ok(tables)
    }

    /// One row per (share, recipient) this user owns
    pub async fn outgoing(&self) -> ShareResult<Vec<OutgoingShare>> {
        Ok(self.api.outgoing().await?)
    }

    /// Write an edited copy of a shared table back to the share
    pub async fn push_incoming(&self, share_id: Uuid, table: Table) -> ShareResult<i64> {
        let view = self.api.share(share_id).await?;
        let (dek, side) = if view.is_owner() {
            (self.owner_key(share_id, &view.wrapped_dek)?, WriteSide::Owner)
        } else {
            if !view.permission.is_some_and(Permission::can_edit) {
                return Err(ShareError::ReadOnly(share_id));
            }
            let keypair = self.keypair()?;
            (
                self.recipient_key(&keypair, share_id, &view.wrapped_dek)?,
                WriteSide::Recipient,
            )
        };

        let (version, _) = self
            .write_with_retry(share_id, &dek, table, view.version, side)
            .await?;
        info!(%share_id, version, "Shared table pushed");
        Ok(version)
    }

    /// Write `table` as `known_version + 1`. On a conflict, merge with the
    /// server's copy for `side` and try exactly once more.
    async fn write_with_retry(
        &self,
        share_id: Uuid,
        dek: &DataKey,
        table: Table,
        known_version: i64,
        side: WriteSide,
    ) -> ShareResult<(i64, Table)> {
        let request = WriteShareRequest {
            encrypted_table_data: dek.encrypt_json(&table)?,
            version: known_version + 1,
        };
        let current_version = match self.api.write(share_id, &request).await? {
            SaveOutcome::Saved { version } => return Ok((version, table)),
            SaveOutcome::Conflict { current_version } => current_version,
        };

        debug!(%share_id, current_version, "Shared table moved; merging and retrying");
        let view = self.api.share(share_id).await?;
        let latest: Table = dek.decrypt_json(&view.encrypted_table_data)?;
        let merged = merge_for_write(side, &latest, &table);
        let request = WriteShareRequest {
            encrypted_table_data: dek.encrypt_json(&merged)?,
            version: view.version + 1,
        };
        match self.api.write(share_id, &request).await? {
            SaveOutcome::Saved { version } => Ok((version, merged)),
            SaveOutcome::Conflict { current_version } => {
                warn!(%share_id, current_version, "Shared table conflicted again after merge");
                Err(ShareError::RetryExhausted { share_id })
            }
        }
    }

    pub async fn set_permission(
        &self,
        share_id: Uuid,
        recipient: Uuid,
        permission: Permission,
    ) -> ShareResult<()> {
        self.api
            .patch(share_id, &PatchShareRequest::permission(recipient, permission))
            .await?;
        info!(%share_id, %recipient, %permission, "Share permission changed");
        Ok(())
    }

    /// Fold this recipient's pushes in without asking the approver
    pub async fn set_always_accept(
        &self,
        share_id: Uuid,
        recipient: Uuid,
        enabled: bool,
    ) -> ShareResult<()> {
        self.api
            .patch(share_id, &PatchShareRequest::always_accept(recipient, enabled))
            .await?;
        Ok(())
    }

    pub async fn revoke_recipient(&self, share_id: Uuid, recipient: Uuid) -> ShareResult<()> {
        self.api
            .patch(share_id, &PatchShareRequest::revoke(recipient))
            .await?;
        info!(%share_id, %recipient, "Recipient revoked");
        Ok(())
    }

    /// Recipient removes their own access
    pub async fn leave(&self, share_id: Uuid) -> ShareResult<()> {
        let request = PatchShareRequest {
            revoke: Some(true),
            ..PatchShareRequest::default()
        };
        self.api.patch(share_id, &request).await?;
        lock(&self.keys).remove(&share_id);
        Ok(())
    }

    /// Delete the share for every recipient
    pub async fn unshare(&self, share_id: Uuid) -> ShareResult<()> {
        self.api.delete(share_id).await?;
        lock(&self.keys).remove(&share_id);
        info!(%share_id, "Share deleted");
        Ok(())
    }

    /// Run [`sync_owned`](Self::sync_owned) in the background
    pub fn start(self: &Arc<Self>, interval: Option<Duration>) {
        let interval = interval.unwrap_or_else(|| self.manager.config().shared_sync_interval());
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(sync) = weak.upgrade() else {
                    break;
                };
                if sync.manager.is_user_editing() {
                    debug!("Shared table sync skipped while the user is editing");
                    continue;
                }
                match sync.sync_owned().await {
                    Ok(summary) => debug!(?summary, "Shared table sync finished"),
                    Err(e) if e.is_auth_failure() => {
                        warn!(error = %e, "Shared table sync stopped after authentication failure");
                        break;
                    }
                    Err(e) => warn!(error = %e, "Shared table sync failed"),
                }
            }
        });
        if let Some(previous) = lock(&self.task).replace(handle) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
    }
}

impl Drop for SharedTableSync {
    fn drop(&mut self) {
        self.stop();
    }
}
