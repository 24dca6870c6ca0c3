//! Workspace sync manager.
//!
//! Keeps the device's snapshot and the server's versioned blob in step:
//! pulls when only the server moved, pushes with compare-and-swap when only
//! this device did, and asks the [`ConflictResolver`] when both did.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use planvault_core::{semantically_equal, WorkspaceKey, WorkspaceSnapshot};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{SaveOutcome, WorkspaceApi};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::SyncEvent;
use crate::hooks::{
    Conflict, ConflictResolver, EditingProbe, EmptyOverwriteConfirmer, Resolution, ResolutionKind,
};
use crate::local_store::{Batch, LocalStore, LocalStoreExt, Slot};

pub type SyncResult<T> = Result<T, SyncError>;

const EVENT_CAPACITY: usize = 64;

/// What a sync call ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing to do
    UpToDate,
    Pushed { version: i64 },
    Pulled { version: i64 },
    Resolved { resolution: ResolutionKind, version: i64 },
    /// A conflict was shown and the user put the decision off
    Deferred,
    ForcePushed { version: i64 },
}

/// Application callbacks the manager consults
#[derive(Clone)]
pub struct SyncHooks {
    pub resolver: Arc<dyn ConflictResolver>,
    /// `None` makes empty overwrites of remote data fail outright
    pub empty_confirmer: Option<Arc<dyn EmptyOverwriteConfirmer>>,
    pub editing: Arc<dyn EditingProbe>,
}

pub struct SyncManager {
    api: Arc<dyn WorkspaceApi>,
    store: Arc<dyn LocalStore>,
    key: RwLock<WorkspaceKey>,
    hooks: SyncHooks,
    config: SyncConfig,
    /// Held for the whole of a sync, including the conflict dialog
    sync_lock: tokio::sync::Mutex<()>,
    decryption_failure: Mutex<Option<String>>,
    force_overwrite: AtomicBool,
    /// Bumped on every local edit so a sync can tell whether edits landed
    /// while it was in flight
    edit_generation: AtomicU64,
    /// Serializes local snapshot writes; never held across an await
    store_write: Mutex<()>,
    debounce_task: Mutex<Option<JoinHandle<()>>>,
    auto_sync_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<SyncEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncManager {
    pub fn new(
        api: Arc<dyn WorkspaceApi>,
        store: Arc<dyn LocalStore>,
        key: WorkspaceKey,
        hooks: SyncHooks,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            api,
            store,
            key: RwLock::new(key),
            hooks,
            config,
            sync_lock: tokio::sync::Mutex::new(()),
            decryption_failure: Mutex::new(None),
            force_overwrite: AtomicBool::new(false),
            edit_generation: AtomicU64::new(0),
            store_write: Mutex::new(()),
            debounce_task: Mutex::new(None),
            auto_sync_task: Mutex::new(None),
            events,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn is_user_editing(&self) -> bool {
        self.hooks.editing.is_user_editing()
    }

    /// The current local snapshot
    pub fn snapshot(&self) -> SyncResult<WorkspaceSnapshot> {
        Ok(self.store.snapshot()?)
    }

    pub fn local_version(&self) -> SyncResult<i64> {
        Ok(self.store.version()?)
    }

    pub fn is_dirty(&self) -> SyncResult<bool> {
        Ok(self.store.is_dirty()?)
    }

    /// A conflict that was shown but not yet resolved
    pub fn pending_conflict(&self) -> SyncResult<Option<Conflict>> {
        Ok(self.store.get_json(Slot::PendingConflict)?)
    }

    pub fn get_decryption_failure(&self) -> Option<String> {
        lock(&self.decryption_failure).clone()
    }

    pub(crate) fn workspace_key(&self) -> WorkspaceKey {
        self.key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Record a local edit and (re)start the debounce timer
    pub fn mark_local_modified(self: &Arc<Self>) -> SyncResult<()> {
        {
            let _write = lock(&self.store_write);
            self.edit_generation.fetch_add(1, AtomicOrdering::SeqCst);
            self.store.commit(Batch::new().dirty(true))?;
        }
        self.schedule_debounce();
        Ok(())
    }

    /// Apply a mutation to the local snapshot and mark the workspace modified.
    ///
    /// `mutate` runs under the local write lock and must not call back into
    /// the manager.
    pub fn update_snapshot<F>(self: &Arc<Self>, mutate: F) -> SyncResult<WorkspaceSnapshot>
    where
        F: FnOnce(&mut WorkspaceSnapshot),
    {
        let snapshot = {
            let _write = lock(&self.store_write);
            let mut snapshot = self.store.snapshot()?;
            mutate(&mut snapshot);
            self.edit_generation.fetch_add(1, AtomicOrdering::SeqCst);
            self.store
                .commit(Batch::new().snapshot(&snapshot)?.dirty(true))?;
            snapshot
        };
        self.schedule_debounce();
        Ok(snapshot)
    }

    fn schedule_debounce(self: &Arc<Self>) {
        self.schedule_debounce_after(self.config.debounce());
    }

    /// Postponed syncs back off up to the auto-sync interval
    fn schedule_debounce_after(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = weak.upgrade() else {
                return;
            };
            match manager.sync().await {
                Ok(outcome) => debug!(?outcome, "Debounced sync finished"),
                Err(SyncError::UserIsEditing | SyncError::SyncInProgress) => {
                    let ceiling = manager
                        .config
                        .auto_sync_interval()
                        .max(manager.config.debounce());
                    let next = delay.saturating_mul(2).min(ceiling);
                    debug!(?next, "Debounced sync postponed");
                    manager.schedule_debounce_after(next);
                }
                Err(e) if e.is_auth_failure() => {
                    warn!(error = %e, "Debounced sync lost authentication; stopping auto sync");
                    manager.emit(SyncEvent::AutoSyncStopped {
                        reason: e.to_string(),
                    });
                    manager.stop_auto_sync();
                }
                Err(e) => warn!(error = %e, "Debounced sync failed"),
            }
        });
        if let Some(previous) = lock(&self.debounce_task).replace(handle) {
            previous.abort();
        }
    }

    /// Run `sync()` every `interval` (the configured default when `None`)
    pub fn start_auto_sync(self: &Arc<Self>, interval: Option<Duration>) {
        let interval = interval.unwrap_or_else(|| self.config.auto_sync_interval());
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if manager.is_user_editing() {
                    debug!("Auto sync skipped while the user is editing");
                    continue;
                }
                match manager.sync().await {
                    Ok(outcome) => debug!(?outcome, "Auto sync finished"),
                    Err(SyncError::SyncInProgress) => {}
                    Err(e) if e.is_auth_failure() => {
                        warn!(error = %e, "Auto sync stopped after authentication failure");
                        manager.emit(SyncEvent::AutoSyncStopped {
                            reason: e.to_string(),
                        });
                        if let Some(debounce) = lock(&manager.debounce_task).take() {
                            debounce.abort();
                        }
                        break;
                    }
                    Err(e) => warn!(error = %e, "Auto sync failed"),
                }
            }
        });
        info!(?interval, "Auto sync started");
        if let Some(previous) = lock(&self.auto_sync_task).replace(handle) {
            previous.abort();
        }
    }

    /// Cancel the background job and any pending debounced sync
    pub fn stop_auto_sync(&self) {
        if let Some(handle) = lock(&self.auto_sync_task).take() {
            handle.abort();
        }
        if let Some(handle) = lock(&self.debounce_task).take() {
            handle.abort();
        }
    }

    /// Logout path: stop the timers and make one last attempt to push
    pub async fn shutdown(&self) {
        self.stop_auto_sync();
        match self.sync().await {
            Ok(outcome) => info!(?outcome, "Final sync before shutdown"),
            Err(e) => warn!(error = %e, "Final sync before shutdown failed"),
        }
    }

    pub fn enable_force_overwrite(&self) {
        warn!("Force overwrite enabled; the next sync replaces server state");
        self.force_overwrite.store(true, AtomicOrdering::SeqCst);
    }

    /// Swap in a different workspace key and try again
    pub async fn retry_sync(&self, key: WorkspaceKey) -> SyncResult<SyncOutcome> {
        *self.key.write().unwrap_or_else(PoisonError::into_inner) = key;
        *lock(&self.decryption_failure) = None;
        info!("Workspace key replaced; retrying sync");
        self.sync().await
    }

    /// Reconcile the local snapshot with the server
    pub async fn sync(&self) -> SyncResult<SyncOutcome> {
        let _guard = self
            .sync_lock
            .try_lock()
            .map_err(|_| SyncError::SyncInProgress)?;
        if self.is_user_editing() {
            return Err(SyncError::UserIsEditing);
        }
        if let Some(reason) = self.get_decryption_failure() {
            if !self.force_overwrite.load(AtomicOrdering::SeqCst) {
                return Err(SyncError::DecryptionBlocked { reason });
            }
            return self.force_push_locked().await;
        }

        let (generation, local, local_version, dirty) = self.read_local()?;
        let server_version = self.api.version().await?;
        debug!(local_version, server_version, dirty, "Sync started");

        match server_version.cmp(&local_version) {
            Ordering::Equal if !dirty => Ok(SyncOutcome::UpToDate),
            Ordering::Equal => {
                self.guard_empty(&local, server_version).await?;
                let version = self.push(&local, server_version, generation, false).await?;
                Ok(SyncOutcome::Pushed { version })
            }
            Ordering::Less => {
                warn!(
                    local_version,
                    server_version, "Server is behind this device; re-basing local state"
                );
                self.guard_empty(&local, server_version).await?;
                let version = self.push(&local, server_version, generation, false).await?;
                Ok(SyncOutcome::Pushed { version })
            }
            Ordering::Greater => {
                let (remote, remote_version) = self.fetch_remote().await?;
                if !dirty || semantically_equal(&local, &remote) {
                    self.apply_remote(&remote, remote_version, generation)?;
                    return Ok(SyncOutcome::Pulled {
                        version: remote_version,
                    });
                }
                let conflict = Conflict {
                    local,
                    remote,
                    local_version,
                    remote_version,
                };
                self.resolve_conflict(conflict, generation).await
            }
        }
    }

    /// Replace local state with the server's, whatever either side holds
    pub async fn pull(&self) -> SyncResult<SyncOutcome> {
        let _guard = self
            .sync_lock
            .try_lock()
            .map_err(|_| SyncError::SyncInProgress)?;
        let generation = self.edit_generation.load(AtomicOrdering::SeqCst);
        let (remote, version) = self.fetch_remote().await?;
        if version == 0 {
            return Ok(SyncOutcome::UpToDate);
        }
        self.apply_remote(&remote, version, generation)?;
        Ok(SyncOutcome::Pulled { version })
    }

    /// Write local state over the server's without conflict detection
    pub async fn force_push(&self) -> SyncResult<SyncOutcome> {
        let _guard = self
            .sync_lock
            .try_lock()
            .map_err(|_| SyncError::SyncInProgress)?;
        self.force_push_locked().await
    }

    async fn force_push_locked(&self) -> SyncResult<SyncOutcome> {
        let (generation, local, _, _) = self.read_local()?;
        let server_version = self.api.version().await?;
        let version = self.push(&local, server_version, generation, false).await?;

        *lock(&self.decryption_failure) = None;
        self.force_overwrite.store(false, AtomicOrdering::SeqCst);
        warn!(version, "Local workspace force-pushed over server state");
        Ok(SyncOutcome::ForcePushed { version })
    }

    async fn resolve_conflict(
        &self,
        conflict: Conflict,
        generation: u64,
    ) -> SyncResult<SyncOutcome> {
        let remote_version = conflict.remote_version;
        self.store
            .commit(Batch::new().set_json(Slot::PendingConflict, &conflict)?)?;
        info!(
            local_version = conflict.local_version,
            remote_version, "Workspace conflict detected"
        );
        self.emit(SyncEvent::ConflictDetected {
            local_version: conflict.local_version,
            remote_version,
        });

        let resolution = self.hooks.resolver.resolve(&conflict).await;
        let (kind, version) = match resolution {
            Resolution::Defer => {
                info!("Conflict resolution deferred");
                return Ok(SyncOutcome::Deferred);
            }
            Resolution::KeepLocal => {
                self.guard_empty(&conflict.local, remote_version).await?;
                let version = self
                    .push(&conflict.local, remote_version, generation, false)
                    .await?;
                (ResolutionKind::KeepLocal, version)
            }
            Resolution::KeepRemote => {
                self.apply_remote(&conflict.remote, remote_version, generation)?;
                (ResolutionKind::KeepRemote, remote_version)
            }
            Resolution::Merge(tables) => {
                let merged = WorkspaceSnapshot {
                    tables,
                    ..conflict.local.clone()
                };
                self.guard_empty(&merged, remote_version).await?;
                let version = self.push(&merged, remote_version, generation, true).await?;
                (ResolutionKind::Merge, version)
            }
        };

        info!(resolution = ?kind, version, "Workspace conflict resolved");
        self.emit(SyncEvent::ConflictResolved {
            resolution: kind,
            version,
        });
        Ok(SyncOutcome::Resolved {
            resolution: kind,
            version,
        })
    }

    /// Refuse to push an empty workspace over remote data unless confirmed
    async fn guard_empty(&self, snapshot: &WorkspaceSnapshot, server_version: i64) -> SyncResult<()> {
        if server_version == 0 || !snapshot.is_semantically_empty() {
            return Ok(());
        }
        let Some(confirmer) = &self.hooks.empty_confirmer else {
            warn!(server_version, "Empty workspace would overwrite remote data; no confirmation handler");
            return Err(SyncError::EmptyDataRejected {
                handler_configured: false,
            });
        };
        if confirmer.confirm_empty_overwrite(server_version).await {
            warn!(server_version, "User confirmed overwriting remote data with an empty workspace");
            Ok(())
        } else {
            info!("Empty overwrite declined");
            Err(SyncError::EmptyDataRejected {
                handler_configured: true,
            })
        }
    }

    /// Encrypt and write `snapshot` as version `base_version + 1`.
    ///
    /// With `replace_local` the snapshot also becomes the local one.
    async fn push(
        &self,
        snapshot: &WorkspaceSnapshot,
        base_version: i64,
        generation: u64,
        replace_local: bool,
    ) -> SyncResult<i64> {
        let data = self.workspace_key().encrypt_json(snapshot)?;
        match self.api.save(&data, base_version + 1).await? {
            SaveOutcome::Saved { version } => {
                let replacement = replace_local.then_some(snapshot);
                self.commit_synced(replacement, version, generation)?;
                info!(version, "Workspace pushed");
                self.emit(SyncEvent::Pushed { version });
                if replace_local {
                    self.emit(SyncEvent::SnapshotReplaced { version });
                }
                Ok(version)
            }
            SaveOutcome::Conflict { current_version } => {
                warn!(
                    proposed = base_version + 1,
                    current_version, "Lost the workspace version race"
                );
                Err(SyncError::VersionRace { current_version })
            }
        }
    }

    async fn fetch_remote(&self) -> SyncResult<(WorkspaceSnapshot, i64)> {
        let response = self.api.fetch().await?;
        let Some(ciphertext) = response.data else {
            return Ok((WorkspaceSnapshot::default(), response.version));
        };
        match self.workspace_key().decrypt_json::<WorkspaceSnapshot>(&ciphertext) {
            Ok(snapshot) => {
                *lock(&self.decryption_failure) = None;
                Ok((snapshot, response.version))
            }
            Err(e) if e.is_decryption_failure() => {
                let reason = e.to_string();
                error!(version = response.version, %reason, "Cannot decrypt remote workspace");
                *lock(&self.decryption_failure) = Some(reason.clone());
                self.emit(SyncEvent::DecryptionFailed {
                    reason: reason.clone(),
                });
                Err(SyncError::DecryptionFailure { ciphertext, reason })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn apply_remote(
        &self,
        remote: &WorkspaceSnapshot,
        version: i64,
        generation: u64,
    ) -> SyncResult<()> {
        self.commit_synced(Some(remote), version, generation)?;
        info!(version, "Remote workspace applied");
        self.emit(SyncEvent::SnapshotReplaced { version });
        Ok(())
    }

    /// Snapshot, version and dirty flag as of one edit generation
    fn read_local(&self) -> SyncResult<(u64, WorkspaceSnapshot, i64, bool)> {
        let _write = lock(&self.store_write);
        Ok((
            self.edit_generation.load(AtomicOrdering::SeqCst),
            self.store.snapshot()?,
            self.store.version()?,
            self.store.is_dirty()?,
        ))
    }

    /// Record a committed server version in one local commit.
    ///
    /// If an edit arrived since `generation` was read, a replacement
    /// snapshot is not written at all and the version and dirty flag stay
    /// as they were. Without a replacement the version still advances but
    /// the dirty flag stays set.
    fn commit_synced(
        &self,
        snapshot: Option<&WorkspaceSnapshot>,
        version: i64,
        generation: u64,
    ) -> SyncResult<()> {
        let _write = lock(&self.store_write);
        let unchanged = self.edit_generation.load(AtomicOrdering::SeqCst) == generation;
        let mut batch = Batch::new().version(version).clear(Slot::PendingConflict);
        match snapshot {
            Some(_) if !unchanged => {
                warn!(version, "Local edits arrived during sync; remote state not applied");
                return Err(SyncError::LocalChangedDuringSync);
            }
            Some(snapshot) => batch = batch.snapshot(snapshot)?,
            None => {}
        }
        if unchanged {
            batch = batch.dirty(false);
        } else {
            debug!("Local edits arrived during sync; keeping dirty flag");
        }
        self.store.commit(batch)?;
        Ok(())
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.stop_auto_sync();
    }
}
