//! Device-local persistence for the sync engine.
//!
//! The store is a small set of named string slots. Every multi-slot change
//! goes through [`LocalStore::commit`] so a crash never leaves a snapshot
//! paired with the wrong version.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use planvault_core::WorkspaceSnapshot;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::LocalStoreError;

pub type StoreResult<T> = Result<T, LocalStoreError>;

/// Named slots the sync engine reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    /// The plaintext workspace snapshot as JSON
    Snapshot,
    /// Server version the snapshot was last synced at
    Version,
    /// Present while there are unsynced local edits
    Dirty,
    /// A conflict awaiting the user's decision
    PendingConflict,
}

impl Slot {
    pub fn key(self) -> &'static str {
        match self {
            Slot::Snapshot => "planvault.snapshot",
            Slot::Version => "planvault.version",
            Slot::Dirty => "planvault.dirty",
            Slot::PendingConflict => "planvault.pendingConflict",
        }
    }
}

/// A set of slot writes applied atomically; `None` clears the slot
#[derive(Debug, Default)]
pub struct Batch {
    changes: Vec<(Slot, Option<String>)>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, slot: Slot, value: impl Into<String>) -> Self {
        self.changes.push((slot, Some(value.into())));
        self
    }

    pub fn set_json<T: Serialize>(self, slot: Slot, value: &T) -> StoreResult<Self> {
        let json = serde_json::to_string(value).map_err(|e| LocalStoreError::Corrupt {
            slot: slot.key(),
            reason: e.to_string(),
        })?;
        Ok(self.set(slot, json))
    }

    pub fn clear(mut self, slot: Slot) -> Self {
        self.changes.push((slot, None));
        self
    }

    pub fn snapshot(self, snapshot: &WorkspaceSnapshot) -> StoreResult<Self> {
        self.set_json(Slot::Snapshot, snapshot)
    }

    pub fn version(self, version: i64) -> Self {
        self.set(Slot::Version, version.to_string())
    }

    pub fn dirty(self, dirty: bool) -> Self {
        if dirty {
            self.set(Slot::Dirty, "true")
        } else {
            self.clear(Slot::Dirty)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_changes(self) -> Vec<(Slot, Option<String>)> {
        self.changes
    }
}

/// Key-value persistence on the device
pub trait LocalStore: Send + Sync {
    fn get(&self, slot: Slot) -> StoreResult<Option<String>>;

    /// Apply every change in the batch, or none of them
    fn commit(&self, batch: Batch) -> StoreResult<()>;
}

/// Typed accessors over the raw slots
pub trait LocalStoreExt {
    fn get_json<T: DeserializeOwned>(&self, slot: Slot) -> StoreResult<Option<T>>;

    /// The stored snapshot, or an empty one on a fresh device
    fn snapshot(&self) -> StoreResult<WorkspaceSnapshot>;

    fn version(&self) -> StoreResult<i64>;

    fn is_dirty(&self) -> StoreResult<bool>;
}

impl<S: LocalStore + ?Sized> LocalStoreExt for S {
    fn get_json<T: DeserializeOwned>(&self, slot: Slot) -> StoreResult<Option<T>> {
        match self.get(slot)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| LocalStoreError::Corrupt {
                    slot: slot.key(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn snapshot(&self) -> StoreResult<WorkspaceSnapshot> {
        Ok(self.get_json(Slot::Snapshot)?.unwrap_or_default())
    }

    fn version(&self) -> StoreResult<i64> {
        match self.get(Slot::Version)? {
            Some(raw) => raw.trim().parse().map_err(|_| LocalStoreError::Corrupt {
                slot: Slot::Version.key(),
                reason: format!("not an integer: {}", raw),
            }),
            None => Ok(0),
        }
    }

    fn is_dirty(&self) -> StoreResult<bool> {
        Ok(self.get(Slot::Dirty)?.is_some())
    }
}

fn apply(map: &mut BTreeMap<String, String>, batch: Batch) {
    for (slot, value) in batch.into_changes() {
        match value {
            Some(value) => {
                map.insert(slot.key().to_string(), value);
            }
            None => {
                map.remove(slot.key());
            }
        }
    }
}

/// In-memory store, for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    slots: Mutex<BTreeMap<String, String>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, slot: Slot) -> StoreResult<Option<String>> {
        let slots = self.slots.lock().map_err(|_| LocalStoreError::Poisoned)?;
        Ok(slots.get(slot.key()).cloned())
    }

    fn commit(&self, batch: Batch) -> StoreResult<()> {
        let mut slots = self.slots.lock().map_err(|_| LocalStoreError::Poisoned)?;
        apply(&mut slots, batch);
        Ok(())
    }
}

/// One JSON file holding every slot, replaced atomically on each commit
#[derive(Debug)]
pub struct FileLocalStore {
    path: PathBuf,
    slots: Mutex<BTreeMap<String, String>>,
}

impl FileLocalStore {
    /// Open the store at `path`, starting empty if the file does not exist
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let slots = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| LocalStoreError::Corrupt {
                slot: "file",
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            slots: Mutex::new(slots),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write to a sibling temp file, fsync, then rename over the target
    fn write_atomic(&self, slots: &BTreeMap<String, String>) -> StoreResult<()> {
        let content = serde_json::to_vec_pretty(slots).map_err(|e| LocalStoreError::Corrupt {
            slot: "file",
            reason: e.to_string(),
        })?;
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&content)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl LocalStore for FileLocalStore {
    fn get(&self, slot: Slot) -> StoreResult<Option<String>> {
        let slots = self.slots.lock().map_err(|_| LocalStoreError::Poisoned)?;
        Ok(slots.get(slot.key()).cloned())
    }

    fn commit(&self, batch: Batch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut slots = self.slots.lock().map_err(|_| LocalStoreError::Poisoned)?;
        let mut next = slots.clone();
        apply(&mut next, batch);
        self.write_atomic(&next)?;
        *slots = next;
        Ok(())
    }
}
