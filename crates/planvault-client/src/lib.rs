//! Client sync engine for planvault.
//!
//! [`SyncManager`] keeps the encrypted workspace in step with the server;
//! [`SharedTableSync`] handles tables shared between users.

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod hooks;
pub mod http;
pub mod local_store;
pub mod manager;
pub mod shared;

#[cfg(test)]
mod testing;

pub use api::{SaveOutcome, ShareApi, WorkspaceApi};
pub use config::SyncConfig;
pub use error::{ApiError, ApiRetryClass, LocalStoreError, ShareError, SyncError};
pub use events::SyncEvent;
pub use hooks::{
    AcceptAll, AlwaysKeepLocal, Conflict, ConflictResolver, EditingProbe,
    EmptyOverwriteConfirmer, NeverEditing, PushApprover, Resolution, ResolutionKind,
};
pub use http::HttpClient;
pub use local_store::{Batch, FileLocalStore, LocalStore, LocalStoreExt, MemoryLocalStore, Slot};
pub use manager::{SyncHooks, SyncManager, SyncOutcome};
pub use shared::{IncomingTable, SharedSyncSummary, SharedTableSync};
