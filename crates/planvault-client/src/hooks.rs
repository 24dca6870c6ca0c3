//! Application-supplied decisions the sync engine cannot make on its own.

use async_trait::async_trait;
use planvault_core::protocol::{OwnedShare, PushRecord};
use planvault_core::{Table, WorkspaceSnapshot};
use serde::{Deserialize, Serialize};

/// A real divergence between this device and the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub local: WorkspaceSnapshot,
    pub remote: WorkspaceSnapshot,
    pub local_version: i64,
    pub remote_version: i64,
}

/// The user's answer to a conflict
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
    /// Push these tables on top of the local snapshot's other content
    Merge(Vec<Table>),
    /// Dialog dismissed; decide on a later sync
    Defer,
}

impl Resolution {
    pub fn kind(&self) -> Option<ResolutionKind> {
        match self {
            Resolution::KeepLocal => Some(ResolutionKind::KeepLocal),
            Resolution::KeepRemote => Some(ResolutionKind::KeepRemote),
            Resolution::Merge(_) => Some(ResolutionKind::Merge),
            Resolution::Defer => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionKind {
    KeepLocal,
    KeepRemote,
    Merge,
}

/// Presents a conflict to the user and waits for the answer.
///
/// The sync lock is held while this runs.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, conflict: &Conflict) -> Resolution;
}

/// Asked before an empty local workspace overwrites non-empty remote data
#[async_trait]
pub trait EmptyOverwriteConfirmer: Send + Sync {
    async fn confirm_empty_overwrite(&self, remote_version: i64) -> bool;
}

/// Whether the user is typing right now
pub trait EditingProbe: Send + Sync {
    fn is_user_editing(&self) -> bool;
}

/// Decides whether a recipient's push gets folded into the owner's table
#[async_trait]
pub trait PushApprover: Send + Sync {
    async fn approve(&self, share: &OwnedShare, push: &PushRecord, table: &Table) -> bool;
}

/// Probe for applications without an editing signal
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverEditing;

impl EditingProbe for NeverEditing {
    fn is_user_editing(&self) -> bool {
        false
    }
}

/// Resolver that always keeps this device's content
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysKeepLocal;

#[async_trait]
impl ConflictResolver for AlwaysKeepLocal {
    async fn resolve(&self, _conflict: &Conflict) -> Resolution {
        Resolution::KeepLocal
    }
}

/// Approver that accepts every push
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl PushApprover for AcceptAll {
    async fn approve(&self, _share: &OwnedShare, _push: &PushRecord, _table: &Table) -> bool {
        true
    }
}
