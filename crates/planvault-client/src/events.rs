use uuid::Uuid;

use crate::hooks::ResolutionKind;

/// State changes broadcast to the application.
///
/// Subscribers re-read whatever they display; no event carries the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The local snapshot was replaced by remote or merged content
    SnapshotReplaced { version: i64 },
    /// Local content was committed to the server
    Pushed { version: i64 },
    ConflictDetected { local_version: i64, remote_version: i64 },
    ConflictResolved { resolution: ResolutionKind, version: i64 },
    DecryptionFailed { reason: String },
    /// The background job stopped after an authentication failure
    AutoSyncStopped { reason: String },
    /// A shared table was folded into, or pushed from, the local workspace
    SharedTableSynced { share_id: Uuid, version: i64 },
}
