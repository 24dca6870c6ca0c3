pub mod crypto;
pub mod error;
pub mod merge;
pub mod normalize;
pub mod protocol;
pub mod snapshot;

pub use crypto::{DataKey, KeyPair, WorkspaceKey};
pub use error::CryptoError;
pub use merge::{
    merge_for_write, merge_owner_into_latest, merge_recipient_into_latest,
    merge_share_into_owner, WriteSide,
};
pub use normalize::{normalize, semantically_equal, tables_equal};
pub use protocol::Permission;
pub use snapshot::{Notebooks, Position, Table, Task, TaskGroup, WorkspaceSnapshot};
