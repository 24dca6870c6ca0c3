//! Merge rules for shared tables.
//!
//! There is no single bidirectional merge: who wins a task-id collision
//! depends on which direction the data is flowing.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::snapshot::{Table, Task};

/// Which party initiated a shared-table write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteSide {
    Owner,
    Recipient,
}

/// Fold a shared copy into the owner's local table when pulling.
///
/// Recipient-authored tasks win on id collision, tasks only the owner has
/// are appended, and the owner's title/date/start time are kept.
pub fn merge_share_into_owner(share: &Table, owner_local: &Table) -> Table {
    Table {
        tasks: union_tasks(&share.tasks, &owner_local.tasks),
        ..owner_local.clone()
    }
}

/// Re-apply the owner's local edits on top of the latest server copy after
/// a push conflict. The owner's tasks win on id collision.
pub fn merge_owner_into_latest(latest: &Table, owner_local: &Table) -> Table {
    Table {
        tasks: union_tasks(&owner_local.tasks, &latest.tasks),
        ..owner_local.clone()
    }
}

/// Re-apply a recipient's edits on top of the latest server copy after a
/// push conflict. Recipient tasks win, table metadata stays the owner's.
pub fn merge_recipient_into_latest(latest: &Table, recipient_local: &Table) -> Table {
    Table {
        tasks: union_tasks(&recipient_local.tasks, &latest.tasks),
        ..latest.clone()
    }
}

/// Merge for a push retry, choosing the direction from the writing side
pub fn merge_for_write(side: WriteSide, latest: &Table, local: &Table) -> Table {
    match side {
        WriteSide::Owner => merge_owner_into_latest(latest, local),
        WriteSide::Recipient => merge_recipient_into_latest(latest, local),
    }
}

/// All of `winner` in order, followed by the tasks of `other` whose ids
/// `winner` does not contain
fn union_tasks(winner: &[Task], other: &[Task]) -> Vec<Task> {
    let seen: HashSet<&str> = winner.iter().map(|t| t.id.as_str()).collect();
    winner
        .iter()
        .cloned()
        .chain(other.iter().filter(|t| !seen.contains(t.id.as_str())).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner_table() -> Table {
        let mut table = Table::new("t1", "Owner title")
            .with_task(Task::new("a", "owner's a"))
            .with_task(Task::new("own", "only owner"));
        table.date = Some("2024-06-01".to_string());
        table
    }

    fn share_table() -> Table {
        let mut table = Table::new("t1", "Renamed by recipient")
            .with_task(Task::new("a", "recipient's a"))
            .with_task(Task::new("rec", "only recipient"));
        table.date = Some("2030-01-01".to_string());
        table
    }

    #[test]
    fn test_share_into_owner_recipient_tasks_win() {
        let merged = merge_share_into_owner(&share_table(), &owner_table());

        assert_eq!(merged.title, "Owner title");
        assert_eq!(merged.date.as_deref(), Some("2024-06-01"));
        assert_eq!(merged.task("a").unwrap().content, "recipient's a");
        assert!(merged.task("rec").is_some());
        assert_eq!(merged.tasks.last().unwrap().id, "own");
        assert_eq!(merged.tasks.len(), 3);
    }

    #[test]
    fn test_owner_into_latest_owner_tasks_win() {
        let merged = merge_owner_into_latest(&share_table(), &owner_table());

        assert_eq!(merged.title, "Owner title");
        assert_eq!(merged.task("a").unwrap().content, "owner's a");
        assert!(merged.task("rec").is_some());
        assert!(merged.task("own").is_some());
        assert_eq!(merged.tasks.len(), 3);
    }

    #[test]
    fn test_recipient_into_latest_keeps_owner_metadata() {
        let mut latest = owner_table();
        latest.title = "Owner title v2".to_string();
        let merged = merge_recipient_into_latest(&latest, &share_table());

        assert_eq!(merged.title, "Owner title v2");
        assert_eq!(merged.date.as_deref(), Some("2024-06-01"));
        assert_eq!(merged.task("a").unwrap().content, "recipient's a");
        assert!(merged.task("own").is_some());
    }

    #[test]
    fn test_merge_for_write_dispatch() {
        let latest = share_table();
        let local = owner_table();
        assert_eq!(
            merge_for_write(WriteSide::Owner, &latest, &local),
            merge_owner_into_latest(&latest, &local)
        );
        assert_eq!(
            merge_for_write(WriteSide::Recipient, &latest, &local),
            merge_recipient_into_latest(&latest, &local)
        );
    }
}
