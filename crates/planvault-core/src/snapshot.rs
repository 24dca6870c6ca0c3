use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Screen position of a table on the board (UI-only)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A single task row inside a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub completed: bool,
    /// Selection highlight in the editor (UI-only)
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_selected: bool,
    /// Fields this version does not model, kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            completed: false,
            is_selected: false,
            extra: Map::new(),
        }
    }

    /// True when the task carries no visible text
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// A table (a dated list of tasks) on the user's board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Board coordinates (UI-only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Stacking order on the board (UI-only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i64>,
    /// Selection highlight on the board (UI-only)
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_selected: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Table {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            date: None,
            start_time: None,
            tasks: Vec::new(),
            position: None,
            z_index: None,
            is_selected: false,
            extra: Map::new(),
        }
    }

    /// Builder-style helper used when assembling tables in code and tests
    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// True if at least one task has non-blank content
    pub fn has_content(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_blank())
    }
}

/// A named group tasks can be filed under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskGroup {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Free-form notes: one workspace-wide notebook plus one per task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notebooks {
    #[serde(default)]
    pub workspace: String,
    #[serde(default)]
    pub tasks: BTreeMap<String, String>,
}

/// The complete plaintext state of a user's workspace.
///
/// This is the unit that gets encrypted and pushed as one versioned blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSnapshot {
    #[serde(default)]
    pub tables: Vec<Table>,
    #[serde(default = "empty_object")]
    pub settings: Value,
    #[serde(default)]
    pub task_groups: Vec<TaskGroup>,
    #[serde(default)]
    pub notebooks: Notebooks,
    /// Diary text keyed by ISO date
    #[serde(default)]
    pub diaries: BTreeMap<String, String>,
    #[serde(default)]
    pub archived_tables: Vec<Value>,
}

impl Default for WorkspaceSnapshot {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            settings: empty_object(),
            task_groups: Vec::new(),
            notebooks: Notebooks::default(),
            diaries: BTreeMap::new(),
            archived_tables: Vec::new(),
        }
    }
}

impl WorkspaceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a snapshot holding only the given tables
    pub fn with_tables(tables: Vec<Table>) -> Self {
        Self {
            tables,
            ..Self::default()
        }
    }

    /// True when no table has a task with non-blank content.
    ///
    /// Settings, notebooks and diaries are deliberately ignored: a fresh
    /// device typically has default settings but no real work in it.
    pub fn is_semantically_empty(&self) -> bool {
        !self.tables.iter().any(Table::has_content)
    }

    pub fn table(&self, id: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.id == id)
    }

    pub fn table_mut(&mut self, id: &str) -> Option<&mut Table> {
        self.tables.iter_mut().find(|t| t.id == id)
    }

    /// Replace the table with the same id, or append it
    pub fn upsert_table(&mut self, table: Table) {
        match self.table_mut(&table.id) {
            Some(existing) => *existing = table,
            None => self.tables.push(table),
        }
    }

    /// Count of tasks across all tables with non-blank content
    pub fn task_count(&self) -> usize {
        self.tables
            .iter()
            .flat_map(|t| t.tasks.iter())
            .filter(|t| !t.is_blank())
            .count()
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn is_false(value: &bool) -> bool {
    !*value
}
