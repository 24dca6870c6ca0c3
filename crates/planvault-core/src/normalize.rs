use serde_json::{Map, Value};

use crate::snapshot::{Table, Task, TaskGroup, WorkspaceSnapshot};

/// Object members treated as presentation state inside untyped objects
/// (archived tables are kept as raw JSON)
const UI_ONLY_KEYS: &[&str] = &["position", "zIndex", "isSelected"];

/// Strip UI-only fields and sort every collection by stable id.
///
/// The result is what conflict detection compares; `normalize` is idempotent.
pub fn normalize(snapshot: &WorkspaceSnapshot) -> WorkspaceSnapshot {
    let mut out = snapshot.clone();

    out.tables = snapshot.tables.iter().map(normalize_table).collect();
    out.tables.sort_by(|a, b| a.id.cmp(&b.id));

    out.task_groups.sort_by(|a, b| a.id.cmp(&b.id));

    for archived in &mut out.archived_tables {
        strip_ui_keys(archived);
    }
    // Stable: archived entries without an id keep their relative order
    out.archived_tables
        .sort_by(|a, b| archived_sort_key(a).cmp(&archived_sort_key(b)));

    out
}

/// Normalize a single table: UI-only fields cleared, tasks sorted by id
pub fn normalize_table(table: &Table) -> Table {
    let mut out = table.clone();
    out.position = None;
    out.z_index = None;
    out.is_selected = false;
    for task in &mut out.tasks {
        task.is_selected = false;
    }
    out.tasks.sort_by(|a, b| a.id.cmp(&b.id));
    out
}

/// True when two snapshots differ at most in UI-only fields or ordering
pub fn semantically_equal(a: &WorkspaceSnapshot, b: &WorkspaceSnapshot) -> bool {
    let (a, b) = (normalize(a), normalize(b));

    slices_equal(&a.tables, &b.tables, table_fields_equal)
        && values_equal(&a.settings, &b.settings)
        && slices_equal(&a.task_groups, &b.task_groups, task_groups_equal)
        && a.notebooks == b.notebooks
        && a.diaries == b.diaries
        && slices_equal(&a.archived_tables, &b.archived_tables, values_equal)
}

/// Semantic equality for a single table (used by shared-table sync)
pub fn tables_equal(a: &Table, b: &Table) -> bool {
    table_fields_equal(&normalize_table(a), &normalize_table(b))
}

/// Structural JSON equality where numbers compare by value (`1 == 1.0`)
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x == y
                || matches!((x.as_f64(), y.as_f64()), (Some(p), Some(q)) if p == q)
        }
        (Value::Array(x), Value::Array(y)) => slices_equal(x, y, values_equal),
        (Value::Object(x), Value::Object(y)) => maps_equal(x, y),
        _ => a == b,
    }
}

fn maps_equal(a: &Map<String, Value>, b: &Map<String, Value>) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .all(|(key, value)| b.get(key).is_some_and(|other| values_equal(value, other)))
}

fn slices_equal<T>(a: &[T], b: &[T], eq: fn(&T, &T) -> bool) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| eq(x, y))
}

// Expects already-normalized tables
fn table_fields_equal(a: &Table, b: &Table) -> bool {
    a.id == b.id
        && a.title == b.title
        && a.date == b.date
        && a.start_time == b.start_time
        && slices_equal(&a.tasks, &b.tasks, task_fields_equal)
        && maps_equal(&a.extra, &b.extra)
}

fn task_fields_equal(a: &Task, b: &Task) -> bool {
    a.id == b.id
        && a.content == b.content
        && a.completed == b.completed
        && maps_equal(&a.extra, &b.extra)
}

fn task_groups_equal(a: &TaskGroup, b: &TaskGroup) -> bool {
    a.id == b.id && a.name == b.name && maps_equal(&a.extra, &b.extra)
}

fn strip_ui_keys(value: &mut Value) {
    if let Value::Object(map) = value {
        for key in UI_ONLY_KEYS {
            map.remove(*key);
        }
    }
}

fn archived_sort_key(value: &Value) -> String {
    match value.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}
