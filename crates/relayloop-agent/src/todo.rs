use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

/// Status of a single todo item, mirroring the states a turn loop drives it through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
    pub priority: TodoPriority,
}

/// A draft item as supplied to `write`, before ids are checked for uniqueness.
#[derive(Debug, Clone)]
pub struct TodoDraft {
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
    pub priority: TodoPriority,
}

impl TodoDraft {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            status: TodoStatus::Pending,
            priority: TodoPriority::Medium,
        }
    }
}

/// A patch applied via `update`: only the fields present are changed.
#[derive(Debug, Clone, Default)]
pub struct TodoPatch {
    pub status: Option<TodoStatus>,
    pub content: Option<String>,
    pub priority: Option<TodoPriority>,
}

/// Observer callback invoked whenever the todo list changes — the turn loop uses
/// this to publish `todo_list_changed` events onto the Event Bus without the
/// store itself depending on the bus. An observer that panics is caught so it
/// cannot prevent the remaining observers from being notified.
pub type TodoObserver = Arc<dyn Fn(&[TodoItem]) + Send + Sync>;

struct Subscription {
    id: u64,
    observer: TodoObserver,
}

struct TodoState {
    items: Vec<TodoItem>,
}

/// Per-session todo list. A fresh list can only be started once every existing
/// item is completed (or the store is empty) — this mirrors the single-active-plan
/// convention and keeps a parent agent from silently abandoning tracked work.
/// At most one item may be `in_progress` at any time.
pub struct TodoStore {
    state: Mutex<TodoState>,
    subscribers: Mutex<Vec<Subscription>>,
    next_sub_id: AtomicU64,
}

impl Default for TodoStore {
    fn default() -> Self {
        Self::new()
    }
}

fn in_progress_count(items: &[TodoItem]) -> usize {
    items
        .iter()
        .filter(|i| i.status == TodoStatus::InProgress)
        .count()
}

/// Items that still block a fresh `write` — anything short of completed or
/// cancelled, i.e. `pending` or `in_progress`.
fn open_count_in(items: &[TodoItem]) -> usize {
    items
        .iter()
        .filter(|i| !matches!(i.status, TodoStatus::Completed | TodoStatus::Cancelled))
        .count()
}

/// Items literally in `pending` status — what the refusal message reports,
/// distinct from `open_count_in`'s broader "still outstanding" count.
fn pending_count_in(items: &[TodoItem]) -> usize {
    items.iter().filter(|i| i.status == TodoStatus::Pending).count()
}

impl TodoStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TodoState { items: Vec::new() }),
            subscribers: Mutex::new(Vec::new()),
            next_sub_id: AtomicU64::new(1),
        }
    }

    /// Register an observer, returning a handle usable with `unsubscribe`.
    pub fn subscribe(&self, observer: TodoObserver) -> u64 {
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().unwrap().push(Subscription { id, observer });
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().retain(|s| s.id != id);
    }

    fn notify(&self, items: &[TodoItem]) {
        let subs = self.subscribers.lock().unwrap();
        for sub in subs.iter() {
            let observer = sub.observer.clone();
            let items = items.to_vec();
            // An observer is run behind catch_unwind so one misbehaving callback
            // cannot stop the rest of the list from being notified.
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
                observer(&items);
            }));
        }
    }

    /// Replace the whole list with a fresh set of items. Refuses while any
    /// existing item is not completed/cancelled, and refuses duplicate ids or
    /// more than one in_progress item in the draft.
    pub fn write(&self, drafts: Vec<TodoDraft>) -> Result<Vec<TodoItem>, String> {
        let mut state = self.state.lock().unwrap();
        if open_count_in(&state.items) > 0 {
            return Err(format!(
                "Cannot create new todo list while {} tasks are still pending",
                pending_count_in(&state.items)
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for d in &drafts {
            if !seen.insert(d.id.clone()) {
                return Err(format!("Duplicate todo id: {}", d.id));
            }
        }

        let new_items: Vec<TodoItem> = drafts
            .into_iter()
            .map(|d| TodoItem {
                id: d.id,
                content: d.content,
                status: d.status,
                priority: d.priority,
            })
            .collect();

        if in_progress_count(&new_items) > 1 {
            return Err("At most one todo item may be in_progress".to_string());
        }

        state.items = new_items;
        let snapshot = state.items.clone();
        drop(state);
        self.notify(&snapshot);
        Ok(snapshot)
    }

    pub fn read(&self) -> Vec<TodoItem> {
        self.state.lock().unwrap().items.clone()
    }

    /// Apply a partial update to one item. Rejects the update if it would leave
    /// more than one item `in_progress`.
    pub fn update(&self, id: &str, patch: TodoPatch) -> Result<TodoItem, String> {
        let mut state = self.state.lock().unwrap();

        let position = state
            .items
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| format!("No todo item with id {}", id))?;

        let mut candidate = state.items[position].clone();
        if let Some(status) = patch.status {
            candidate.status = status;
        }
        if let Some(content) = patch.content {
            candidate.content = content;
        }
        if let Some(priority) = patch.priority {
            candidate.priority = priority;
        }

        let others_in_progress = state
            .items
            .iter()
            .enumerate()
            .filter(|(i, item)| *i != position && item.status == TodoStatus::InProgress)
            .count();
        if candidate.status == TodoStatus::InProgress && others_in_progress > 0 {
            return Err("At most one todo item may be in_progress".to_string());
        }

        state.items[position] = candidate.clone();
        let snapshot = state.items.clone();
        drop(state);
        self.notify(&snapshot);
        Ok(candidate)
    }

    pub fn complete(&self, id: &str) -> Result<TodoItem, String> {
        self.update(
            id,
            TodoPatch {
                status: Some(TodoStatus::Completed),
                ..Default::default()
            },
        )
    }

    /// Clear the store entirely, unconditionally. Observers are notified once.
    pub fn delete(&self) {
        let mut state = self.state.lock().unwrap();
        state.items.clear();
        drop(state);
        self.notify(&[]);
    }

    pub fn pending_count(&self) -> usize {
        open_count_in(&self.state.lock().unwrap().items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read() {
        let store = TodoStore::new();
        let items = store
            .write(vec![TodoDraft::new("a", "task a"), TodoDraft::new("b", "task b")])
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].status, TodoStatus::Pending);
        assert_eq!(store.read().len(), 2);
    }

    #[test]
    fn test_write_refused_while_pending() {
        let store = TodoStore::new();
        store.write(vec![TodoDraft::new("a", "task a")]).unwrap();
        let err = store.write(vec![TodoDraft::new("b", "task b")]).unwrap_err();
        assert_eq!(err, "Cannot create new todo list while 1 tasks are still pending");
    }

    #[test]
    fn test_write_refused_counts_only_literally_pending() {
        // S4: one in_progress item and one pending item outstanding — the
        // refusal message reports the single literally-`pending` item, not
        // the count of all outstanding (non-terminal) items.
        let store = TodoStore::new();
        store
            .write(vec![
                TodoDraft {
                    id: "1".to_string(),
                    content: "first".to_string(),
                    status: TodoStatus::InProgress,
                    priority: TodoPriority::Medium,
                },
                TodoDraft::new("2", "second"),
            ])
            .unwrap();

        let err = store
            .write(vec![TodoDraft::new("3", "third")])
            .unwrap_err();
        assert_eq!(err, "Cannot create new todo list while 1 tasks are still pending");
    }

    #[test]
    fn test_write_allowed_after_completion() {
        let store = TodoStore::new();
        store.write(vec![TodoDraft::new("a", "task a")]).unwrap();
        store.complete("a").unwrap();
        let fresh = store.write(vec![TodoDraft::new("b", "task b")]).unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].content, "task b");
    }

    #[test]
    fn test_write_rejects_duplicate_ids() {
        let store = TodoStore::new();
        let err = store
            .write(vec![TodoDraft::new("a", "x"), TodoDraft::new("a", "y")])
            .unwrap_err();
        assert!(err.contains("Duplicate todo id"));
    }

    #[test]
    fn test_write_rejects_multiple_in_progress() {
        let store = TodoStore::new();
        let mut a = TodoDraft::new("a", "x");
        a.status = TodoStatus::InProgress;
        let mut b = TodoDraft::new("b", "y");
        b.status = TodoStatus::InProgress;
        let err = store.write(vec![a, b]).unwrap_err();
        assert!(err.contains("in_progress"));
    }

    #[test]
    fn test_update_and_observer() {
        let store = TodoStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        store.subscribe(Arc::new(move |items: &[TodoItem]| {
            seen_clone.lock().unwrap().push(items.len());
        }));

        store
            .write(vec![TodoDraft::new("a", "a"), TodoDraft::new("b", "b")])
            .unwrap();
        store
            .update(
                "a",
                TodoPatch {
                    status: Some(TodoStatus::InProgress),
                    ..Default::default()
                },
            )
            .unwrap();
        store.complete("a").unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![2, 2, 2]);
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn test_update_rejects_second_in_progress() {
        let store = TodoStore::new();
        store
            .write(vec![TodoDraft::new("a", "a"), TodoDraft::new("b", "b")])
            .unwrap();
        store
            .update("a", TodoPatch { status: Some(TodoStatus::InProgress), ..Default::default() })
            .unwrap();
        let err = store
            .update("b", TodoPatch { status: Some(TodoStatus::InProgress), ..Default::default() })
            .unwrap_err();
        assert!(err.contains("in_progress"));
    }

    #[test]
    fn test_update_unknown_id() {
        let store = TodoStore::new();
        let err = store.update("ghost", TodoPatch::default()).unwrap_err();
        assert_eq!(err, "No todo item with id ghost");
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let store = TodoStore::new();
        let seen = Arc::new(Mutex::new(0));
        let seen_clone = seen.clone();
        let sub_id = store.subscribe(Arc::new(move |_items: &[TodoItem]| {
            *seen_clone.lock().unwrap() += 1;
        }));
        store.write(vec![TodoDraft::new("a", "a")]).unwrap();
        store.unsubscribe(sub_id);
        store.complete("a").unwrap();
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn test_delete_resets_pending_gate() {
        let store = TodoStore::new();
        store.write(vec![TodoDraft::new("a", "a")]).unwrap();
        store.delete();
        assert_eq!(store.pending_count(), 0);
        let fresh = store.write(vec![TodoDraft::new("b", "b")]).unwrap();
        assert_eq!(fresh.len(), 1);
    }
}
