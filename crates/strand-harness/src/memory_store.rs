#![forbid(unsafe_code)]

//! In-memory JSON store that emits [`MutationEvent`]s.
//!
//! The document is a single `serde_json::Value` rooted at an object.
//! Listeners run synchronously after the mutation has been applied, with no
//! borrow of the store held, so they may read or mutate it again.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::{Map, Value};
use strand_core::{ElementId, EventKind, MutationEvent, Path, Provenance, Segment};
use strand_runtime::{ListenerId, Store, StoreError, StoreListener};
use tracing::trace;

struct Subscription {
    id: ListenerId,
    kind: EventKind,
    listener: StoreListener,
}

#[derive(Default)]
pub struct MemoryStore {
    doc: RefCell<Value>,
    subscriptions: RefCell<Vec<Subscription>>,
    next_listener: Cell<u64>,
    events: RefCell<Vec<MutationEvent>>,
    silently_destroyed: RefCell<Vec<String>>,
    unloads: Cell<u32>,
    fail_unsubscribe: Cell<bool>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// A store whose root document is `doc` (an object).
    #[must_use]
    pub fn with_document(doc: Value) -> Rc<Self> {
        let store = Self::default();
        *store.doc.borrow_mut() = doc;
        Rc::new(store)
    }

    /// Make every later `unsubscribe` fail.
    pub fn fail_unsubscribe(&self, fail: bool) {
        self.fail_unsubscribe.set(fail);
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.subscriptions.borrow().len()
    }

    #[must_use]
    pub fn unload_count(&self) -> u32 {
        self.unloads.get()
    }

    /// Paths passed to `destroy_silently`, in call order.
    #[must_use]
    pub fn silently_destroyed(&self) -> Vec<String> {
        self.silently_destroyed.borrow().clone()
    }

    /// Every event emitted so far.
    #[must_use]
    pub fn events(&self) -> Vec<MutationEvent> {
        self.events.borrow().clone()
    }

    #[must_use]
    pub fn document(&self) -> Value {
        self.doc.borrow().clone()
    }

    /// Replace the value at `path` with change provenance `pass`.
    pub fn set_with(
        &self,
        path: &str,
        value: Value,
        pass: Option<Provenance>,
    ) -> Result<(), StoreError> {
        let parsed = Path::parse(path)?;
        let previous = {
            let mut doc = self.doc.borrow_mut();
            let slot = slot_mut(&mut doc, &parsed, true)
                .ok_or_else(|| StoreError::NotFound { path: path.to_owned() })?;
            std::mem::replace(slot, value.clone())
        };
        self.emit(MutationEvent::Change {
            path: path.to_owned(),
            value,
            previous,
            pass,
        });
        Ok(())
    }

    /// Insert `values` into the list at `path` starting at `index`.
    pub fn insert(&self, path: &str, index: usize, values: Vec<Value>) -> Result<(), StoreError> {
        let parsed = Path::parse(path)?;
        let index = self.with_list(&parsed, |list| {
            let index = index.min(list.len());
            list.splice(index..index, values.iter().cloned());
            index
        })?;
        self.emit(MutationEvent::Insert {
            path: path.to_owned(),
            index,
            values,
        });
        Ok(())
    }

    pub fn push(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let len = self.list_len(path)?;
        self.insert(path, len, vec![value])
    }

    /// Remove `count` items at `index` from the list at `path`.
    pub fn remove(&self, path: &str, index: usize, count: usize) -> Result<Vec<Value>, StoreError> {
        let parsed = Path::parse(path)?;
        let (index, values) = self.with_list(&parsed, |list| {
            let start = index.min(list.len());
            let end = start.saturating_add(count).min(list.len());
            (start, list.drain(start..end).collect::<Vec<_>>())
        })?;
        self.emit(MutationEvent::Remove {
            path: path.to_owned(),
            index,
            values: values.clone(),
        });
        Ok(values)
    }

    /// Move `count` items from `from` to `to` in the list at `path`.
    ///
    /// `to` is the position of the first moved item after the move. The
    /// emitted event carries the positions actually applied.
    pub fn move_items(
        &self,
        path: &str,
        from: usize,
        to: usize,
        count: usize,
    ) -> Result<(), StoreError> {
        let parsed = Path::parse(path)?;
        let (from, to, count) = self.with_list(&parsed, |list| {
            let start = from.min(list.len());
            let end = start.saturating_add(count).min(list.len());
            let moved: Vec<Value> = list.drain(start..end).collect();
            let at = to.min(list.len());
            let count = moved.len();
            list.splice(at..at, moved);
            (start, at, count)
        })?;
        self.emit(MutationEvent::Move {
            path: path.to_owned(),
            from,
            to,
            count,
        });
        Ok(())
    }

    /// Insert `text` into the string at `path` at char offset `index`.
    pub fn string_insert(&self, path: &str, index: usize, text: &str) -> Result<(), StoreError> {
        let previous = self.string_at(path)?;
        let next = strand_runtime::text_patch::splice_insert(&previous, index, text);
        let pass = Provenance::StringInsert {
            previous,
            index,
            text: text.to_owned(),
        };
        self.set_with(path, Value::String(next), Some(pass))
    }

    /// Remove `count` chars at `index` from the string at `path`.
    pub fn string_remove(&self, path: &str, index: usize, count: usize) -> Result<(), StoreError> {
        let previous = self.string_at(path)?;
        let next = strand_runtime::text_patch::splice_remove(&previous, index, count);
        let pass = Provenance::StringRemove {
            previous,
            index,
            count,
        };
        self.set_with(path, Value::String(next), Some(pass))
    }

    /// A change made by a control; the page skips that control's update.
    pub fn set_from(&self, path: &str, value: Value, origin: ElementId) -> Result<(), StoreError> {
        self.set_with(path, value, Some(Provenance::Local { origin }))
    }

    /// Put a document at `path` and emit a load event.
    pub fn load(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let parsed = Path::parse(path)?;
        {
            let mut doc = self.doc.borrow_mut();
            let slot = slot_mut(&mut doc, &parsed, true)
                .ok_or_else(|| StoreError::NotFound { path: path.to_owned() })?;
            *slot = value;
        }
        self.emit(MutationEvent::Load {
            path: path.to_owned(),
        });
        Ok(())
    }

    /// Drop the document at `path` and emit an unload event.
    pub fn unload(&self, path: &str) -> Result<(), StoreError> {
        let parsed = Path::parse(path)?;
        remove_at(&mut self.doc.borrow_mut(), &parsed);
        self.emit(MutationEvent::Unload {
            path: path.to_owned(),
        });
        Ok(())
    }

    /// Deliver a raw event to listeners without touching the document.
    pub fn emit(&self, event: MutationEvent) {
        let kind = event.kind();
        let listeners: Vec<StoreListener> = self
            .subscriptions
            .borrow()
            .iter()
            .filter(|sub| sub.kind == kind)
            .map(|sub| Rc::clone(&sub.listener))
            .collect();
        trace!(%kind, path = event.path(), listeners = listeners.len(), "emit");
        self.events.borrow_mut().push(event.clone());
        for listener in listeners {
            listener(&event);
        }
    }

    fn list_len(&self, path: &str) -> Result<usize, StoreError> {
        match self.get(path) {
            None => Ok(0),
            Some(Value::Array(list)) => Ok(list.len()),
            Some(_) => Err(StoreError::TypeMismatch {
                path: path.to_owned(),
                expected: "array",
            }),
        }
    }

    fn string_at(&self, path: &str) -> Result<String, StoreError> {
        match self.get(path) {
            None | Some(Value::Null) => Ok(String::new()),
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(StoreError::TypeMismatch {
                path: path.to_owned(),
                expected: "string",
            }),
        }
    }

    fn with_list<R>(
        &self,
        path: &Path,
        f: impl FnOnce(&mut Vec<Value>) -> R,
    ) -> Result<R, StoreError> {
        let mut doc = self.doc.borrow_mut();
        let slot =
            slot_mut(&mut doc, path, true).ok_or_else(|| StoreError::NotFound { path: path.to_string() })?;
        if slot.is_null() {
            *slot = Value::Array(Vec::new());
        }
        match slot {
            Value::Array(list) => Ok(f(list)),
            _ => Err(StoreError::TypeMismatch {
                path: path.to_string(),
                expected: "array",
            }),
        }
    }
}

impl Store for MemoryStore {
    fn subscribe(&self, kind: EventKind, listener: StoreListener) -> ListenerId {
        let id = ListenerId(self.next_listener.get() + 1);
        self.next_listener.set(id.0);
        self.subscriptions.borrow_mut().push(Subscription { id, kind, listener });
        id
    }

    fn unsubscribe(&self, id: ListenerId) -> Result<(), StoreError> {
        if self.fail_unsubscribe.get() {
            return Err(StoreError::Rejected(format!("unsubscribe {id} refused")));
        }
        let mut subscriptions = self.subscriptions.borrow_mut();
        let before = subscriptions.len();
        subscriptions.retain(|sub| sub.id != id);
        if subscriptions.len() == before {
            return Err(StoreError::UnknownListener(id));
        }
        Ok(())
    }

    fn get(&self, path: &str) -> Option<Value> {
        let path = Path::parse(path).ok()?;
        let doc = self.doc.borrow();
        let mut node = &*doc;
        for segment in &path {
            node = step(node, segment)?;
        }
        Some(node.clone())
    }

    fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.set_with(path, value, None)
    }

    fn destroy_silently(&self, path: &str) {
        if let Ok(parsed) = Path::parse(path) {
            remove_at(&mut self.doc.borrow_mut(), &parsed);
        }
        self.silently_destroyed.borrow_mut().push(path.to_owned());
    }

    fn unload_all(&self) {
        *self.doc.borrow_mut() = Value::Object(Map::new());
        self.unloads.set(self.unloads.get() + 1);
    }
}

fn step<'a>(node: &'a Value, segment: &Segment) -> Option<&'a Value> {
    match (node, segment) {
        (Value::Object(map), Segment::Key(key)) => map.get(key),
        (Value::Object(map), Segment::Index(i)) => map.get(&i.to_string()),
        (Value::Array(list), Segment::Index(i)) => list.get(*i),
        _ => None,
    }
}

/// The value slot at `path`, creating missing object members when `create`
/// is set. List positions are never created.
fn slot_mut<'a>(node: &'a mut Value, path: &Path, create: bool) -> Option<&'a mut Value> {
    let mut node = node;
    for segment in path {
        if create && node.is_null() {
            *node = Value::Object(Map::new());
        }
        node = match (node, segment) {
            (Value::Object(map), Segment::Key(key)) => {
                if create {
                    map.entry(key.clone()).or_insert(Value::Null)
                } else {
                    map.get_mut(key)?
                }
            }
            (Value::Object(map), Segment::Index(i)) => {
                let key = i.to_string();
                if create {
                    map.entry(key).or_insert(Value::Null)
                } else {
                    map.get_mut(&key)?
                }
            }
            (Value::Array(list), Segment::Index(i)) => list.get_mut(*i)?,
            _ => return None,
        };
    }
    Some(node)
}

fn remove_at(doc: &mut Value, path: &Path) {
    let Some(parent) = path.parent() else {
        *doc = Value::Object(Map::new());
        return;
    };
    let Some(container) = slot_mut(doc, &parent, false) else {
        return;
    };
    match (container, path.last()) {
        (Value::Object(map), Some(Segment::Key(key))) => {
            map.remove(key);
        }
        (Value::Object(map), Some(Segment::Index(i))) => {
            map.remove(&i.to_string());
        }
        (Value::Array(list), Some(Segment::Index(i))) if *i < list.len() => {
            list.remove(*i);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(store: &Rc<MemoryStore>, kind: EventKind) -> Rc<RefCell<Vec<MutationEvent>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        store.subscribe(
            kind,
            Rc::new(move |event: &MutationEvent| sink.borrow_mut().push(event.clone())),
        );
        seen
    }

    #[test]
    fn set_creates_members_and_reports_previous() {
        let store = MemoryStore::new();
        let seen = record(&store, EventKind::Change);
        store.set("users.0.name", json!("Al")).unwrap();
        store.set("users.0.name", json!("Bob")).unwrap();
        assert_eq!(store.get("users.0.name"), Some(json!("Bob")));
        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert!(matches!(
            &seen[1],
            MutationEvent::Change { previous, value, .. }
                if *previous == json!("Al") && *value == json!("Bob")
        ));
    }

    #[test]
    fn lookup_without_create_leaves_document_alone() {
        let store = MemoryStore::new();
        store.set("users.0.name", json!("Al")).unwrap();
        store.set("users.0.age", json!(3)).unwrap();

        // index segments on objects address the stringified key both ways
        store.destroy_silently("users.0.name");
        assert_eq!(store.get("users.0.name"), None);
        assert_eq!(store.get("users.0.age"), Some(json!(3)));

        store.destroy_silently("nobody.0.x");
        assert_eq!(store.document(), json!({ "users": { "0": { "age": 3 } } }));
    }

    #[test]
    fn list_operations_edit_the_array() {
        let store = MemoryStore::with_document(json!({ "todos": [0, 1, 2, 3] }));
        store.remove("todos", 1, 1).unwrap();
        assert_eq!(store.get("todos"), Some(json!([0, 2, 3])));
        store.insert("todos", 1, vec![json!(9)]).unwrap();
        assert_eq!(store.get("todos"), Some(json!([0, 9, 2, 3])));
        store.move_items("todos", 0, 2, 1).unwrap();
        assert_eq!(store.get("todos"), Some(json!([9, 2, 0, 3])));
        store.push("todos", json!(4)).unwrap();
        assert_eq!(store.get("todos.4"), Some(json!(4)));
    }

    #[test]
    fn string_edits_carry_provenance() {
        let store = MemoryStore::with_document(json!({ "draft": { "text": "helo" } }));
        let seen = record(&store, EventKind::Change);
        store.string_insert("draft.text", 3, "l").unwrap();
        assert_eq!(store.get("draft.text"), Some(json!("hello")));
        store.string_remove("draft.text", 0, 1).unwrap();
        assert_eq!(store.get("draft.text"), Some(json!("ello")));
        let seen = seen.borrow();
        assert!(matches!(
            &seen[0],
            MutationEvent::Change { pass: Some(Provenance::StringInsert { previous, index: 3, text }), .. }
                if previous == "helo" && text == "l"
        ));
    }

    #[test]
    fn listeners_may_reenter() {
        let store = MemoryStore::new();
        let inner = Rc::clone(&store);
        store.subscribe(
            EventKind::Change,
            Rc::new(move |event: &MutationEvent| {
                if event.path() == "a" {
                    inner.set("b", json!(1)).unwrap();
                }
            }),
        );
        store.set("a", json!(0)).unwrap();
        assert_eq!(store.get("b"), Some(json!(1)));
        assert_eq!(store.events().len(), 2);
    }

    #[test]
    fn unsubscribe_unknown_and_refused() {
        let store = MemoryStore::new();
        let id = store.subscribe(EventKind::Load, Rc::new(|_: &MutationEvent| {}));
        store.fail_unsubscribe(true);
        assert!(matches!(store.unsubscribe(id), Err(StoreError::Rejected(_))));
        store.fail_unsubscribe(false);
        assert_eq!(store.unsubscribe(id), Ok(()));
        assert_eq!(store.unsubscribe(id), Err(StoreError::UnknownListener(id)));
    }

    #[test]
    fn silent_destroy_and_unload_emit_nothing() {
        let store = MemoryStore::with_document(json!({ "_page": { "x": 1 }, "keep": 2 }));
        let seen = record(&store, EventKind::Unload);
        store.destroy_silently("_page");
        assert_eq!(store.get("_page"), None);
        assert_eq!(store.get("keep"), Some(json!(2)));
        store.unload_all();
        assert_eq!(store.get("keep"), None);
        assert_eq!(store.unload_count(), 1);
        assert!(seen.borrow().is_empty());
    }
}
