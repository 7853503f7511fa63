#![forbid(unsafe_code)]

//! Path-indexed dependency model.
//!
//! The [`EventModel`] is a trie keyed by path [`Segment`]s. Each node holds
//! the bindings that depend on the path spelled by the route to it, and the
//! item contexts rooted there. Store mutations are translated into a
//! [`Dispatch`]: the bindings to notify (each once, in id order), the item
//! contexts whose data changed, and whatever structural edits evicted.
//!
//! # Matching
//!
//! A dependency pattern `D` matches a mutated path `P` when every position
//! both have agrees (`*` accepts any one segment, `**` accepts the rest).
//! That covers ancestors of `P` (their value contains the change), `P`
//! itself, and descendants of `P` (their value was replaced).
//!
//! # Structural edits
//!
//! `insert`, `remove`, and `move` shift the positions of items in a list.
//! Item contexts under a shifted position are re-keyed to the new position,
//! and so are the dependencies of bindings those contexts own: they follow
//! their item. A dependency registered at a fixed index that merely happens
//! to sit under a shifted position stays put and is told its data changed.
//!
//! # Invariants
//!
//! 1. Every indexed binding and item context appears under every path it
//!    depends on, and nowhere else.
//! 2. Removal leaves no dangling ids; empty nodes are pruned.
//! 3. Structural operations never fail. Indices beyond the known positions
//!    are applied with splice arithmetic and logged at debug level.

use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use strand_core::{Path, Provenance, Segment};
use tracing::debug;

use crate::error::RuntimeError;
use crate::view::{BindingId, ItemContext, ItemContextId, Notification};

/// Bindings and item contexts dropped from the index by a removal.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub contexts: Vec<ItemContextId>,
    pub bindings: Vec<BindingId>,
}

impl Eviction {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty() && self.bindings.is_empty()
    }
}

/// Result of applying one mutation to the index.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Dispatch {
    /// Bindings to notify, at most once each, in ascending id order.
    pub notifications: Vec<(BindingId, Notification)>,
    /// Item contexts rooted at or under a replaced path.
    pub changed_contexts: Vec<ItemContextId>,
    /// Entries removed from the index by a structural removal.
    pub evicted: Eviction,
}

impl Dispatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty() && self.changed_contexts.is_empty() && self.evicted.is_empty()
    }

    /// The notification for `binding`, if it was dispatched.
    #[must_use]
    pub fn notification(&self, binding: BindingId) -> Option<&Notification> {
        self.notifications
            .iter()
            .find(|(id, _)| *id == binding)
            .map(|(_, n)| n)
    }
}

#[derive(Default)]
struct Notifier {
    pending: FxHashMap<BindingId, Notification>,
}

impl Notifier {
    fn notify(&mut self, binding: BindingId, notification: Notification) {
        match self.pending.remove(&binding) {
            Some(prev) => self.pending.insert(binding, prev.merge(notification)),
            None => self.pending.insert(binding, notification),
        };
    }

    fn notify_all(&mut self, bindings: impl IntoIterator<Item = BindingId>, notification: &Notification) {
        for binding in bindings {
            self.notify(binding, notification.clone());
        }
    }

    fn finish(self, evicted: &[BindingId]) -> Vec<(BindingId, Notification)> {
        let mut out: Vec<_> = self
            .pending
            .into_iter()
            .filter(|(id, _)| !evicted.contains(id))
            .collect();
        out.sort_unstable_by_key(|(id, _)| *id);
        out
    }
}

#[derive(Default)]
struct Node {
    children: FxHashMap<Segment, Node>,
    bindings: FxHashSet<BindingId>,
    contexts: FxHashSet<ItemContextId>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.bindings.is_empty() && self.contexts.is_empty()
    }

    fn find(&self, path: &Path) -> Option<&Node> {
        path.iter()
            .try_fold(self, |node, segment| node.children.get(segment))
    }

    fn descend_mut(&mut self, path: &Path) -> &mut Node {
        path.iter().fold(self, |node, segment| {
            node.children.entry(segment.clone()).or_default()
        })
    }

    /// Apply `f` to the node at `segments`, pruning nodes left empty.
    fn update_at(&mut self, segments: &[Segment], f: &mut dyn FnMut(&mut Node) -> bool) -> bool {
        let Some((head, rest)) = segments.split_first() else {
            return f(self);
        };
        let Some(child) = self.children.get_mut(head) else {
            return false;
        };
        let changed = child.update_at(rest, f);
        if child.is_empty() {
            self.children.remove(head);
        }
        changed
    }

    fn collect_bindings(&self, out: &mut Vec<BindingId>) {
        out.extend(self.bindings.iter().copied());
        for child in self.children.values() {
            child.collect_bindings(out);
        }
    }

    fn collect_contexts(&self, out: &mut Vec<ItemContextId>) {
        out.extend(self.contexts.iter().copied());
        for child in self.children.values() {
            child.collect_contexts(out);
        }
    }

    /// Bindings whose pattern matches `path`, starting at `depth`.
    fn collect_matching(&self, path: &Path, depth: usize, out: &mut Vec<BindingId>) {
        let segments = path.segments();
        let Some(segment) = segments.get(depth) else {
            self.collect_bindings(out);
            return;
        };
        out.extend(self.bindings.iter().copied());
        if let Some(glob) = self.children.get(&Segment::Glob) {
            glob.collect_bindings(out);
        }
        if let Some(wild) = self.children.get(&Segment::Wildcard) {
            wild.collect_matching(path, depth + 1, out);
        }
        if !segment.is_wildcard()
            && let Some(exact) = self.children.get(segment)
        {
            exact.collect_matching(path, depth + 1, out);
        }
    }

    /// Notifications for bindings at or above a collection being edited.
    ///
    /// Bindings on the collection itself get `structural`; bindings above it
    /// (or globbing over it) get `Changed`. Below a wildcard-matched
    /// collection everything is conservatively `Changed`.
    fn collect_collection(
        &self,
        path: &Path,
        depth: usize,
        exact: bool,
        structural: &Notification,
        notifier: &mut Notifier,
    ) {
        let segments = path.segments();
        let Some(segment) = segments.get(depth) else {
            notifier.notify_all(self.bindings.iter().copied(), structural);
            for (key, child) in &self.children {
                let below_all = !exact || matches!(key, Segment::Glob | Segment::Wildcard);
                if below_all {
                    let mut ids = Vec::new();
                    child.collect_bindings(&mut ids);
                    notifier.notify_all(ids, &Notification::CHANGED);
                }
            }
            return;
        };
        notifier.notify_all(self.bindings.iter().copied(), &Notification::CHANGED);
        if let Some(glob) = self.children.get(&Segment::Glob) {
            let mut ids = Vec::new();
            glob.collect_bindings(&mut ids);
            notifier.notify_all(ids, &Notification::CHANGED);
        }
        if let Some(wild) = self.children.get(&Segment::Wildcard) {
            wild.collect_collection(path, depth + 1, false, structural, notifier);
        }
        if !segment.is_wildcard()
            && let Some(child) = self.children.get(segment)
        {
            child.collect_collection(path, depth + 1, exact, structural, notifier);
        }
    }

    fn count(&self) -> usize {
        1 + self.children.values().map(Node::count).sum::<usize>()
    }
}

struct IndexedBinding {
    paths: SmallVec<[Path; 2]>,
    owner: Option<ItemContextId>,
}

struct IndexedContext {
    item: Rc<ItemContext>,
    owned: FxHashSet<BindingId>,
    children: FxHashSet<ItemContextId>,
}

/// The page's dependency index.
#[derive(Default)]
pub struct EventModel {
    root: Node,
    bindings: FxHashMap<BindingId, IndexedBinding>,
    contexts: FxHashMap<ItemContextId, IndexedContext>,
}

impl EventModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // --- registration -----------------------------------------------------

    /// Index `binding` under each of `paths`.
    ///
    /// `owner` is the innermost item context the binding was created in;
    /// its dependencies under that item follow the item when it moves. A
    /// binding with no paths is still tracked so that evicting its owner
    /// evicts it. Re-adding an id replaces its previous entry.
    pub fn add_binding(
        &mut self,
        binding: BindingId,
        paths: impl IntoIterator<Item = Path>,
        owner: Option<ItemContextId>,
    ) {
        self.remove_binding(binding);
        let mut indexed: SmallVec<[Path; 2]> = SmallVec::new();
        for path in paths {
            if indexed.contains(&path) {
                continue;
            }
            self.root.descend_mut(&path).bindings.insert(binding);
            indexed.push(path);
        }
        if let Some(owner) = owner
            && let Some(ctx) = self.contexts.get_mut(&owner)
        {
            ctx.owned.insert(binding);
        }
        self.bindings.insert(
            binding,
            IndexedBinding {
                paths: indexed,
                owner,
            },
        );
    }

    /// Drop every entry of `binding`. Returns whether it was indexed.
    pub fn remove_binding(&mut self, binding: BindingId) -> bool {
        let Some(entry) = self.bindings.remove(&binding) else {
            return false;
        };
        for path in &entry.paths {
            self.root
                .update_at(path.segments(), &mut |node| node.bindings.remove(&binding));
        }
        if let Some(owner) = entry.owner
            && let Some(ctx) = self.contexts.get_mut(&owner)
        {
            ctx.owned.remove(&binding);
        }
        true
    }

    /// Index an item context at its current path.
    pub fn add_item_context(&mut self, item: Rc<ItemContext>) {
        let id = item.id();
        if self.contexts.contains_key(&id) {
            self.remove_item_context(id);
        }
        self.root.descend_mut(&item.path()).contexts.insert(id);
        if let Some(parent) = item.parent()
            && let Some(parent) = self.contexts.get_mut(&parent)
        {
            parent.children.insert(id);
        }
        self.contexts.insert(
            id,
            IndexedContext {
                item,
                owned: FxHashSet::default(),
                children: FxHashSet::default(),
            },
        );
    }

    /// Drop an item context, the contexts nested in it, and every binding
    /// they own.
    pub fn remove_item_context(&mut self, id: ItemContextId) -> Eviction {
        let mut eviction = Eviction::default();
        self.evict(vec![id], &mut eviction);
        eviction.contexts.sort_unstable();
        eviction.bindings.sort_unstable();
        eviction
    }

    // --- queries ----------------------------------------------------------

    #[must_use]
    pub fn contains_binding(&self, binding: BindingId) -> bool {
        self.bindings.contains_key(&binding)
    }

    /// The paths `binding` is currently indexed under.
    #[must_use]
    pub fn binding_paths(&self, binding: BindingId) -> Option<&[Path]> {
        self.bindings.get(&binding).map(|entry| entry.paths.as_slice())
    }

    #[must_use]
    pub fn item_context(&self, id: ItemContextId) -> Option<&Rc<ItemContext>> {
        self.contexts.get(&id).map(|ctx| &ctx.item)
    }

    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    #[must_use]
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Trie nodes, including the root.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.root.count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty() && self.bindings.is_empty() && self.contexts.is_empty()
    }

    // --- mutations --------------------------------------------------------

    /// The value at `path` was replaced (change, load, or unload).
    pub fn set(&mut self, path: &Path, provenance: Option<&Provenance>) -> Dispatch {
        let mut matched = Vec::new();
        self.root.collect_matching(path, 0, &mut matched);
        let mut notifier = Notifier::default();
        notifier.notify_all(
            matched,
            &Notification::Changed {
                provenance: provenance.cloned(),
            },
        );

        let mut changed_contexts = Vec::new();
        if let Some(node) = self.root.find(path) {
            node.collect_contexts(&mut changed_contexts);
        }
        changed_contexts.sort_unstable();

        Dispatch {
            notifications: notifier.finish(&[]),
            changed_contexts,
            evicted: Eviction::default(),
        }
    }

    /// `count` items were inserted into the list at `path` at `index`.
    pub fn insert(&mut self, path: &Path, index: usize, count: usize) -> Dispatch {
        let known = self.known_len(path);
        if index > known {
            log_out_of_range(path, index, known);
        }
        let _span = tracing::debug_span!(
            "strand.event_model.structural",
            op = "insert",
            path = %path,
            index,
            count
        )
        .entered();
        self.structural(path, Notification::Inserted { index, count }, |k| {
            Some(if k >= index { k.saturating_add(count) } else { k })
        })
    }

    /// `count` items were removed from the list at `path` starting at `index`.
    pub fn remove(&mut self, path: &Path, index: usize, count: usize) -> Dispatch {
        let known = self.known_len(path);
        let end = index.saturating_add(count);
        if end > known && known > 0 {
            log_out_of_range(path, end, known);
        }
        let _span = tracing::debug_span!(
            "strand.event_model.structural",
            op = "remove",
            path = %path,
            index,
            count
        )
        .entered();
        self.structural(path, Notification::Removed { index, count }, |k| {
            if k < index {
                Some(k)
            } else if k < end {
                None
            } else {
                Some(k - count)
            }
        })
    }

    /// A block of `count` items moved from `from` to `to` in the list at
    /// `path`. `to` is the block's start in the resulting sequence.
    pub fn move_items(&mut self, path: &Path, from: usize, to: usize, count: usize) -> Dispatch {
        let known = self.known_len(path);
        let reach = from.max(to).saturating_add(count);
        if reach > known && known > 0 {
            log_out_of_range(path, reach, known);
        }
        let _span = tracing::debug_span!(
            "strand.event_model.structural",
            op = "move",
            path = %path,
            from,
            to,
            count
        )
        .entered();
        self.structural(path, Notification::Moved { from, to, count }, |k| {
            Some(move_position(k, from, to, count))
        })
    }

    // --- internals --------------------------------------------------------

    fn known_len(&self, path: &Path) -> usize {
        self.root.find(path).map_or(0, |node| {
            node.children
                .keys()
                .filter_map(Segment::as_index)
                .max()
                .map_or(0, |max| max + 1)
        })
    }

    fn structural(
        &mut self,
        path: &Path,
        collection: Notification,
        map: impl Fn(usize) -> Option<usize>,
    ) -> Dispatch {
        let mut notifier = Notifier::default();
        self.root
            .collect_collection(path, 0, true, &collection, &mut notifier);

        let depth = path.len();
        let mut evict_roots: Vec<ItemContextId> = Vec::new();
        let mut moved_contexts: Vec<(ItemContextId, Path)> = Vec::new();
        let mut moved_deps: Vec<(BindingId, Path, Path)> = Vec::new();
        let mut fixed: Vec<BindingId> = Vec::new();

        if let Some(node) = self.root.find(path) {
            let mut affected: Vec<(usize, Option<usize>)> = node
                .children
                .keys()
                .filter_map(Segment::as_index)
                .map(|k| (k, map(k)))
                .filter(|(k, target)| *target != Some(*k))
                .collect();
            affected.sort_unstable();

            for (k, target) in affected {
                let prefix = path.child(k);
                let Some(child) = node.children.get(&Segment::Index(k)) else {
                    continue;
                };

                let mut contexts = Vec::new();
                child.collect_contexts(&mut contexts);
                for id in contexts {
                    match (target, self.contexts.get(&id)) {
                        (None, _) => evict_roots.push(id),
                        (Some(to), Some(ctx)) => {
                            let mut rekeyed = ctx.item.path();
                            rekeyed.set_segment(depth, Segment::Index(to));
                            moved_contexts.push((id, rekeyed));
                        }
                        (Some(_), None) => {}
                    }
                }

                let mut bindings = Vec::new();
                child.collect_bindings(&mut bindings);
                bindings.sort_unstable();
                bindings.dedup();
                for binding in bindings {
                    let carried = target.is_some() && self.owned_under(binding, &prefix);
                    let Some(entry) = self.bindings.get(&binding) else {
                        continue;
                    };
                    for dep in entry.paths.iter().filter(|dep| dep.starts_with(&prefix)) {
                        match target {
                            Some(to) if carried => {
                                let mut rekeyed = dep.clone();
                                rekeyed.set_segment(depth, Segment::Index(to));
                                moved_deps.push((binding, dep.clone(), rekeyed));
                            }
                            _ => fixed.push(binding),
                        }
                    }
                }
            }
        }

        let mut evicted = Eviction::default();
        self.evict(evict_roots, &mut evicted);
        self.rekey_contexts(moved_contexts);
        self.rekey_bindings(moved_deps);
        notifier.notify_all(fixed, &Notification::CHANGED);

        evicted.contexts.sort_unstable();
        evicted.bindings.sort_unstable();
        if !evicted.is_empty() {
            debug!(
                contexts = evicted.contexts.len(),
                bindings = evicted.bindings.len(),
                "evicted removed items"
            );
        }
        Dispatch {
            notifications: notifier.finish(&evicted.bindings),
            changed_contexts: Vec::new(),
            evicted,
        }
    }

    /// Whether `binding`'s owner chain includes a context at or under
    /// `prefix` (paths as they were before the current edit).
    fn owned_under(&self, binding: BindingId, prefix: &Path) -> bool {
        let mut owner = self.bindings.get(&binding).and_then(|entry| entry.owner);
        while let Some(id) = owner {
            let Some(ctx) = self.contexts.get(&id) else {
                return false;
            };
            if ctx.item.path().starts_with(prefix) {
                return true;
            }
            owner = ctx.item.parent();
        }
        false
    }

    fn rekey_contexts(&mut self, moves: Vec<(ItemContextId, Path)>) {
        let mut placed = Vec::with_capacity(moves.len());
        for (id, to) in moves {
            let Some(ctx) = self.contexts.get(&id) else {
                continue;
            };
            let from = ctx.item.path();
            self.root
                .update_at(from.segments(), &mut |node| node.contexts.remove(&id));
            ctx.item.set_path(to.clone());
            placed.push((id, to));
        }
        for (id, to) in placed {
            self.root.descend_mut(&to).contexts.insert(id);
        }
    }

    fn rekey_bindings(&mut self, moves: Vec<(BindingId, Path, Path)>) {
        for (binding, from, _) in &moves {
            self.root
                .update_at(from.segments(), &mut |node| node.bindings.remove(binding));
        }
        for (binding, from, to) in moves {
            self.root.descend_mut(&to).bindings.insert(binding);
            if let Some(entry) = self.bindings.get_mut(&binding)
                && let Some(slot) = entry.paths.iter_mut().find(|path| **path == from)
            {
                *slot = to;
            }
        }
    }

    fn evict(&mut self, roots: Vec<ItemContextId>, eviction: &mut Eviction) {
        let mut stack = roots;
        while let Some(id) = stack.pop() {
            let Some(ctx) = self.contexts.remove(&id) else {
                continue;
            };
            let path = ctx.item.path();
            self.root
                .update_at(path.segments(), &mut |node| node.contexts.remove(&id));
            if let Some(parent) = ctx.item.parent()
                && let Some(parent) = self.contexts.get_mut(&parent)
            {
                parent.children.remove(&id);
            }
            for binding in ctx.owned {
                if self.remove_binding(binding) {
                    eviction.bindings.push(binding);
                }
            }
            stack.extend(ctx.children);
            eviction.contexts.push(id);
        }
    }
}

/// Position of item `k` after moving `count` items from `from` to `to`.
fn move_position(k: usize, from: usize, to: usize, count: usize) -> usize {
    let block_end = from.saturating_add(count);
    if (from..block_end).contains(&k) {
        if to >= from {
            k.saturating_add(to - from)
        } else {
            k - (from - to)
        }
    } else if from < to && (block_end..to.saturating_add(count)).contains(&k) {
        k - count
    } else if to < from && (to..from).contains(&k) {
        k.saturating_add(count)
    } else {
        k
    }
}

fn log_out_of_range(path: &Path, index: usize, len: usize) {
    let err = RuntimeError::IndexOutOfRange {
        path: path.clone(),
        index,
        len,
    };
    debug!(error = %err, "structural index out of range");
}
