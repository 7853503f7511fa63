#![forbid(unsafe_code)]

//! Live bindings, item contexts, and components of a page.
//!
//! The registry allocates ids, owns the binding slots the batcher runs, and
//! keeps the [`EventModel`] in step with what is live: registering a binding
//! indexes its dependencies, unregistering or evicting one retires its slot
//! so a queued update for it is skipped.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};
use strand_core::Path;
use tracing::{debug, trace, warn};

use crate::error::{ExpressionError, RuntimeError};
use crate::event_model::{EventModel, Eviction};
use crate::text_patch::TextPatchBinding;
use crate::view::{
    Binding, BindingId, Component, ComponentId, Context, Expression, ItemContext, ItemContextId,
    ItemObserver,
};

/// A registered binding as the batcher sees it.
pub struct BindingSlot {
    id: BindingId,
    binding: Rc<dyn Binding>,
    owner_item: Option<ItemContextId>,
    owner_component: Option<ComponentId>,
    live: Cell<bool>,
}

impl BindingSlot {
    pub(crate) fn new(
        id: BindingId,
        binding: Rc<dyn Binding>,
        owner_item: Option<ItemContextId>,
        owner_component: Option<ComponentId>,
    ) -> Self {
        Self {
            id,
            binding,
            owner_item,
            owner_component,
            live: Cell::new(true),
        }
    }

    #[must_use]
    pub fn id(&self) -> BindingId {
        self.id
    }

    #[must_use]
    pub fn binding(&self) -> &Rc<dyn Binding> {
        &self.binding
    }

    #[must_use]
    pub fn owner_item(&self) -> Option<ItemContextId> {
        self.owner_item
    }

    #[must_use]
    pub fn owner_component(&self) -> Option<ComponentId> {
        self.owner_component
    }

    /// False once unregistered or evicted.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.get()
    }

    pub(crate) fn retire(&self) {
        self.live.set(false);
    }
}

impl fmt::Debug for BindingSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingSlot")
            .field("id", &self.id)
            .field("owner_item", &self.owner_item)
            .field("owner_component", &self.owner_component)
            .field("live", &self.live.get())
            .finish_non_exhaustive()
    }
}

/// Outcome of [`BindingRegistry::register`].
#[derive(Debug)]
pub struct Registration {
    pub slot: Rc<BindingSlot>,
    /// Dependencies that could not be resolved and were skipped.
    pub unresolved: Vec<RuntimeError>,
    /// Whether the binding was wrapped for in-place text patching.
    pub text_patched: bool,
}

impl Registration {
    #[must_use]
    pub fn id(&self) -> BindingId {
        self.slot.id()
    }
}

struct ComponentEntry {
    parent: Option<ComponentId>,
    children: Vec<ComponentId>,
    component: Rc<dyn Component>,
    bindings: FxHashSet<BindingId>,
    contexts: FxHashSet<ItemContextId>,
}

/// Id allocation and bookkeeping for everything live on a page.
pub struct BindingRegistry {
    text_patch: bool,
    next_binding: u64,
    next_context: u64,
    next_component: u64,
    bindings: FxHashMap<BindingId, Rc<BindingSlot>>,
    contexts: FxHashMap<ItemContextId, Rc<ItemContext>>,
    components: FxHashMap<ComponentId, ComponentEntry>,
}

impl BindingRegistry {
    /// `text_patch` selects in-place patching for text control bindings.
    #[must_use]
    pub fn new(text_patch: bool) -> Self {
        Self {
            text_patch,
            next_binding: 1,
            next_context: 1,
            next_component: 1,
            bindings: FxHashMap::default(),
            contexts: FxHashMap::default(),
            components: FxHashMap::default(),
        }
    }

    // --- bindings ---------------------------------------------------------

    /// Make `binding` live and index its dependencies.
    ///
    /// Unresolvable dependencies are logged, skipped, and returned in the
    /// [`Registration`]. A binding with no dependencies is live but static.
    pub fn register(&mut self, model: &mut EventModel, binding: Rc<dyn Binding>) -> Registration {
        let id = BindingId(self.next_binding);
        self.next_binding += 1;

        let context = binding.context().clone();
        let mut paths: Vec<Path> = Vec::new();
        let mut unresolved = Vec::new();
        for expression in binding.expressions() {
            match expression.dependencies(&context) {
                Ok(deps) => paths.extend(deps),
                Err(reason) => {
                    let err = RuntimeError::UnresolvedDependency {
                        expression: expression.label(),
                        reason,
                    };
                    warn!(binding = %id, error = %err, "skipping dependency");
                    unresolved.push(err);
                }
            }
        }

        let (binding, text_patched) = self.wrap_text_binding(binding, &context);
        let owner_item = context.item().map(|item| item.id());
        let owner_component = context.component();
        let slot = Rc::new(BindingSlot::new(id, binding, owner_item, owner_component));

        trace!(
            binding = %id,
            dependencies = paths.len(),
            text_patched,
            "registered binding"
        );
        model.add_binding(id, paths, owner_item);
        if let Some(component) = owner_component
            && let Some(entry) = self.components.get_mut(&component)
        {
            entry.bindings.insert(id);
        }
        self.bindings.insert(id, Rc::clone(&slot));

        Registration {
            slot,
            unresolved,
            text_patched,
        }
    }

    fn wrap_text_binding(
        &self,
        binding: Rc<dyn Binding>,
        context: &Context,
    ) -> (Rc<dyn Binding>, bool) {
        let Some(control) = binding.text_target() else {
            return (binding, false);
        };
        let resolves = binding
            .expressions()
            .first()
            .and_then(|expression| expression.resolve(context))
            .is_some();
        if !resolves {
            return (binding, false);
        }
        let wrapped: Rc<dyn Binding> =
            Rc::new(TextPatchBinding::new(binding, control, self.text_patch));
        (wrapped, true)
    }

    /// Retire `id` and drop it from the index.
    pub fn unregister(&mut self, model: &mut EventModel, id: BindingId) -> Option<Rc<BindingSlot>> {
        let slot = self.bindings.remove(&id)?;
        slot.retire();
        model.remove_binding(id);
        if let Some(component) = slot.owner_component()
            && let Some(entry) = self.components.get_mut(&component)
        {
            entry.bindings.remove(&id);
        }
        trace!(binding = %id, "unregistered binding");
        Some(slot)
    }

    #[must_use]
    pub fn slot(&self, id: BindingId) -> Option<&Rc<BindingSlot>> {
        self.bindings.get(&id)
    }

    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    // --- item contexts ----------------------------------------------------

    /// Create the context for item `index` of the collection `collection`
    /// resolves to under `parent`.
    pub fn add_item_context(
        &mut self,
        model: &mut EventModel,
        parent: &Context,
        collection: &dyn Expression,
        index: usize,
        observer: Option<Rc<dyn ItemObserver>>,
    ) -> Result<Rc<ItemContext>, RuntimeError> {
        let Some(path) = collection.resolve(parent) else {
            let label = collection.label();
            return Err(RuntimeError::UnresolvedDependency {
                reason: ExpressionError::Unresolvable(format!(
                    "`{label}` does not resolve to a collection path"
                )),
                expression: label,
            });
        };
        Ok(self.add_item_context_at(model, parent, path.child(index), observer))
    }

    /// Create an item context at an already-resolved `path`.
    pub fn add_item_context_at(
        &mut self,
        model: &mut EventModel,
        parent: &Context,
        path: Path,
        observer: Option<Rc<dyn ItemObserver>>,
    ) -> Rc<ItemContext> {
        let id = ItemContextId(self.next_context);
        self.next_context += 1;
        let component = parent.component();
        let item = Rc::new(ItemContext::new(
            id,
            path,
            parent.item().map(|item| item.id()),
            component,
            observer,
        ));
        model.add_item_context(Rc::clone(&item));
        if let Some(component) = component
            && let Some(entry) = self.components.get_mut(&component)
        {
            entry.contexts.insert(id);
        }
        self.contexts.insert(id, Rc::clone(&item));
        trace!(context = %id, path = %item.path(), "added item context");
        item
    }

    /// Remove an item context, its nested contexts, and every binding they
    /// own. Returns the retired contexts.
    pub fn remove_item_context(
        &mut self,
        model: &mut EventModel,
        id: ItemContextId,
    ) -> Vec<Rc<ItemContext>> {
        let eviction = model.remove_item_context(id);
        self.evict(&eviction)
    }

    /// Retire whatever the event model evicted. Returns the retired
    /// contexts so the caller can notify their observers.
    pub fn evict(&mut self, eviction: &Eviction) -> Vec<Rc<ItemContext>> {
        for id in &eviction.bindings {
            if let Some(slot) = self.bindings.remove(id) {
                slot.retire();
                if let Some(component) = slot.owner_component()
                    && let Some(entry) = self.components.get_mut(&component)
                {
                    entry.bindings.remove(id);
                }
            }
        }
        let mut retired = Vec::with_capacity(eviction.contexts.len());
        for id in &eviction.contexts {
            if let Some(item) = self.contexts.remove(id) {
                item.retire();
                if let Some(component) = item.component()
                    && let Some(entry) = self.components.get_mut(&component)
                {
                    entry.contexts.remove(id);
                }
                retired.push(item);
            }
        }
        if !eviction.is_empty() {
            debug!(
                bindings = eviction.bindings.len(),
                contexts = eviction.contexts.len(),
                "retired evicted entries"
            );
        }
        retired
    }

    #[must_use]
    pub fn item_context(&self, id: ItemContextId) -> Option<&Rc<ItemContext>> {
        self.contexts.get(&id)
    }

    #[must_use]
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    // --- components -------------------------------------------------------

    pub fn add_component(
        &mut self,
        parent: Option<ComponentId>,
        component: Rc<dyn Component>,
    ) -> ComponentId {
        let id = ComponentId(self.next_component);
        self.next_component += 1;
        if let Some(parent) = parent
            && let Some(entry) = self.components.get_mut(&parent)
        {
            entry.children.push(id);
        }
        self.components.insert(
            id,
            ComponentEntry {
                parent,
                children: Vec::new(),
                component,
                bindings: FxHashSet::default(),
                contexts: FxHashSet::default(),
            },
        );
        id
    }

    /// Tear down `id` and its descendants, children first.
    ///
    /// Each component's bindings and item contexts are unregistered before
    /// it is returned. The caller runs the returned destroy hooks in order,
    /// outside any borrow of the registry.
    pub fn destroy_component(
        &mut self,
        model: &mut EventModel,
        id: ComponentId,
    ) -> Vec<Rc<dyn Component>> {
        let mut order = Vec::new();
        self.collect_post_order(id, &mut order);

        if let Some(parent) = self.components.get(&id).and_then(|entry| entry.parent)
            && let Some(parent) = self.components.get_mut(&parent)
        {
            parent.children.retain(|child| *child != id);
        }

        let mut hooks = Vec::with_capacity(order.len());
        for component in order {
            let Some(entry) = self.components.remove(&component) else {
                continue;
            };
            let mut bindings: Vec<_> = entry.bindings.into_iter().collect();
            bindings.sort_unstable();
            for binding in bindings {
                self.unregister(model, binding);
            }
            let mut contexts: Vec<_> = entry.contexts.into_iter().collect();
            contexts.sort_unstable();
            for context in contexts {
                self.remove_item_context(model, context);
            }
            debug!(component = %component, "destroyed component");
            hooks.push(entry.component);
        }
        hooks
    }

    fn collect_post_order(&self, id: ComponentId, out: &mut Vec<ComponentId>) {
        let Some(entry) = self.components.get(&id) else {
            return;
        };
        for child in &entry.children {
            self.collect_post_order(*child, out);
        }
        out.push(id);
    }

    /// Destroy every component, top-level ones in creation order.
    pub fn destroy_all_components(&mut self, model: &mut EventModel) -> Vec<Rc<dyn Component>> {
        let mut roots: Vec<ComponentId> = self
            .components
            .iter()
            .filter(|(_, entry)| {
                entry
                    .parent
                    .is_none_or(|parent| !self.components.contains_key(&parent))
            })
            .map(|(id, _)| *id)
            .collect();
        roots.sort_unstable();
        roots
            .into_iter()
            .flat_map(|root| self.destroy_component(model, root))
            .collect()
    }

    #[must_use]
    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Retire every remaining binding and item context and empty the index.
    pub fn clear(&mut self, model: &mut EventModel) {
        for slot in self.bindings.values() {
            slot.retire();
        }
        for item in self.contexts.values() {
            item.retire();
        }
        let bindings = self.bindings.len();
        let contexts = self.contexts.len();
        self.bindings.clear();
        self.contexts.clear();
        *model = EventModel::new();
        debug!(bindings, contexts, "cleared registry");
    }
}

impl fmt::Debug for BindingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingRegistry")
            .field("bindings", &self.bindings.len())
            .field("contexts", &self.contexts.len())
            .field("components", &self.components.len())
            .field("text_patch", &self.text_patch)
            .finish()
    }
}
