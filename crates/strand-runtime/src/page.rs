#![forbid(unsafe_code)]

//! The page controller.
//!
//! A [`Page`] is the root of one rendered view tree. It owns the event
//! model, binding registry, batcher, and helper table for that tree, and
//! holds one store subscription per [`EventKind`]. Every store event is
//! applied to the event model inside a pause, so the bindings it reaches
//! are flushed once when the event has been fully processed.
//!
//! # Lifecycle
//!
//! ```text
//! Constructed --build--> Listening --render/attach--> Rendered --destroy--> Destroyed
//! ```
//!
//! `destroy` consumes the page. Renderers, bindings, and hooks reach the
//! page through a [`PageScope`], a weak handle that reports
//! [`RuntimeError::PageDestroyed`] once the page is gone.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use serde_json::{Value, json};
use strand_core::{EventKind, MutationEvent, Path};
use tracing::{debug, info, info_span, warn};
use web_time::Instant;

use crate::batch::{Batcher, PauseGuard};
use crate::config::RuntimeConfig;
use crate::error::{ExpressionError, RuntimeError};
use crate::event_model::{Dispatch, EventModel};
use crate::helpers::{self, HelperTable};
use crate::registry::{BindingRegistry, BindingSlot, Registration};
use crate::store::{ListenerSet, Store, StoreListener};
use crate::view::{
    Binding, BindingId, Component, ComponentId, Context, Expression, ItemContext, ItemContextId,
    ItemObserver, Notification, PageHooks, Renderer,
};

/// Store paths the page writes or clears.
pub mod paths {
    pub const RENDER_NS: &str = "$render.ns";
    pub const RENDER_PARAMS: &str = "$render.params";
    pub const RENDER_URL: &str = "$render.url";
    pub const RENDER_QUERY: &str = "$render.query";
    pub const RENDER_PREFIX: &str = "$render.prefix";
    pub const PAGE: &str = "_page";
    pub const COMPONENTS: &str = "$components";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePhase {
    Constructed,
    Listening,
    Rendered,
    Destroyed,
}

/// Request parameters written to `$render.*` before rendering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderParams {
    pub url: Option<String>,
    pub query: Value,
}

impl RenderParams {
    #[must_use]
    pub fn new(url: impl Into<String>, query: Value) -> Self {
        Self {
            url: Some(url.into()),
            query,
        }
    }

    fn is_empty(&self) -> bool {
        self.url.is_none() && self.query.is_null()
    }

    fn to_value(&self) -> Value {
        if self.is_empty() {
            Value::Null
        } else {
            json!({ "url": self.url, "query": self.query })
        }
    }
}

struct PageCore {
    store: Rc<dyn Store>,
    renderer: Rc<dyn Renderer>,
    hooks: Option<Rc<dyn PageHooks>>,
    config: RuntimeConfig,
    batcher: Rc<Batcher>,
    model: RefCell<EventModel>,
    registry: RefCell<BindingRegistry>,
    helpers: Rc<HelperTable>,
    root: Context,
    phase: Cell<PagePhase>,
}

impl PageCore {
    fn report(&self, err: &RuntimeError) {
        if let Some(hooks) = &self.hooks {
            hooks.error(err);
        }
    }

    fn handle_event(&self, event: &MutationEvent) {
        if self.phase.get() == PagePhase::Destroyed {
            return;
        }
        let path = match event.parsed_path() {
            Ok(path) => path,
            Err(err) => {
                let err = RuntimeError::from(err);
                warn!(kind = %event.kind(), error = %err, "ignoring event with malformed path");
                self.report(&err);
                return;
            }
        };

        let _pause = self.batcher.pause_guard();
        let dispatch = {
            let mut model = self.model.borrow_mut();
            match event {
                MutationEvent::Change { pass, .. } => model.set(&path, pass.as_ref()),
                MutationEvent::Load { .. } | MutationEvent::Unload { .. } => model.set(&path, None),
                MutationEvent::Insert { index, values, .. } => {
                    model.insert(&path, *index, values.len())
                }
                MutationEvent::Remove { index, values, .. } => {
                    model.remove(&path, *index, values.len())
                }
                MutationEvent::Move {
                    from, to, count, ..
                } => model.move_items(&path, *from, *to, *count),
            }
        };
        self.deliver(dispatch);
    }

    /// Retire evicted entries, notify item observers, and schedule the
    /// dispatched bindings. No borrow is held while observers run.
    fn deliver(&self, dispatch: Dispatch) {
        let retired = self.registry.borrow_mut().evict(&dispatch.evicted);
        for item in &retired {
            if let Some(observer) = item.observer() {
                observer.removed(item);
            }
        }

        let changed: Vec<Rc<ItemContext>> = {
            let model = self.model.borrow();
            dispatch
                .changed_contexts
                .iter()
                .filter_map(|id| model.item_context(*id).cloned())
                .collect()
        };
        for item in &changed {
            if let Some(observer) = item.observer() {
                observer.data_changed(item);
            }
        }

        let scheduled: Vec<(Rc<BindingSlot>, Notification)> = {
            let registry = self.registry.borrow();
            dispatch
                .notifications
                .into_iter()
                .filter_map(|(id, n)| registry.slot(id).map(|slot| (Rc::clone(slot), n)))
                .collect()
        };
        for (slot, notification) in scheduled {
            self.batcher.schedule(slot, notification);
        }
    }
}

/// Weak handle to a page, handed to renderers, hooks, and bindings.
#[derive(Clone)]
pub struct PageScope {
    core: Weak<PageCore>,
}

impl PageScope {
    fn new(core: &Rc<PageCore>) -> Self {
        Self {
            core: Rc::downgrade(core),
        }
    }

    fn core(&self) -> Result<Rc<PageCore>, RuntimeError> {
        self.core
            .upgrade()
            .filter(|core| core.phase.get() != PagePhase::Destroyed)
            .ok_or(RuntimeError::PageDestroyed)
    }

    /// `Destroyed` once the page is gone.
    #[must_use]
    pub fn phase(&self) -> PagePhase {
        self.core
            .upgrade()
            .map_or(PagePhase::Destroyed, |core| core.phase.get())
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.core().is_ok()
    }

    /// The page's root resolution context.
    pub fn root_context(&self) -> Result<Context, RuntimeError> {
        Ok(self.core()?.root.clone())
    }

    pub fn store(&self) -> Result<Rc<dyn Store>, RuntimeError> {
        Ok(Rc::clone(&self.core()?.store))
    }

    pub fn batcher(&self) -> Result<Rc<Batcher>, RuntimeError> {
        Ok(Rc::clone(&self.core()?.batcher))
    }

    /// Register a binding. Unresolved dependencies are also sent to the
    /// page error hook.
    pub fn register(&self, binding: Rc<dyn Binding>) -> Result<Registration, RuntimeError> {
        let core = self.core()?;
        let registration = {
            let mut model = core.model.borrow_mut();
            core.registry.borrow_mut().register(&mut model, binding)
        };
        for err in &registration.unresolved {
            core.report(err);
        }
        Ok(registration)
    }

    /// Unregister a binding. Call before its node leaves the document.
    pub fn unregister(&self, binding: BindingId) -> Result<bool, RuntimeError> {
        let core = self.core()?;
        let mut model = core.model.borrow_mut();
        let removed = core.registry.borrow_mut().unregister(&mut model, binding);
        Ok(removed.is_some())
    }

    /// Add the context for item `index` of the collection `collection`
    /// resolves to under `parent`.
    pub fn add_item_context(
        &self,
        parent: &Context,
        collection: &dyn Expression,
        index: usize,
        observer: Option<Rc<dyn ItemObserver>>,
    ) -> Result<Rc<ItemContext>, RuntimeError> {
        let core = self.core()?;
        let mut model = core.model.borrow_mut();
        let result =
            core.registry
                .borrow_mut()
                .add_item_context(&mut model, parent, collection, index, observer);
        drop(model);
        if let Err(err) = &result {
            core.report(err);
        }
        result
    }

    /// Add an item context at an already-resolved path.
    pub fn add_item_context_at(
        &self,
        parent: &Context,
        path: Path,
        observer: Option<Rc<dyn ItemObserver>>,
    ) -> Result<Rc<ItemContext>, RuntimeError> {
        let core = self.core()?;
        let mut model = core.model.borrow_mut();
        let item = core
            .registry
            .borrow_mut()
            .add_item_context_at(&mut model, parent, path, observer);
        Ok(item)
    }

    /// Remove an item context, its nested contexts, and their bindings.
    pub fn remove_item_context(&self, id: ItemContextId) -> Result<usize, RuntimeError> {
        let core = self.core()?;
        let mut model = core.model.borrow_mut();
        let retired = core.registry.borrow_mut().remove_item_context(&mut model, id);
        Ok(retired.len())
    }

    pub fn add_component(
        &self,
        parent: Option<ComponentId>,
        component: Rc<dyn Component>,
    ) -> Result<ComponentId, RuntimeError> {
        let core = self.core()?;
        let id = core.registry.borrow_mut().add_component(parent, component);
        Ok(id)
    }

    /// Destroy a component and its descendants, then run their hooks.
    pub fn destroy_component(&self, id: ComponentId) -> Result<(), RuntimeError> {
        let core = self.core()?;
        let hooks = {
            let mut model = core.model.borrow_mut();
            core.registry.borrow_mut().destroy_component(&mut model, id)
        };
        for hook in hooks {
            hook.destroy();
        }
        Ok(())
    }

    /// Call a helper from the page's table.
    pub fn call_helper(&self, name: &str, args: &[Value]) -> Result<Value, RuntimeError> {
        let core = self.core()?;
        core.helpers
            .call(name, args)
            .map_err(|reason| RuntimeError::UnresolvedDependency {
                expression: name.to_owned(),
                reason,
            })
    }
}

impl fmt::Debug for PageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageScope")
            .field("phase", &self.phase())
            .finish()
    }
}

/// Builder for [`Page`].
pub struct PageBuilder {
    store: Rc<dyn Store>,
    renderer: Rc<dyn Renderer>,
    config: RuntimeConfig,
    hooks: Option<Rc<dyn PageHooks>>,
    helpers: HelperTable,
}

impl PageBuilder {
    #[must_use]
    pub fn new(store: Rc<dyn Store>, renderer: Rc<dyn Renderer>) -> Self {
        Self {
            store,
            renderer,
            config: RuntimeConfig::default(),
            hooks: None,
            helpers: HelperTable::with_builtins(),
        }
    }

    #[must_use]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: Rc<dyn PageHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Add a host helper alongside the built-ins.
    #[must_use]
    pub fn helper(
        mut self,
        name: impl Into<String>,
        helper: impl Fn(&[Value]) -> Result<Value, ExpressionError> + 'static,
    ) -> Self {
        self.helpers.insert(name, helper);
        self
    }

    /// Validate the config, run the `init` hook, and subscribe to the store.
    pub fn build(self) -> Result<Page, RuntimeError> {
        let config = self.config.validated()?;
        let helpers = Rc::new(self.helpers);
        let batcher = Rc::new(Batcher::new(&config));
        if let Some(hooks) = &self.hooks {
            let hooks = Rc::clone(hooks);
            batcher.set_error_sink(Rc::new(move |err: &RuntimeError| hooks.error(err)));
        }
        let core = Rc::new(PageCore {
            store: Rc::clone(&self.store),
            renderer: self.renderer,
            hooks: self.hooks,
            registry: RefCell::new(BindingRegistry::new(config.text_patch)),
            model: RefCell::new(EventModel::new()),
            root: Context::new(Rc::clone(&helpers)),
            helpers,
            batcher,
            config,
            phase: Cell::new(PagePhase::Constructed),
        });

        let scope = PageScope::new(&core);
        if let Some(hooks) = &core.hooks {
            hooks.init(&scope);
        }

        let listeners = ListenerSet::acquire(self.store, &EventKind::ALL, |_kind| {
            let weak = Rc::downgrade(&core);
            let listener: StoreListener = Rc::new(move |event: &MutationEvent| {
                if let Some(core) = weak.upgrade() {
                    core.handle_event(event);
                }
            });
            listener
        });
        core.phase.set(PagePhase::Listening);
        debug!(listeners = listeners.len(), "page listening");

        Ok(Page { core, listeners })
    }
}

/// Root controller of one rendered view tree.
pub struct Page {
    core: Rc<PageCore>,
    listeners: ListenerSet,
}

impl Page {
    /// Build a page with default hooks and helpers.
    pub fn new(
        store: Rc<dyn Store>,
        renderer: Rc<dyn Renderer>,
        config: RuntimeConfig,
    ) -> Result<Self, RuntimeError> {
        PageBuilder::new(store, renderer).config(config).build()
    }

    #[must_use]
    pub fn builder(store: Rc<dyn Store>, renderer: Rc<dyn Renderer>) -> PageBuilder {
        PageBuilder::new(store, renderer)
    }

    #[must_use]
    pub fn scope(&self) -> PageScope {
        PageScope::new(&self.core)
    }

    #[must_use]
    pub fn phase(&self) -> PagePhase {
        self.core.phase.get()
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.core.config
    }

    #[must_use]
    pub fn store(&self) -> &Rc<dyn Store> {
        &self.core.store
    }

    #[must_use]
    pub fn batcher(&self) -> &Rc<Batcher> {
        &self.core.batcher
    }

    #[must_use]
    pub fn helpers(&self) -> &HelperTable {
        &self.core.helpers
    }

    /// The page's root resolution context.
    #[must_use]
    pub fn root_context(&self) -> Context {
        self.core.root.clone()
    }

    /// Render with no request parameters.
    pub fn render(&self, ns: &str) -> Result<(), RuntimeError> {
        self.render_with(ns, &RenderParams::default())
    }

    /// Write `$render.*`, then build and replace the document.
    pub fn render_with(&self, ns: &str, params: &RenderParams) -> Result<(), RuntimeError> {
        let span = info_span!("strand.page.render", ns, duration_us = tracing::field::Empty);
        let _enter = span.enter();
        let start = Instant::now();
        let core = &self.core;
        let _pause = core.batcher.pause_guard();

        let store = &core.store;
        store.set(paths::RENDER_NS, Value::String(ns.to_owned()))?;
        store.set(paths::RENDER_PARAMS, params.to_value())?;
        store.set(
            paths::RENDER_URL,
            params.url.clone().map_or(Value::Null, Value::String),
        )?;
        store.set(paths::RENDER_QUERY, params.query.clone())?;
        let prefix = if ns.is_empty() {
            String::new()
        } else {
            format!("{ns}:")
        };
        store.set(paths::RENDER_PREFIX, Value::String(prefix))?;

        core.renderer
            .render(&self.scope(), &core.config.page_view, ns)?;
        core.phase.set(PagePhase::Rendered);
        span.record("duration_us", start.elapsed().as_micros() as u64);
        Ok(())
    }

    /// Hydrate the existing document in the namespace stored at
    /// `$render.ns`, then run the `create` hook.
    pub fn attach(&self) -> Result<(), RuntimeError> {
        let _span = info_span!("strand.page.attach").entered();
        let core = &self.core;
        let _pause = core.batcher.pause_guard();

        let ns = self.namespace().unwrap_or_default();
        let scope = self.scope();
        core.renderer.attach(&scope, &core.config.page_view, &ns)?;
        if let Some(hooks) = &core.hooks {
            hooks.create(&scope);
        }
        core.phase.set(PagePhase::Rendered);
        Ok(())
    }

    /// The namespace last rendered, from `$render.ns`.
    #[must_use]
    pub fn namespace(&self) -> Option<String> {
        self.core
            .store
            .get(paths::RENDER_NS)
            .and_then(|value| value.as_str().map(str::to_owned))
    }

    /// Body class list for the current namespace.
    #[must_use]
    pub fn body_class(&self) -> Option<String> {
        helpers::body_class(self.namespace().as_deref())
    }

    /// Pause binding updates until the guard drops.
    pub fn pause(&self) -> PauseGuard {
        self.core.batcher.pause_guard()
    }

    /// Run `f` as one transaction: bindings flush once, after it returns.
    pub fn batch<R>(&self, f: impl FnOnce(&Page) -> R) -> R {
        let _pause = self.pause();
        f(self)
    }

    /// Shorthand for [`PageScope::register`].
    pub fn register(&self, binding: Rc<dyn Binding>) -> Result<Registration, RuntimeError> {
        self.scope().register(binding)
    }

    /// Shorthand for [`PageScope::unregister`].
    pub fn unregister(&self, binding: BindingId) -> Result<bool, RuntimeError> {
        self.scope().unregister(binding)
    }

    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.core.registry.borrow().binding_count()
    }

    #[must_use]
    pub fn context_count(&self) -> usize {
        self.core.registry.borrow().context_count()
    }

    #[must_use]
    pub fn component_count(&self) -> usize {
        self.core.registry.borrow().component_count()
    }

    /// The paths `binding` is currently indexed under.
    #[must_use]
    pub fn dependency_paths(&self, binding: BindingId) -> Option<Vec<Path>> {
        self.core
            .model
            .borrow()
            .binding_paths(binding)
            .map(<[Path]>::to_vec)
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Tear the page down.
    ///
    /// Runs the `destroy` hook, stops listening, destroys components,
    /// unregisters every binding and item context, clears `_page` and
    /// `$components`, and unloads the store. Listener release failures are
    /// returned after everything else has run.
    pub fn destroy(self) -> Result<(), RuntimeError> {
        let Page {
            core,
            mut listeners,
        } = self;
        let _span = info_span!("strand.page.destroy").entered();

        if let Some(hooks) = &core.hooks {
            hooks.destroy(&PageScope::new(&core));
        }
        core.phase.set(PagePhase::Destroyed);
        let failures = listeners.release();
        core.batcher.clear();

        let hooks: Vec<Rc<dyn Component>> = {
            let mut model = core.model.borrow_mut();
            core.registry
                .borrow_mut()
                .destroy_all_components(&mut model)
        };
        let components = hooks.len();
        for hook in hooks {
            hook.destroy();
        }
        {
            let mut model = core.model.borrow_mut();
            core.registry.borrow_mut().clear(&mut model);
        }

        core.store.destroy_silently(paths::PAGE);
        core.store.destroy_silently(paths::COMPONENTS);
        core.store.unload_all();
        info!(components, listener_failures = failures.len(), "page destroyed");

        if failures.is_empty() {
            Ok(())
        } else {
            let err = RuntimeError::ListenerRelease { failures };
            warn!(error = %err, "page destroyed with listener failures");
            Err(err)
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("phase", &self.phase())
            .field("listeners", &self.listeners)
            .field("batcher", &self.core.batcher)
            .finish_non_exhaustive()
    }
}
