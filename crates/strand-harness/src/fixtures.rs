#![forbid(unsafe_code)]

//! Reference collaborators for driving a page in tests.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::Value;
use strand_core::{ElementId, Path};
use strand_runtime::{
    Binding, BindingError, Component, Context, Expression, ExpressionError, ItemContext,
    ItemContextId, ItemObserver, Notification, PageHooks, PageScope, RenderError, Renderer,
    RuntimeError, Selection, Store, TextControl,
};

/// Shared, ordered log of lifecycle calls across fixtures.
pub type Journal = Rc<RefCell<Vec<String>>>;

#[must_use]
pub fn journal() -> Journal {
    Rc::new(RefCell::new(Vec::new()))
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

/// A plain path expression, absolute or relative to the enclosing item.
#[derive(Debug, Clone)]
pub struct PathExpr {
    path: Path,
    relative: bool,
    label: String,
}

impl PathExpr {
    /// `users.0.name`, or a pattern such as `todos.*`.
    pub fn new(path: &str) -> Result<Self, ExpressionError> {
        Ok(Self {
            path: Path::parse(path)?,
            relative: false,
            label: path.to_owned(),
        })
    }

    /// `.name`: resolved under the item context.
    pub fn relative(path: &str) -> Result<Self, ExpressionError> {
        Ok(Self {
            path: Path::parse(path)?,
            relative: true,
            label: format!(".{path}"),
        })
    }
}

impl Expression for PathExpr {
    fn resolve(&self, context: &Context) -> Option<Path> {
        if self.relative {
            context.item_path().map(|base| base.join(&self.path))
        } else {
            Some(self.path.clone())
        }
    }

    fn dependencies(&self, context: &Context) -> Result<Vec<Path>, ExpressionError> {
        self.resolve(context)
            .map(|path| vec![path])
            .ok_or_else(|| ExpressionError::MissingItem(self.label.clone()))
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

/// A literal: no path, no dependencies.
#[derive(Debug, Clone)]
pub struct StaticExpr(pub Value);

impl Expression for StaticExpr {
    fn resolve(&self, _context: &Context) -> Option<Path> {
        None
    }

    fn dependencies(&self, _context: &Context) -> Result<Vec<Path>, ExpressionError> {
        Ok(Vec::new())
    }

    fn label(&self) -> String {
        self.0.to_string()
    }
}

/// A helper call over path arguments, e.g. `body_class($render.ns)`.
///
/// Depends on every argument path; the value comes from the helper table.
#[derive(Debug, Clone)]
pub struct HelperExpr {
    helper: String,
    args: Vec<PathExpr>,
}

impl HelperExpr {
    pub fn new(helper: &str, args: &[&str]) -> Result<Self, ExpressionError> {
        Ok(Self {
            helper: helper.to_owned(),
            args: args
                .iter()
                .map(|arg| PathExpr::new(arg))
                .collect::<Result<_, _>>()?,
        })
    }

    /// Evaluate against `store`.
    pub fn evaluate(&self, context: &Context, store: &dyn Store) -> Result<Value, ExpressionError> {
        let args: Vec<Value> = self
            .args
            .iter()
            .map(|arg| {
                arg.resolve(context)
                    .and_then(|path| store.get(&path.to_string()))
                    .unwrap_or(Value::Null)
            })
            .collect();
        context.helpers().call(&self.helper, &args)
    }
}

impl Expression for HelperExpr {
    fn resolve(&self, _context: &Context) -> Option<Path> {
        None
    }

    fn dependencies(&self, context: &Context) -> Result<Vec<Path>, ExpressionError> {
        if !context.helpers().contains(&self.helper) {
            return Err(ExpressionError::UnknownHelper(self.helper.clone()));
        }
        let mut paths = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            paths.extend(arg.dependencies(context)?);
        }
        Ok(paths)
    }

    fn label(&self) -> String {
        let args: Vec<String> = self.args.iter().map(|arg| arg.label()).collect();
        format!("{}({})", self.helper, args.join(", "))
    }
}

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

/// A binding that records every update and, given a store, the value its
/// first expression reads at that moment.
pub struct RecordingBinding {
    expressions: Vec<Rc<dyn Expression>>,
    context: Context,
    store: Option<Rc<dyn Store>>,
    notifications: RefCell<Vec<Notification>>,
    values: RefCell<Vec<Option<Value>>>,
    attached: Cell<bool>,
    failure: RefCell<Option<String>>,
    on_update: RefCell<Option<Box<dyn Fn()>>>,
}

impl RecordingBinding {
    #[must_use]
    pub fn new(context: Context, expression: impl Expression + 'static) -> Self {
        let expression: Rc<dyn Expression> = Rc::new(expression);
        Self::with_expressions(context, vec![expression])
    }

    #[must_use]
    pub fn with_expressions(context: Context, expressions: Vec<Rc<dyn Expression>>) -> Self {
        Self {
            expressions,
            context,
            store: None,
            notifications: RefCell::new(Vec::new()),
            values: RefCell::new(Vec::new()),
            attached: Cell::new(true),
            failure: RefCell::new(None),
            on_update: RefCell::new(None),
        }
    }

    /// Read the first expression's value from `store` on each update.
    #[must_use]
    pub fn reading(mut self, store: Rc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn into_rc(self) -> Rc<Self> {
        Rc::new(self)
    }

    #[must_use]
    pub fn update_count(&self) -> usize {
        self.notifications.borrow().len()
    }

    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.borrow().clone()
    }

    #[must_use]
    pub fn last_notification(&self) -> Option<Notification> {
        self.notifications.borrow().last().cloned()
    }

    #[must_use]
    pub fn values(&self) -> Vec<Option<Value>> {
        self.values.borrow().clone()
    }

    #[must_use]
    pub fn last_value(&self) -> Option<Value> {
        self.values.borrow().last().cloned().flatten()
    }

    /// Take the bound node out of the document.
    pub fn detach(&self) {
        self.attached.set(false);
    }

    /// Make later updates fail with `message`.
    pub fn fail_with(&self, message: &str) {
        *self.failure.borrow_mut() = Some(message.to_owned());
    }

    /// Run `f` after each recorded update.
    pub fn on_update(&self, f: impl Fn() + 'static) {
        *self.on_update.borrow_mut() = Some(Box::new(f));
    }
}

impl Binding for RecordingBinding {
    fn expressions(&self) -> &[Rc<dyn Expression>] {
        &self.expressions
    }

    fn context(&self) -> &Context {
        &self.context
    }

    fn update(&self, notification: &Notification) -> Result<(), BindingError> {
        self.notifications.borrow_mut().push(notification.clone());
        if let Some(store) = &self.store {
            let value = self
                .expressions
                .first()
                .and_then(|expression| expression.resolve(&self.context))
                .and_then(|path| store.get(&path.to_string()));
            self.values.borrow_mut().push(value);
        }
        if let Some(f) = self.on_update.borrow().as_ref() {
            f();
        }
        match self.failure.borrow().as_ref() {
            Some(message) => Err(BindingError::Update(message.clone())),
            None => Ok(()),
        }
    }

    fn is_attached(&self) -> bool {
        self.attached.get()
    }
}

/// A text input: value, selection, focus, and scroll.
///
/// `set_value` moves the caret to the end, as browsers do.
pub struct FakeInput {
    id: ElementId,
    value: RefCell<String>,
    selection: Cell<Selection>,
    focused: Cell<bool>,
    scroll_top: Cell<i32>,
    attached: Cell<bool>,
    writes: Cell<u32>,
}

impl FakeInput {
    #[must_use]
    pub fn new(id: u64, value: &str) -> Rc<Self> {
        Rc::new(Self {
            id: ElementId(id),
            value: RefCell::new(value.to_owned()),
            selection: Cell::new(Selection::default()),
            focused: Cell::new(false),
            scroll_top: Cell::new(0),
            attached: Cell::new(true),
            writes: Cell::new(0),
        })
    }

    /// Focus with the given selection.
    pub fn focus(&self, selection: Selection) {
        self.focused.set(true);
        self.selection.set(selection);
    }

    pub fn blur(&self) {
        self.focused.set(false);
    }

    pub fn scroll_to(&self, top: i32) {
        self.scroll_top.set(top);
    }

    /// Number of `set_value` calls.
    #[must_use]
    pub fn writes(&self) -> u32 {
        self.writes.get()
    }

    pub fn detach(&self) {
        self.attached.set(false);
    }
}

impl TextControl for FakeInput {
    fn element_id(&self) -> ElementId {
        self.id
    }

    fn value(&self) -> String {
        self.value.borrow().clone()
    }

    fn set_value(&self, value: &str) {
        *self.value.borrow_mut() = value.to_owned();
        self.selection
            .set(Selection::caret(value.chars().count()));
        self.scroll_top.set(0);
        self.writes.set(self.writes.get() + 1);
    }

    fn selection(&self) -> Selection {
        self.selection.get()
    }

    fn set_selection(&self, selection: Selection) {
        self.selection.set(selection);
    }

    fn is_focused(&self) -> bool {
        self.focused.get()
    }

    fn scroll_top(&self) -> i32 {
        self.scroll_top.get()
    }

    fn set_scroll_top(&self, top: i32) {
        self.scroll_top.set(top);
    }

    fn is_attached(&self) -> bool {
        self.attached.get()
    }
}

/// Binds an input's `value` to a path: the default update replaces the
/// whole value with what the store holds.
pub struct ValueBinding {
    expressions: Vec<Rc<dyn Expression>>,
    context: Context,
    input: Rc<FakeInput>,
    store: Rc<dyn Store>,
    updates: Cell<u32>,
}

impl ValueBinding {
    #[must_use]
    pub fn new(
        context: Context,
        expression: impl Expression + 'static,
        input: Rc<FakeInput>,
        store: Rc<dyn Store>,
    ) -> Rc<Self> {
        let expression: Rc<dyn Expression> = Rc::new(expression);
        Rc::new(Self {
            expressions: vec![expression],
            context,
            input,
            store,
            updates: Cell::new(0),
        })
    }

    /// Default (whole-value) updates run so far.
    #[must_use]
    pub fn default_updates(&self) -> u32 {
        self.updates.get()
    }
}

impl Binding for ValueBinding {
    fn expressions(&self) -> &[Rc<dyn Expression>] {
        &self.expressions
    }

    fn context(&self) -> &Context {
        &self.context
    }

    fn update(&self, _notification: &Notification) -> Result<(), BindingError> {
        self.updates.set(self.updates.get() + 1);
        let value = self
            .expressions
            .first()
            .and_then(|expression| expression.resolve(&self.context))
            .and_then(|path| self.store.get(&path.to_string()));
        let text = match value {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        self.input.set_value(&text);
        Ok(())
    }

    fn text_target(&self) -> Option<Rc<dyn TextControl>> {
        let control: Rc<dyn TextControl> = self.input.clone();
        Some(control)
    }
}

// ---------------------------------------------------------------------------
// Renderer, observers, hooks, components
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderCall {
    Render { view: String, ns: String },
    Attach { view: String, ns: String },
}

type RenderScript = Box<dyn Fn(&PageScope) -> Result<(), RenderError>>;

/// Records render/attach calls and runs an optional script that builds
/// bindings through the scope.
#[derive(Default)]
pub struct RecordingRenderer {
    calls: RefCell<Vec<RenderCall>>,
    script: RefCell<Option<RenderScript>>,
}

impl RecordingRenderer {
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Run `f` on every render and attach.
    #[must_use]
    pub fn scripted(f: impl Fn(&PageScope) -> Result<(), RenderError> + 'static) -> Rc<Self> {
        let renderer = Self::default();
        *renderer.script.borrow_mut() = Some(Box::new(f));
        Rc::new(renderer)
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RenderCall> {
        self.calls.borrow().clone()
    }

    fn run(&self, scope: &PageScope) -> Result<(), RenderError> {
        match self.script.borrow().as_ref() {
            Some(script) => script(scope),
            None => Ok(()),
        }
    }
}

impl Renderer for RecordingRenderer {
    fn render(&self, scope: &PageScope, view: &str, ns: &str) -> Result<(), RenderError> {
        self.calls.borrow_mut().push(RenderCall::Render {
            view: view.to_owned(),
            ns: ns.to_owned(),
        });
        self.run(scope)
    }

    fn attach(&self, scope: &PageScope, view: &str, ns: &str) -> Result<(), RenderError> {
        self.calls.borrow_mut().push(RenderCall::Attach {
            view: view.to_owned(),
            ns: ns.to_owned(),
        });
        self.run(scope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemEvent {
    DataChanged(ItemContextId),
    Removed(ItemContextId),
}

/// Records item-context callbacks, with the context's index at that time.
#[derive(Default)]
pub struct RecordingObserver {
    events: RefCell<Vec<(ItemEvent, Option<usize>)>>,
}

impl RecordingObserver {
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    #[must_use]
    pub fn events(&self) -> Vec<(ItemEvent, Option<usize>)> {
        self.events.borrow().clone()
    }

    #[must_use]
    pub fn removed(&self) -> Vec<ItemContextId> {
        self.events
            .borrow()
            .iter()
            .filter_map(|(event, _)| match event {
                ItemEvent::Removed(id) => Some(*id),
                ItemEvent::DataChanged(_) => None,
            })
            .collect()
    }
}

impl ItemObserver for RecordingObserver {
    fn data_changed(&self, item: &ItemContext) {
        self.events
            .borrow_mut()
            .push((ItemEvent::DataChanged(item.id()), item.index()));
    }

    fn removed(&self, item: &ItemContext) {
        self.events
            .borrow_mut()
            .push((ItemEvent::Removed(item.id()), item.index()));
    }
}

/// Page hooks that write `init`, `create`, `destroy`, and `error: ..`
/// entries to a journal.
pub struct RecordingHooks {
    journal: Journal,
}

impl RecordingHooks {
    #[must_use]
    pub fn new(journal: &Journal) -> Rc<Self> {
        Rc::new(Self {
            journal: Rc::clone(journal),
        })
    }

    /// Messages of every error delivered to the hook.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.journal
            .borrow()
            .iter()
            .filter_map(|entry| entry.strip_prefix("error: ").map(str::to_owned))
            .collect()
    }
}

impl PageHooks for RecordingHooks {
    fn init(&self, scope: &PageScope) {
        self.journal
            .borrow_mut()
            .push(format!("init:{:?}", scope.phase()));
    }

    fn create(&self, _scope: &PageScope) {
        self.journal.borrow_mut().push("create".to_owned());
    }

    fn destroy(&self, scope: &PageScope) {
        self.journal
            .borrow_mut()
            .push(format!("destroy:{:?}", scope.phase()));
    }

    fn error(&self, error: &RuntimeError) {
        self.journal.borrow_mut().push(format!("error: {error}"));
    }
}

/// A component that journals `component:<name>` when destroyed.
pub struct JournalComponent {
    name: String,
    journal: Journal,
}

impl JournalComponent {
    #[must_use]
    pub fn new(name: &str, journal: &Journal) -> Rc<Self> {
        Rc::new(Self {
            name: name.to_owned(),
            journal: Rc::clone(journal),
        })
    }
}

impl Component for JournalComponent {
    fn destroy(&self) {
        self.journal
            .borrow_mut()
            .push(format!("component:{}", self.name));
    }
}
