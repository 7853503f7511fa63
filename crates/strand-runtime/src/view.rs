#![forbid(unsafe_code)]

//! Identifiers, notifications, resolution contexts, and the collaborator
//! traits implemented by the template and DOM layers.
//!
//! The runtime never evaluates templates or touches a document itself. It
//! asks an [`Expression`] which store paths it reads, asks a [`Binding`] to
//! update, and hands a [`Renderer`] a [`PageScope`] to register bindings
//! through.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use strand_core::{ElementId, Path, Provenance};

use crate::error::{BindingError, ExpressionError, RenderError};
use crate::helpers::HelperTable;
use crate::page::PageScope;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// Raw numeric value. Allocated monotonically per page.
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Identity of a registered binding. Flush order follows id order.
    BindingId,
    "B"
);
id_type!(
    /// Identity of a registered item context.
    ItemContextId,
    "I"
);
id_type!(
    /// Identity of a registered component.
    ComponentId,
    "C"
);

/// What a binding is told when its data changed.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// The value at (or above) a dependency was replaced.
    Changed { provenance: Option<Provenance> },
    /// `count` items were inserted into the bound collection at `index`.
    Inserted { index: usize, count: usize },
    /// `count` items were removed from the bound collection at `index`.
    Removed { index: usize, count: usize },
    /// `count` items moved from `from` to `to` in the bound collection.
    Moved { from: usize, to: usize, count: usize },
    /// Several different notifications were coalesced; re-resolve everything.
    Refresh,
}

impl Notification {
    /// Plain change with no provenance.
    pub const CHANGED: Notification = Notification::Changed { provenance: None };

    /// Coalesce two notifications for the same binding.
    ///
    /// Equal notifications collapse to one; anything else becomes
    /// [`Notification::Refresh`].
    #[must_use]
    pub fn merge(self, other: Notification) -> Notification {
        if self == other {
            self
        } else {
            Notification::Refresh
        }
    }

    /// The provenance carried by a `Changed` notification.
    #[must_use]
    pub fn provenance(&self) -> Option<&Provenance> {
        match self {
            Self::Changed { provenance } => provenance.as_ref(),
            _ => None,
        }
    }
}

/// Resolution context for expressions: the enclosing item (if inside an
/// iterated block), the owning component, and the helper table.
#[derive(Clone)]
pub struct Context {
    item: Option<Rc<ItemContext>>,
    component: Option<ComponentId>,
    helpers: Rc<HelperTable>,
}

impl Context {
    /// A root context with no item or component.
    #[must_use]
    pub fn new(helpers: Rc<HelperTable>) -> Self {
        Self {
            item: None,
            component: None,
            helpers,
        }
    }

    /// A child context scoped to `item`.
    #[must_use]
    pub fn with_item(&self, item: Rc<ItemContext>) -> Self {
        Self {
            item: Some(item),
            ..self.clone()
        }
    }

    /// A child context owned by `component`.
    #[must_use]
    pub fn with_component(&self, component: ComponentId) -> Self {
        Self {
            component: Some(component),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn item(&self) -> Option<&Rc<ItemContext>> {
        self.item.as_ref()
    }

    /// Current path of the enclosing item, following any re-indexing.
    #[must_use]
    pub fn item_path(&self) -> Option<Path> {
        self.item.as_ref().map(|item| item.path())
    }

    #[must_use]
    pub fn component(&self) -> Option<ComponentId> {
        self.component
    }

    #[must_use]
    pub fn helpers(&self) -> &HelperTable {
        &self.helpers
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Rc::new(HelperTable::with_builtins()))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("item", &self.item.as_ref().map(|item| item.id()))
            .field("component", &self.component)
            .finish_non_exhaustive()
    }
}

/// Per-element resolution context of an iterated collection.
///
/// The path (e.g. `todos.2`) is rewritten in place when items are inserted,
/// removed, or moved ahead of it, so expressions resolved against the
/// context always address the item's current position.
pub struct ItemContext {
    id: ItemContextId,
    path: RefCell<Path>,
    parent: Option<ItemContextId>,
    component: Option<ComponentId>,
    observer: Option<Rc<dyn ItemObserver>>,
    live: Cell<bool>,
}

impl ItemContext {
    pub(crate) fn new(
        id: ItemContextId,
        path: Path,
        parent: Option<ItemContextId>,
        component: Option<ComponentId>,
        observer: Option<Rc<dyn ItemObserver>>,
    ) -> Self {
        Self {
            id,
            path: RefCell::new(path),
            parent,
            component,
            observer,
            live: Cell::new(true),
        }
    }

    #[must_use]
    pub fn id(&self) -> ItemContextId {
        self.id
    }

    /// The item's current store path.
    #[must_use]
    pub fn path(&self) -> Path {
        self.path.borrow().clone()
    }

    /// The item's current position in its collection.
    #[must_use]
    pub fn index(&self) -> Option<usize> {
        self.path.borrow().last().and_then(|segment| segment.as_index())
    }

    /// The enclosing item context, if this one is nested.
    #[must_use]
    pub fn parent(&self) -> Option<ItemContextId> {
        self.parent
    }

    #[must_use]
    pub fn component(&self) -> Option<ComponentId> {
        self.component
    }

    /// False once the item has been removed or evicted.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.get()
    }

    pub(crate) fn observer(&self) -> Option<&Rc<dyn ItemObserver>> {
        self.observer.as_ref()
    }

    pub(crate) fn set_path(&self, path: Path) {
        *self.path.borrow_mut() = path;
    }

    pub(crate) fn retire(&self) {
        self.live.set(false);
    }
}

impl fmt::Debug for ItemContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemContext")
            .field("id", &self.id)
            .field("path", &self.path.borrow().to_string())
            .field("parent", &self.parent)
            .field("live", &self.live.get())
            .finish_non_exhaustive()
    }
}

/// Receives lifecycle callbacks for an item context.
pub trait ItemObserver {
    /// Data at or under the item's path was replaced.
    fn data_changed(&self, _item: &ItemContext) {}

    /// The item left the collection and its context was evicted.
    fn removed(&self, _item: &ItemContext) {}
}

/// A compiled template expression.
pub trait Expression {
    /// The store path this expression addresses, if it is a plain path.
    fn resolve(&self, context: &Context) -> Option<Path>;

    /// Every store path whose mutation can change this expression's value.
    ///
    /// An empty list means the expression is constant.
    fn dependencies(&self, context: &Context) -> Result<Vec<Path>, ExpressionError>;

    /// Source text, for logs and errors.
    fn label(&self) -> String;
}

/// A live connection between expressions and a piece of the document.
pub trait Binding {
    /// The expressions whose dependencies decide when this binding updates.
    fn expressions(&self) -> &[Rc<dyn Expression>];

    /// The context the expressions are resolved against.
    fn context(&self) -> &Context;

    /// Re-evaluate and write to the document.
    fn update(&self, notification: &Notification) -> Result<(), BindingError>;

    /// Whether the bound node is still in the document.
    fn is_attached(&self) -> bool {
        true
    }

    /// The text control whose `value` this binding writes, if any.
    fn text_target(&self) -> Option<Rc<dyn TextControl>> {
        None
    }
}

/// Caret/selection range in char offsets. `start == end` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Selection {
    pub start: usize,
    pub end: usize,
}

impl Selection {
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub const fn caret(at: usize) -> Self {
        Self { start: at, end: at }
    }
}

/// An editable text control (`<input>` or `<textarea>`).
pub trait TextControl {
    fn element_id(&self) -> ElementId;
    fn value(&self) -> String;
    fn set_value(&self, value: &str);
    fn selection(&self) -> Selection;
    fn set_selection(&self, selection: Selection);
    fn is_focused(&self) -> bool;
    fn scroll_top(&self) -> i32;
    fn set_scroll_top(&self, scroll_top: i32);
    fn is_attached(&self) -> bool {
        true
    }
}

/// Builds or attaches the document for a view.
pub trait Renderer {
    /// Build the view and replace the current document with it.
    fn render(&self, scope: &PageScope, view: &str, ns: &str) -> Result<(), RenderError>;

    /// Hydrate an existing (server-rendered) document.
    fn attach(&self, scope: &PageScope, view: &str, ns: &str) -> Result<(), RenderError>;
}

/// Host lifecycle hooks for a page.
pub trait PageHooks {
    /// Runs during construction, before listeners are installed.
    fn init(&self, _scope: &PageScope) {}

    /// Runs after `attach` has hydrated the document.
    fn create(&self, _scope: &PageScope) {}

    /// Runs first during `destroy`.
    fn destroy(&self, _scope: &PageScope) {}

    /// Non-fatal errors (unresolved dependencies, malformed event paths).
    fn error(&self, _error: &crate::error::RuntimeError) {}
}

/// A component instance registered with a page.
pub trait Component {
    fn destroy(&self) {}
}
