#![forbid(unsafe_code)]

//! Mutation events emitted by the reactive store, and the provenance
//! metadata ("pass") that may ride along with a change.

use std::fmt;

use serde_json::Value;

use crate::path::{Path, PathError};

/// Identity of a DOM element that originated a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Metadata describing where a change came from.
///
/// Text controls use the string variants to patch their value in place
/// instead of replacing it.
#[derive(Debug, Clone, PartialEq)]
pub enum Provenance {
    /// The change was produced by a DOM element (usually an input handler).
    Local { origin: ElementId },
    /// `text` was inserted into `previous` at char offset `index`.
    StringInsert {
        previous: String,
        index: usize,
        text: String,
    },
    /// `count` chars were removed from `previous` at char offset `index`.
    StringRemove {
        previous: String,
        index: usize,
        count: usize,
    },
    /// Any other caller metadata. The core passes it through untouched.
    Opaque(Value),
}

impl Provenance {
    /// Short name for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::StringInsert { .. } => "string_insert",
            Self::StringRemove { .. } => "string_remove",
            Self::Opaque(_) => "opaque",
        }
    }
}

/// The six kinds of store event a page listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Change,
    Load,
    Unload,
    Insert,
    Remove,
    Move,
}

impl EventKind {
    /// Every kind, in subscription order.
    pub const ALL: [EventKind; 6] = [
        Self::Change,
        Self::Load,
        Self::Unload,
        Self::Insert,
        Self::Remove,
        Self::Move,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Change => "change",
            Self::Load => "load",
            Self::Unload => "unload",
            Self::Insert => "insert",
            Self::Remove => "remove",
            Self::Move => "move",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A store mutation as delivered to listeners.
///
/// Paths are carried as the dotted strings the store works with; the page
/// casts them with [`MutationEvent::parsed_path`].
#[derive(Debug, Clone, PartialEq)]
pub enum MutationEvent {
    Change {
        path: String,
        value: Value,
        previous: Value,
        pass: Option<Provenance>,
    },
    Load {
        path: String,
    },
    Unload {
        path: String,
    },
    Insert {
        path: String,
        index: usize,
        values: Vec<Value>,
    },
    Remove {
        path: String,
        index: usize,
        values: Vec<Value>,
    },
    Move {
        path: String,
        from: usize,
        to: usize,
        count: usize,
    },
}

impl MutationEvent {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Change { .. } => EventKind::Change,
            Self::Load { .. } => EventKind::Load,
            Self::Unload { .. } => EventKind::Unload,
            Self::Insert { .. } => EventKind::Insert,
            Self::Remove { .. } => EventKind::Remove,
            Self::Move { .. } => EventKind::Move,
        }
    }

    /// The raw path string of the mutated location.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Change { path, .. }
            | Self::Load { path }
            | Self::Unload { path }
            | Self::Insert { path, .. }
            | Self::Remove { path, .. }
            | Self::Move { path, .. } => path,
        }
    }

    /// The mutated location as a typed [`Path`].
    pub fn parsed_path(&self) -> Result<Path, PathError> {
        Path::parse(self.path())
    }
}
