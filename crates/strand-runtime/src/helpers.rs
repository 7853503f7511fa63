#![forbid(unsafe_code)]

//! Named helper functions callable from template expressions.
//!
//! Helpers are looked up in an explicit [`HelperTable`] carried by the
//! resolution [`Context`](crate::view::Context) rather than in any global
//! scope. A page starts with the built-ins and hosts can add their own.

use std::fmt;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::ExpressionError;

/// A helper over JSON arguments.
pub type Helper = Rc<dyn Fn(&[Value]) -> Result<Value, ExpressionError>>;

/// Name of the built-in [`body_class`] helper.
pub const BODY_CLASS: &str = "body_class";

/// Identifier → helper map.
#[derive(Clone, Default)]
pub struct HelperTable {
    helpers: FxHashMap<String, Helper>,
}

impl HelperTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A table holding the built-in helpers.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        table.insert(BODY_CLASS, |args| {
            let ns = args.first().and_then(Value::as_str);
            Ok(body_class(ns).map_or(Value::Null, Value::String))
        });
        table
    }

    /// Register (or replace) a helper.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        helper: impl Fn(&[Value]) -> Result<Value, ExpressionError> + 'static,
    ) {
        self.helpers.insert(name.into(), Rc::new(helper));
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Helper> {
        self.helpers.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.helpers.contains_key(name)
    }

    /// Call helper `name` with `args`.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, ExpressionError> {
        let helper = self
            .helpers
            .get(name)
            .ok_or_else(|| ExpressionError::UnknownHelper(name.to_owned()))?;
        helper(args)
    }
}

impl fmt::Debug for HelperTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.helpers.keys().collect();
        names.sort();
        f.debug_struct("HelperTable").field("helpers", &names).finish()
    }
}

/// Body class list for a render namespace.
///
/// `"a:b:c"` yields `"a a-b a-b-c"`. An empty or absent namespace yields
/// `None`.
#[must_use]
pub fn body_class(ns: Option<&str>) -> Option<String> {
    let ns = ns.filter(|ns| !ns.is_empty())?;
    let segments: Vec<&str> = ns.split(':').collect();
    let classes: Vec<String> = (1..=segments.len())
        .map(|n| segments[..n].join("-"))
        .collect();
    Some(classes.join(" "))
}
