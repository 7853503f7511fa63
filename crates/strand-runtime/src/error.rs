#![forbid(unsafe_code)]

//! Error types for the runtime and its collaborators.

use strand_core::{Path, PathError};

use crate::config::ConfigError;
use crate::store::ListenerId;
use crate::view::BindingId;

/// Errors surfaced by the page controller and its subsystems.
///
/// Some variants are never returned to callers and exist so that the
/// corresponding condition has a stable shape in logs: [`StaleBinding`]
/// is traced when a flush skips a binding, and [`IndexOutOfRange`] is logged
/// when a structural edit names an index past the known positions.
///
/// [`StaleBinding`]: RuntimeError::StaleBinding
/// [`IndexOutOfRange`]: RuntimeError::IndexOutOfRange
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("binding {binding} is no longer live")]
    StaleBinding { binding: BindingId },

    #[error("cannot resolve dependency of `{expression}`: {reason}")]
    UnresolvedDependency {
        expression: String,
        #[source]
        reason: ExpressionError,
    },

    #[error("unpause called without a matching pause")]
    ImbalancedPause,

    #[error("index {index} out of range for `{path}` (len {len})")]
    IndexOutOfRange { path: Path, index: usize, len: usize },

    #[error("binding {binding} failed to update")]
    BindingFailed {
        binding: BindingId,
        #[source]
        source: BindingError,
    },

    #[error("{} store listener(s) failed to release", failures.len())]
    ListenerRelease { failures: Vec<StoreError> },

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("page has been destroyed")]
    PageDestroyed,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure while resolving an expression against a context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpressionError {
    #[error("relative expression `{0}` evaluated outside an item context")]
    MissingItem(String),

    #[error("unknown helper `{0}`")]
    UnknownHelper(String),

    #[error("{0}")]
    Unresolvable(String),

    #[error(transparent)]
    Path(#[from] PathError),
}

/// Failure reported by [`Binding::update`](crate::view::Binding::update).
#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("{0}")]
    Update(String),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure reported by a [`Renderer`](crate::view::Renderer).
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("unknown view `{0}`")]
    UnknownView(String),

    #[error("render failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Runtime(Box<RuntimeError>),
}

impl From<RuntimeError> for RenderError {
    fn from(err: RuntimeError) -> Self {
        Self::Runtime(Box::new(err))
    }
}

/// Failure reported by a [`Store`](crate::store::Store).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("listener {0} is not subscribed")]
    UnknownListener(ListenerId),

    #[error("no value at `{path}`")]
    NotFound { path: String },

    #[error("value at `{path}` is not {expected}")]
    TypeMismatch { path: String, expected: &'static str },

    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Path(#[from] PathError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_release_counts_failures() {
        let err = RuntimeError::ListenerRelease {
            failures: vec![
                StoreError::UnknownListener(ListenerId(1)),
                StoreError::UnknownListener(ListenerId(2)),
            ],
        };
        assert_eq!(err.to_string(), "2 store listener(s) failed to release");
    }

    #[test]
    fn render_error_wraps_runtime() {
        let err: RenderError = RuntimeError::PageDestroyed.into();
        assert_eq!(err.to_string(), "page has been destroyed");
    }

    #[test]
    fn unresolved_dependency_names_expression() {
        let err = RuntimeError::UnresolvedDependency {
            expression: ".text".into(),
            reason: ExpressionError::MissingItem(".text".into()),
        };
        assert!(err.to_string().contains("`.text`"));
    }
}
