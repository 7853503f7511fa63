#![forbid(unsafe_code)]

//! Strand Runtime
//!
//! Change propagation from a reactive store to the live bindings of a
//! rendered view tree.
//!
//! # Key Components
//!
//! - [`EventModel`] - Path trie mapping store paths to dependent bindings
//! - [`Batcher`] - Nested pause/unpause with a coalescing update queue
//! - [`text_patch`] - Minimal text-control updates that keep the caret
//! - [`BindingRegistry`] - Bindings, item contexts, and components of a page
//! - [`Page`] - Store subscriptions, render/attach, and teardown
//!
//! # How it fits together
//! A store emits a [`MutationEvent`](strand_core::MutationEvent). The page
//! pauses the batcher, asks the event model which bindings the event
//! reaches, schedules them, and unpauses. Each affected binding runs once
//! per flush no matter how many events reached it.

pub mod batch;
pub mod config;
pub mod error;
pub mod event_model;
pub mod helpers;
pub mod page;
pub mod registry;
pub mod store;
pub mod text_patch;
pub mod view;

pub use batch::{Batcher, ErrorSink, FlushReport, PauseGuard};
pub use config::{ConfigError, RuntimeConfig};
pub use error::{BindingError, ExpressionError, RenderError, RuntimeError, StoreError};
pub use event_model::{Dispatch, EventModel, Eviction};
pub use helpers::{Helper, HelperTable, body_class};
pub use page::{Page, PageBuilder, PagePhase, PageScope, RenderParams};
pub use registry::{BindingRegistry, BindingSlot, Registration};
pub use store::{ListenerId, ListenerSet, Store, StoreListener};
pub use text_patch::{PatchOutcome, TextPatchBinding};
pub use view::{
    Binding, BindingId, Component, ComponentId, Context, Expression, ItemContext, ItemContextId,
    ItemObserver, Notification, PageHooks, Renderer, Selection, TextControl,
};
