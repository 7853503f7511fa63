#![forbid(unsafe_code)]

//! Test harness for strand.
//!
//! [`MemoryStore`] is a small JSON store that emits the same mutation
//! events a real reactive store would. [`fixtures`] holds fake bindings,
//! text inputs, renderers, observers, and hooks for driving a
//! [`Page`](strand_runtime::Page) end to end.

pub mod fixtures;
pub mod memory_store;

pub use fixtures::{
    FakeInput, HelperExpr, ItemEvent, Journal, JournalComponent, PathExpr, RecordingBinding,
    RecordingHooks, RecordingObserver, RecordingRenderer, RenderCall, StaticExpr, ValueBinding,
    journal,
};
pub use memory_store::MemoryStore;
