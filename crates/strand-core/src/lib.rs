#![forbid(unsafe_code)]

//! Core data types for strand: typed store paths, mutation events, and
//! change provenance.
//!
//! This crate holds no runtime state. The event model, batching, and page
//! controller live in `strand-runtime`.

pub mod mutation;
pub mod path;

pub use mutation::{ElementId, EventKind, MutationEvent, Provenance};
pub use path::{Path, PathError, Segment, Segments};
