//! HeapFS test and validation suite.
//!
//! Engine-level scenarios that exercise the public surface the way an
//! application would: whole-tree workflows, concurrent stress runs across
//! threads, and property-based checks of the resolver and content store.

pub mod concurrency;
pub mod harness;
pub mod integration;
pub mod properties;

pub use harness::{init_tracing, TestFs};
