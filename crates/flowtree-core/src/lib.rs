//! Incremental, event-driven dataflow engine for reactive group/aggregate
//! trees (§1).
//!
//! Clients declare a pipeline as a chain of steps — group-by,
//! define-property, drop-property, filter, and the aggregate operators
//! (sum, count, min, max, average, pick-by-min/max) — over a stream of
//! record insertions and removals. The engine maintains a materialized
//! hierarchical tree of keyed arrays such that, after every input change,
//! the tree reflects the transformation exactly as if recomputed from
//! scratch, but produced by O(delta) work rather than full recomputation.
//!
//! This crate is the step graph and its change-propagation protocol: how
//! steps subscribe to one another's `added`/`removed`/`modified` events at
//! specified tree paths ([`event`]), how each step maintains the per-parent
//! state it needs to emit correct incremental updates ([`steps`]), and how
//! mutable (derived) properties are auto-discovered and cascade through
//! arbitrarily deep aggregate chains ([`descriptor`]). Also included: the
//! projection of a step graph's output onto the external materialized tree
//! ([`binder`], [`tree`]) and the batched state-application mechanism that
//! enforces temporal ordering of compound deltas ([`batch`]).
//!
//! Deliberately out of scope (§1): the fluent builder that constructs a
//! step graph from a declarative chain, the type descriptor's synthesis,
//! the outer state container, and grouping-key canonicalization/hashing.
//! [`pipeline`] wires the in-scope pieces together behind the two
//! operations §6 describes as the external interface.

pub mod batch;
pub mod binder;
pub mod descriptor;
pub mod event;
pub mod input;
pub mod path;
pub mod pipeline;
pub mod steps;
pub mod tree;
pub mod value;

pub use descriptor::TypeDescriptor;
pub use event::{EventSink, Step};
pub use input::InputStep;
pub use pipeline::Pipeline;
