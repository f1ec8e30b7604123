//! The transparent and aggregate step implementations (§4.3–§4.7).
//!
//! "Transparent" here means shape-preserving or shape-changing steps whose
//! outputs are purely derived from upstream events — as opposed to the
//! aggregate steps in [`aggregate`], which additionally maintain per-parent
//! state and emit synthetic `modified` events of their own.

pub mod aggregate;
mod define_property;
mod drop_property;
mod filter;
mod group_by;

pub use define_property::DefinePropertyStep;
pub use drop_property::DropPropertyStep;
pub use filter::FilterStep;
pub use group_by::GroupByStep;
