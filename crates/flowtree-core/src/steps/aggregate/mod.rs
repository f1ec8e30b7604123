//! Aggregate steps (§4.7): each targets a child array by its full segment
//! path and produces a property at the *parent* segment path (the path with
//! the last segment dropped). Shared here is only the address arithmetic —
//! each aggregate kind keeps its own per-parent state shape.

mod average;
mod commutative;
mod minmax;
mod pick;

pub use average::AverageAggregateStep;
pub use commutative::CommutativeAggregateStep;
pub use minmax::{MinMaxAggregateStep, MinMaxKind};
pub use pick::PickByMinMaxStep;

use crate::path::{Key, KeyPath, SegPath};

/// Derives `(parentSegPath, grandparentKeyPath, parentKey)` from a child
/// array's full segment path and the key path carried by an event fired at
/// that array. `child_seg` is never root (an aggregate always targets a
/// nested array), so both splits always succeed.
pub(crate) fn parent_address(child_seg: &SegPath, key_path: &KeyPath) -> (SegPath, KeyPath, Key) {
    let (parent_seg, _array_name) = child_seg.split_last().expect("aggregate child path is never root");
    let (grandparent_key_path, parent_key) =
        key_path.split_last().expect("key path length matches child_seg length, which is >= 1");
    (parent_seg, grandparent_key_path, parent_key.clone())
}
