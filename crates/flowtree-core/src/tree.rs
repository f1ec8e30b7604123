//! Materialized-tree transforms (§4.8, §9): the pure functions that apply an
//! add/remove/modify to a tree of ordered keyed arrays.
//!
//! The tree root is itself a keyed array (§6: "the outer state container
//! holds ... a keyed array at the root"). Every row may in turn own zero or
//! more named child keyed arrays, mirroring the shape the final
//! [`crate::descriptor::TypeDescriptor`] describes.
//!
//! Locating the array at a given [`SegPath`] from a [`KeyPath`] is the same
//! walk regardless of operation kind: `seg` and `key_path` are always the
//! same length, and `(key_path[i], seg[i])` pairs tell you which row to
//! step into and which of its child arrays to descend into next (§9
//! "Ordered insertion at nested levels").

use indexmap::IndexMap;

use crate::path::{Key, KeyPath, PropName, SegPath};
use crate::value::{Props, Value};

/// One row of a [`KeyedArray`]: its current properties plus any named child
/// arrays nested underneath it.
#[derive(Clone, Debug, Default)]
pub struct Row {
    pub props: Props,
    pub children: std::collections::HashMap<PropName, KeyedArray>,
}

/// An ordered sequence of `{ key, value }` records (§3 "Keyed array").
/// Backed by [`IndexMap`] so that insertion order is preserved exactly as
/// the spec requires: a surviving row keeps its index, a removed row's slot
/// collapses, and a freshly added row is appended.
#[derive(Clone, Debug, Default)]
pub struct KeyedArray {
    rows: IndexMap<Key, Row>,
}

impl KeyedArray {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in insertion order (testable property #2, "order stability").
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Row)> {
        self.rows.iter()
    }

    pub fn get(&self, key: &Key) -> Option<&Row> {
        self.rows.get(key)
    }
}

/// The materialized tree: a keyed array at the root (§6).
pub type MaterializedTree = KeyedArray;

/// Errors a transform can raise. Per §7, these are the *contract
/// violations*: bugs in the step graph, not ordinary races against
/// concurrent batching.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TransformError {
    #[error("mismatched path lengths: seg path has {seg_len} segment(s), key path has {key_path_len}")]
    MismatchedPathLengths { seg_len: usize, key_path_len: usize },

    #[error("Path references unknown item")]
    UnknownItem,
}

/// Best-effort outcome of a transform that is allowed to be a silent skip
/// (§7 "Best-effort skips"): `Ok(true)` applied, `Ok(false)` was dropped
/// because its target doesn't exist, `Err` is a contract violation.
pub type SkippableResult = Result<bool, TransformError>;

fn locate_array<'a>(root: &'a mut KeyedArray, seg: &[PropName], key_path: &[Key]) -> Result<Option<&'a mut KeyedArray>, TransformError> {
    if seg.len() != key_path.len() {
        return Err(TransformError::MismatchedPathLengths {
            seg_len: seg.len(),
            key_path_len: key_path.len(),
        });
    }
    let mut current = root;
    for (name, key) in seg.iter().zip(key_path.iter()) {
        let Some(row) = current.rows.get_mut(key) else {
            return Ok(None);
        };
        current = row.children.entry(name.clone()).or_default();
    }
    Ok(Some(current))
}

/// Applies `added(seg, key_path, key, props)`.
///
/// Throws (returns `Err`) when the parent doesn't exist at a non-root
/// segment path: per §7, an `added` targeting a missing parent is a
/// contract violation, *except* when the gap is due to ordinary batching
/// races, which the caller (the batched updater, §4.8) is responsible for
/// distinguishing by applying operations strictly in enqueue order.
pub fn apply_added(root: &mut MaterializedTree, seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) -> Result<(), TransformError> {
    // `locate_array` only returns `None` for a non-root seg whose ancestor
    // row is missing — the root array itself always exists, so this is
    // exactly the §7 "added into missing parent at a non-root segment path"
    // contract violation.
    let Some(array) = locate_array(root, seg.as_slice(), key_path.as_slice())? else {
        return Err(TransformError::UnknownItem);
    };
    array.rows.insert(key.clone(), Row { props: props.clone(), children: std::collections::HashMap::new() });
    Ok(())
}

/// Applies `removed(seg, key_path, key, props)`. A missing target is a
/// best-effort skip (§7): a filter may have gated the row away before it
/// ever reached the binder.
pub fn apply_removed(root: &mut MaterializedTree, seg: &SegPath, key_path: &KeyPath, key: &Key) -> SkippableResult {
    let Some(array) = locate_array(root, seg.as_slice(), key_path.as_slice())? else {
        return Ok(false);
    };
    Ok(array.rows.shift_remove(key).is_some())
}

/// Applies `modified(seg, property, key_path, key, old, new)`.
///
/// `new == Value::Null` deletes the property rather than setting it to
/// `null` — this is how `Aggregate::Absent` (§9 "Representation of absent
/// aggregates") materializes: an empty parent has the property removed
/// entirely rather than set to a JSON null.
pub fn apply_modified(root: &mut MaterializedTree, seg: &SegPath, property: &PropName, key_path: &KeyPath, key: &Key, new: &Value) -> SkippableResult {
    let Some(array) = locate_array(root, seg.as_slice(), key_path.as_slice())? else {
        return Ok(false);
    };
    let Some(row) = array.rows.get_mut(key) else {
        return Ok(false);
    };
    if new.is_null() {
        row.props.remove(&**property);
    } else {
        row.props.insert(property.to_string(), new.clone());
    }
    Ok(true)
}
