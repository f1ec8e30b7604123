//! Segment-path and key-path primitives.
//!
//! A [`SegPath`] is the array-name chain that locates a nesting level in the
//! output tree (`["states", "cities", "towns"]`); a [`KeyPath`] is the chain
//! of parent keys required to reach the parent of that level. Both are plain
//! data — every function here is pure, there is no I/O and no shared state.

use std::sync::Arc;

/// An interned-ish property / array name. `Arc<str>` so that paths can be
/// cloned freely as they get threaded through every step and every event.
pub type PropName = Arc<str>;

/// A row key, unique among siblings, stable across modifications.
pub type Key = Arc<str>;

/// Ordered sequence of array-property names identifying one nesting level.
///
/// The empty path denotes the root level.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SegPath(Vec<PropName>);

impl SegPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn from_segments(segments: impl IntoIterator<Item = impl Into<PropName>>) -> Self {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[PropName] {
        &self.0
    }

    /// Returns `self ++ [array_name]`.
    #[must_use]
    pub fn child(&self, array_name: impl Into<PropName>) -> Self {
        let mut segments = self.0.clone();
        segments.push(array_name.into());
        Self(segments)
    }

    /// Splits the last segment off, returning `(parent_seg_path, array_name)`.
    ///
    /// This is how an aggregate step derives its *parent* segment path (the
    /// path with the last segment dropped) from the full path to the array it
    /// targets. Returns `None` for the root path.
    pub fn split_last(&self) -> Option<(SegPath, &PropName)> {
        let (last, rest) = self.0.split_last()?;
        Some((SegPath(rest.to_vec()), last))
    }

    pub fn last(&self) -> Option<&PropName> {
        self.0.last()
    }
}

/// `path_starts_with(a, b)`: is `b` a prefix of `a`?
pub fn path_starts_with(a: &SegPath, b: &SegPath) -> bool {
    a.0.len() >= b.0.len() && a.0[..b.0.len()] == b.0[..]
}

/// `paths_match(a, b)`: sequence equality.
pub fn paths_match(a: &SegPath, b: &SegPath) -> bool {
    a == b
}

/// Ordered sequence of parent keys identifying one specific row at the
/// parent of a given segment path. Empty for root-level events.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct KeyPath(Vec<Key>);

impl KeyPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn from_keys(keys: impl IntoIterator<Item = impl Into<Key>>) -> Self {
        Self(keys.into_iter().map(Into::into).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Key] {
        &self.0
    }

    /// Returns `self ++ [key]`.
    #[must_use]
    pub fn child(&self, key: impl Into<Key>) -> Self {
        let mut keys = self.0.clone();
        keys.push(key.into());
        Self(keys)
    }

    /// Splits the last key off: `(grandparent_key_path, parent_key)`.
    ///
    /// Used by aggregate steps to derive the grandparent key-path and parent
    /// key from the upstream child's key-path when emitting their `modified`
    /// event on the parent.
    pub fn split_last(&self) -> Option<(KeyPath, &Key)> {
        let (last, rest) = self.0.split_last()?;
        Some((KeyPath(rest.to_vec()), last))
    }

    /// Stable short identifier, suitable as a map key. Every path-keyed map
    /// in the engine uses this instead of hashing `KeyPath` directly, so that
    /// per-parent state tables can use [`nohash_hasher`] maps.
    pub fn hash_id(&self) -> KeyPathHash {
        use std::hash::{Hash as _, Hasher as _};
        let mut hasher = ahash::AHasher::default();
        self.0.hash(&mut hasher);
        KeyPathHash(hasher.finish())
    }
}

/// A short, stable identifier for a [`KeyPath`], used as a map key so that
/// per-parent state tables don't have to re-hash a `Vec<Arc<str>>` on every
/// lookup.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct KeyPathHash(pub u64);

impl nohash_hasher::IsEnabled for KeyPathHash {}
