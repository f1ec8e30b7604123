//! `GroupByStep` (§4.3): inserts a grouping level above a scope path, moving
//! `grouping_properties` to an enclosing row and everything else into a new
//! child array named `array_name`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::descriptor::TypeDescriptor;
use crate::event::{notify_added, notify_modified, notify_removed, EventSink, SinkList, Step};
use crate::path::{path_starts_with, Key, KeyPath, KeyPathHash, PropName, SegPath};
use crate::value::{Props, Value};

/// Per-group bookkeeping, keyed by `(parentKeyPathHash, groupKey)`.
struct GroupState {
    member_count: usize,
    grouping_props: Props,
}

/// Per-item bookkeeping, keyed by `(parentKeyPathHash, itemKey)`. Holds the
/// full last-known props so a regroup can re-derive both the new group key
/// and the remaining (non-grouping) props for the child row.
struct ItemState {
    group_key: Key,
    props: Props,
}

type ItemsTable = Mutex<HashMap<(KeyPathHash, Key), ItemState>>;

fn canonicalize_group_key(props: &Props, grouping_properties: &[PropName]) -> Key {
    use std::collections::BTreeMap;
    let subset: BTreeMap<&str, &Value> = grouping_properties
        .iter()
        .filter_map(|p| props.get(&**p).map(|v| (&**p, v)))
        .collect();
    let canonical = serde_json::to_string(&subset).unwrap_or_default();

    use std::hash::{Hash as _, Hasher as _};
    let mut hasher = ahash::AHasher::default();
    canonical.hash(&mut hasher);
    format!("{:016x}", hasher.finish()).into()
}

fn grouping_subset(props: &Props, grouping_properties: &[PropName]) -> Props {
    let mut out = Props::new();
    for p in grouping_properties {
        if let Some(v) = props.get(&**p) {
            out.insert(p.to_string(), v.clone());
        }
    }
    out
}

fn remaining_props(props: &Props, grouping_properties: &[PropName]) -> Props {
    let mut out = props.clone();
    for p in grouping_properties {
        out.remove(&**p);
    }
    out
}

/// Inserts `group_key` into a key path at `scope_len`, the boundary between
/// the parent and the (formerly item-, now group-keyed) child array.
fn insert_group_key(scope_len: usize, key_path: &KeyPath, group_key: &Key) -> KeyPath {
    let keys = key_path.as_slice();
    KeyPath::from_keys(
        keys[..scope_len]
            .iter()
            .cloned()
            .chain(std::iter::once(group_key.clone()))
            .chain(keys[scope_len..].iter().cloned()),
    )
}

/// Forwards events for a path at or below the new child array level,
/// remapping the key path to insert the owning group's key. Unlike
/// `FilterStep`'s deep gate, there is no pass/fail gating here — only
/// address translation.
struct ChildRelay {
    scope_len: usize,
    items: Arc<ItemsTable>,
    output_seg: SegPath,
    added_sinks: Mutex<SinkList>,
    removed_sinks: Mutex<SinkList>,
    modified_sinks: Mutex<HashMap<PropName, SinkList>>,
}

impl ChildRelay {
    fn group_key_for(&self, key_path: &KeyPath) -> Option<Key> {
        let prefix = KeyPath::from_keys(key_path.as_slice()[..self.scope_len].iter().cloned());
        let item_key = key_path.as_slice()[self.scope_len].clone();
        self.items.lock().get(&(prefix.hash_id(), item_key)).map(|s| s.group_key.clone())
    }
}

impl EventSink for ChildRelay {
    fn on_added(&self, _seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) {
        let Some(group_key) = self.group_key_for(key_path) else {
            flowtree_log::warn_once!("group_by: added for untracked item at {key_path:?}");
            return;
        };
        let out_key_path = insert_group_key(self.scope_len, key_path, &group_key);
        notify_added(&self.added_sinks.lock(), &self.output_seg, &out_key_path, key, props);
    }

    fn on_removed(&self, _seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) {
        let Some(group_key) = self.group_key_for(key_path) else {
            flowtree_log::warn_once!("group_by: removed for untracked item at {key_path:?}");
            return;
        };
        let out_key_path = insert_group_key(self.scope_len, key_path, &group_key);
        notify_removed(&self.removed_sinks.lock(), &self.output_seg, &out_key_path, key, props);
    }

    fn on_modified(
        &self,
        _seg: &SegPath,
        property: &PropName,
        key_path: &KeyPath,
        key: &Key,
        old: &Value,
        new: &Value,
    ) {
        let Some(group_key) = self.group_key_for(key_path) else {
            flowtree_log::warn_once!("group_by: modified({property:?}) for untracked item at {key_path:?}");
            return;
        };
        let sinks = self.modified_sinks.lock();
        let Some(list) = sinks.get(property) else { return };
        let out_key_path = insert_group_key(self.scope_len, key_path, &group_key);
        notify_modified(list, &self.output_seg, property, &out_key_path, key, old, new);
    }
}

pub struct GroupByStep {
    upstream: Arc<dyn Step>,
    scope_path: SegPath,
    grouping_properties: Vec<PropName>,
    array_name: PropName,

    groups: Mutex<HashMap<KeyPathHash, HashMap<Key, GroupState>>>,
    items: Arc<ItemsTable>,

    scope_added: Mutex<SinkList>,
    scope_removed: Mutex<SinkList>,
    scope_modified: Mutex<HashMap<PropName, SinkList>>,
    child_added: Mutex<SinkList>,
    child_removed: Mutex<SinkList>,
    /// One relay per distinct segment path at-or-below the child array level
    /// that some downstream consumer has subscribed to.
    deep: Mutex<HashMap<SegPath, Arc<ChildRelay>>>,
}

impl GroupByStep {
    pub fn new(
        upstream: Arc<dyn Step>,
        scope_path: SegPath,
        grouping_properties: Vec<PropName>,
        array_name: impl Into<PropName>,
    ) -> Arc<Self> {
        let array_name = array_name.into();
        let step = Arc::new(Self {
            upstream: upstream.clone(),
            scope_path: scope_path.clone(),
            grouping_properties: grouping_properties.clone(),
            array_name,
            groups: Mutex::new(HashMap::new()),
            items: Arc::new(Mutex::new(HashMap::new())),
            scope_added: Mutex::new(SinkList::new()),
            scope_removed: Mutex::new(SinkList::new()),
            scope_modified: Mutex::new(HashMap::new()),
            child_added: Mutex::new(SinkList::new()),
            child_removed: Mutex::new(SinkList::new()),
            deep: Mutex::new(HashMap::new()),
        });

        upstream.subscribe_added(scope_path.clone(), step.clone());
        upstream.subscribe_removed(scope_path.clone(), step.clone());

        let upstream_mutable = upstream.type_descriptor().at_path(scope_path.as_slice()).map(|t| t.mutable_properties.clone()).unwrap_or_default();
        for prop in &grouping_properties {
            if upstream_mutable.contains(prop) {
                upstream.subscribe_modified(scope_path.clone(), prop.clone(), step.clone());
            }
        }

        step
    }

    fn child_seg(&self) -> SegPath {
        self.scope_path.child(self.array_name.clone())
    }

    /// Returns the (possibly freshly subscribed) relay for a segment path at
    /// or below the child array level.
    fn deep_relay_for(&self, seg: &SegPath) -> Arc<ChildRelay> {
        let mut deep = self.deep.lock();
        if let Some(relay) = deep.get(seg) {
            return relay.clone();
        }
        let scope_len = self.scope_path.len();
        let tail = &seg.as_slice()[scope_len + 1..];
        let upstream_seg = SegPath::from_segments(self.scope_path.as_slice().iter().cloned().chain(tail.iter().cloned()));

        let relay = Arc::new(ChildRelay {
            scope_len,
            items: self.items.clone(),
            output_seg: seg.clone(),
            added_sinks: Mutex::new(SinkList::new()),
            removed_sinks: Mutex::new(SinkList::new()),
            modified_sinks: Mutex::new(HashMap::new()),
        });
        deep.insert(seg.clone(), relay.clone());
        drop(deep);

        self.upstream.subscribe_added(upstream_seg.clone(), relay.clone());
        self.upstream.subscribe_removed(upstream_seg, relay.clone());
        relay
    }
}

impl Step for GroupByStep {
    fn type_descriptor(&self) -> TypeDescriptor {
        let mut ty = self.upstream.type_descriptor();
        if let Some(level) = ty.at_path_mut(self.scope_path.as_slice()) {
            let original = level.clone();
            let mut enclosing_mutable = std::collections::BTreeSet::new();
            for prop in &self.grouping_properties {
                if original.mutable_properties.contains(prop) {
                    enclosing_mutable.insert(prop.clone());
                }
            }
            let mut child_ty = original;
            for prop in &self.grouping_properties {
                child_ty.unmark_mutable(prop);
            }
            level.mutable_properties = enclosing_mutable;
            level.arrays = vec![crate::descriptor::ArrayDescriptor {
                name: self.array_name.clone(),
                ty: child_ty,
            }];
            level.objects = Vec::new();
        }
        ty
    }

    fn subscribe_added(&self, seg: SegPath, sink: Arc<dyn EventSink>) {
        if seg == self.scope_path {
            self.scope_added.lock().push(sink);
        } else if seg == self.child_seg() {
            self.child_added.lock().push(sink);
        } else if path_starts_with(&seg, &self.child_seg()) {
            self.deep_relay_for(&seg).added_sinks.lock().push(sink);
        } else {
            self.upstream.subscribe_added(seg, sink);
        }
    }

    fn subscribe_removed(&self, seg: SegPath, sink: Arc<dyn EventSink>) {
        if seg == self.scope_path {
            self.scope_removed.lock().push(sink);
        } else if seg == self.child_seg() {
            self.child_removed.lock().push(sink);
        } else if path_starts_with(&seg, &self.child_seg()) {
            self.deep_relay_for(&seg).removed_sinks.lock().push(sink);
        } else {
            self.upstream.subscribe_removed(seg, sink);
        }
    }

    fn subscribe_modified(&self, seg: SegPath, property: PropName, sink: Arc<dyn EventSink>) {
        if seg == self.scope_path && self.grouping_properties.contains(&property) {
            // Grouping-property changes never surface downstream as
            // `modified` — they drive the regroup algorithm instead.
            self.scope_modified.lock().entry(property).or_default().push(sink);
        } else if path_starts_with(&seg, &self.child_seg()) || seg == self.child_seg() {
            let relay = self.deep_relay_for(&seg);
            let scope_len = self.scope_path.len();
            let tail = &seg.as_slice()[scope_len + 1..];
            let upstream_seg = SegPath::from_segments(self.scope_path.as_slice().iter().cloned().chain(tail.iter().cloned()));
            let first_for_property = !relay.modified_sinks.lock().contains_key(&property);
            relay.modified_sinks.lock().entry(property.clone()).or_default().push(sink);
            if first_for_property {
                self.upstream.subscribe_modified(upstream_seg, property, relay);
            }
        } else {
            self.upstream.subscribe_modified(seg, property, sink);
        }
    }
}

impl EventSink for GroupByStep {
    fn on_added(&self, seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) {
        let parent_hash = key_path.hash_id();
        let group_key = canonicalize_group_key(props, &self.grouping_properties);
        let grouping = grouping_subset(props, &self.grouping_properties);

        let mut groups = self.groups.lock();
        let parent_groups = groups.entry(parent_hash).or_default();
        let is_new_group = !parent_groups.contains_key(&group_key);
        let state = parent_groups.entry(group_key.clone()).or_insert_with(|| GroupState {
            member_count: 0,
            grouping_props: grouping.clone(),
        });
        state.member_count += 1;
        drop(groups);

        self.items.lock().insert(
            (parent_hash, key.clone()),
            ItemState {
                group_key: group_key.clone(),
                props: props.clone(),
            },
        );

        if is_new_group {
            notify_added(&self.scope_added.lock(), seg, key_path, &group_key, &grouping);
        }

        let remaining = remaining_props(props, &self.grouping_properties);
        let child_seg = self.child_seg();
        let child_key_path = key_path.child(group_key);
        notify_added(&self.child_added.lock(), &child_seg, &child_key_path, key, &remaining);
    }

    fn on_removed(&self, seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) {
        let parent_hash = key_path.hash_id();
        let Some(item) = self.items.lock().remove(&(parent_hash, key.clone())) else {
            flowtree_log::warn_once!("group_by: removed for untracked item at {seg:?}");
            return;
        };

        let remaining = remaining_props(props, &self.grouping_properties);
        let child_seg = self.child_seg();
        let child_key_path = key_path.child(item.group_key.clone());
        notify_removed(&self.child_removed.lock(), &child_seg, &child_key_path, key, &remaining);

        let mut groups = self.groups.lock();
        if let Some(parent_groups) = groups.get_mut(&parent_hash) {
            if let Some(state) = parent_groups.get_mut(&item.group_key) {
                state.member_count -= 1;
                if state.member_count == 0 {
                    let snapshot = state.grouping_props.clone();
                    parent_groups.remove(&item.group_key);
                    drop(groups);
                    notify_removed(&self.scope_removed.lock(), seg, key_path, &item.group_key, &snapshot);
                }
            }
        }
    }

    fn on_modified(
        &self,
        seg: &SegPath,
        property: &PropName,
        key_path: &KeyPath,
        key: &Key,
        _old: &Value,
        new: &Value,
    ) {
        let parent_hash = key_path.hash_id();
        let mut items = self.items.lock();
        let Some(item) = items.get_mut(&(parent_hash, key.clone())) else {
            flowtree_log::warn_once!("group_by: modified({property:?}) for untracked item at {seg:?}");
            return;
        };

        item.props.insert(property.to_string(), new.clone());
        let new_group_key = canonicalize_group_key(&item.props, &self.grouping_properties);
        let old_group_key = item.group_key.clone();
        if new_group_key == old_group_key {
            return;
        }
        item.group_key = new_group_key.clone();
        let current_props = item.props.clone();
        drop(items);

        let remaining = remaining_props(&current_props, &self.grouping_properties);
        let new_grouping = grouping_subset(&current_props, &self.grouping_properties);
        let child_seg = self.child_seg();

        // old-child-remove
        let old_child_key_path = key_path.child(old_group_key.clone());
        notify_removed(&self.child_removed.lock(), &child_seg, &old_child_key_path, key, &remaining);

        // old-group-remove-if-empty
        let mut groups = self.groups.lock();
        if let Some(parent_groups) = groups.get_mut(&parent_hash) {
            if let Some(state) = parent_groups.get_mut(&old_group_key) {
                state.member_count -= 1;
                if state.member_count == 0 {
                    let snapshot = state.grouping_props.clone();
                    parent_groups.remove(&old_group_key);
                    notify_removed(&self.scope_removed.lock(), seg, key_path, &old_group_key, &snapshot);
                }
            }
        }

        // new-group-add-if-needed
        let parent_groups = groups.entry(parent_hash).or_default();
        let is_new_group = !parent_groups.contains_key(&new_group_key);
        let state = parent_groups.entry(new_group_key.clone()).or_insert_with(|| GroupState {
            member_count: 0,
            grouping_props: new_grouping.clone(),
        });
        state.member_count += 1;
        drop(groups);

        if is_new_group {
            notify_added(&self.scope_added.lock(), seg, key_path, &new_group_key, &new_grouping);
        }

        // new-child-add
        let new_child_key_path = key_path.child(new_group_key);
        notify_added(&self.child_added.lock(), &child_seg, &new_child_key_path, key, &remaining);
    }
}
