//! `MinMaxAggregateStep` (§4.7.2).

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::parent_address;
use crate::descriptor::TypeDescriptor;
use crate::event::{notify_modified, EventSink, SinkList, Step};
use crate::path::{Key, KeyPath, KeyPathHash, PropName, SegPath};
use crate::value::{as_numeric, Aggregate, Props, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MinMaxKind {
    Min,
    Max,
}

impl MinMaxKind {
    fn fold(self, values: impl Iterator<Item = f64>) -> Option<f64> {
        match self {
            // `fold` with a strict comparison keeps the first-seen value on
            // ties: insertion order is iteration order for `IndexMap`.
            MinMaxKind::Min => values.fold(None, |acc, v| match acc {
                None => Some(v),
                Some(cur) if v < cur => Some(v),
                Some(cur) => Some(cur),
            }),
            MinMaxKind::Max => values.fold(None, |acc, v| match acc {
                None => Some(v),
                Some(cur) if v > cur => Some(v),
                Some(cur) => Some(cur),
            }),
        }
    }
}

pub struct MinMaxAggregateStep {
    upstream: Arc<dyn Step>,
    child_seg_path: SegPath,
    tracked_property: PropName,
    property_name: PropName,
    kind: MinMaxKind,

    parents: Mutex<HashMap<KeyPathHash, IndexMap<Key, f64>>>,
    modified_sinks: Mutex<SinkList>,
}

impl MinMaxAggregateStep {
    pub fn new(
        upstream: Arc<dyn Step>,
        child_seg_path: SegPath,
        tracked_property: impl Into<PropName>,
        property_name: impl Into<PropName>,
        kind: MinMaxKind,
    ) -> Arc<Self> {
        let tracked_property = tracked_property.into();
        let step = Arc::new(Self {
            upstream: upstream.clone(),
            child_seg_path: child_seg_path.clone(),
            tracked_property: tracked_property.clone(),
            property_name: property_name.into(),
            kind,
            parents: Mutex::new(HashMap::new()),
            modified_sinks: Mutex::new(SinkList::new()),
        });

        upstream.subscribe_added(child_seg_path.clone(), step.clone());
        upstream.subscribe_removed(child_seg_path.clone(), step.clone());

        let is_mutable = upstream
            .type_descriptor()
            .at_path(child_seg_path.as_slice())
            .is_some_and(|t| t.is_mutable(&tracked_property));
        if is_mutable {
            upstream.subscribe_modified(child_seg_path, tracked_property, step.clone());
        }

        step
    }

    fn extremum(parents: &HashMap<KeyPathHash, IndexMap<Key, f64>>, kind: MinMaxKind, parent_hash: KeyPathHash) -> Aggregate<f64> {
        match parents.get(&parent_hash).and_then(|m| kind.fold(m.values().copied())) {
            Some(v) => Aggregate::Present(v),
            None => Aggregate::Absent,
        }
    }

    fn emit(&self, key_path: &KeyPath, old: Aggregate<f64>, new: Aggregate<f64>) {
        let (parent_seg, grandparent_key_path, parent_key) = parent_address(&self.child_seg_path, key_path);
        notify_modified(
            &self.modified_sinks.lock(),
            &parent_seg,
            &self.property_name,
            &grandparent_key_path,
            &parent_key,
            &old.to_json(),
            &new.to_json(),
        );
    }
}

impl Step for MinMaxAggregateStep {
    fn type_descriptor(&self) -> TypeDescriptor {
        let mut ty = self.upstream.type_descriptor();
        let (parent_seg, _) = self.child_seg_path.split_last().expect("non-root");
        if let Some(level) = ty.at_path_mut(parent_seg.as_slice()) {
            level.mark_mutable(self.property_name.clone());
        }
        ty
    }

    fn subscribe_added(&self, seg: SegPath, sink: Arc<dyn EventSink>) {
        self.upstream.subscribe_added(seg, sink);
    }

    fn subscribe_removed(&self, seg: SegPath, sink: Arc<dyn EventSink>) {
        self.upstream.subscribe_removed(seg, sink);
    }

    fn subscribe_modified(&self, seg: SegPath, property: PropName, sink: Arc<dyn EventSink>) {
        let (parent_seg, _) = self.child_seg_path.split_last().expect("non-root");
        if seg == parent_seg && property == self.property_name {
            self.modified_sinks.lock().push(sink);
        } else {
            self.upstream.subscribe_modified(seg, property, sink);
        }
    }
}

impl EventSink for MinMaxAggregateStep {
    fn on_added(&self, _seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) {
        let parent_hash = key_path.hash_id();
        let mut parents = self.parents.lock();
        let old = Self::extremum(&parents, self.kind, parent_hash);
        if let Some(v) = as_numeric(props.get(&*self.tracked_property).unwrap_or(&Value::Null)) {
            parents.entry(parent_hash).or_default().insert(key.clone(), v);
        }
        let new = Self::extremum(&parents, self.kind, parent_hash);
        drop(parents);
        self.emit(key_path, old, new);
    }

    fn on_removed(&self, _seg: &SegPath, key_path: &KeyPath, key: &Key, _props: &Props) {
        let parent_hash = key_path.hash_id();
        let mut parents = self.parents.lock();
        let old = Self::extremum(&parents, self.kind, parent_hash);
        if let Some(m) = parents.get_mut(&parent_hash) {
            m.shift_remove(key);
        }
        let new = Self::extremum(&parents, self.kind, parent_hash);
        drop(parents);
        self.emit(key_path, old, new);
    }

    fn on_modified(&self, _seg: &SegPath, _property: &PropName, key_path: &KeyPath, key: &Key, _old: &Value, new: &Value) {
        let parent_hash = key_path.hash_id();
        let mut parents = self.parents.lock();
        let old = Self::extremum(&parents, self.kind, parent_hash);
        let m = parents.entry(parent_hash).or_default();
        match as_numeric(new) {
            Some(v) => {
                m.insert(key.clone(), v);
            }
            None => {
                m.shift_remove(key);
            }
        }
        let new_agg = Self::extremum(&parents, self.kind, parent_hash);
        drop(parents);
        self.emit(key_path, old, new_agg);
    }
}
