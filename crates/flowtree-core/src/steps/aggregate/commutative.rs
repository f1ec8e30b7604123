//! `CommutativeAggregateStep` (§4.7.1): sum, count, and any other aggregate
//! expressible as an abelian group over `f64` (`add`/`subtract` closures).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::parent_address;
use crate::descriptor::TypeDescriptor;
use crate::event::{notify_modified, EventSink, SinkList, Step};
use crate::path::{Key, KeyPath, KeyPathHash, PropName, SegPath};
use crate::value::{as_numeric, Aggregate, Props, Value};

type CombineFn = dyn Fn(f64, &Props) -> f64 + Send + Sync;

struct ParentState {
    acc: f64,
    count: usize,
}

pub struct CommutativeAggregateStep {
    upstream: Arc<dyn Step>,
    child_seg_path: SegPath,
    tracked_property: PropName,
    property_name: PropName,
    identity: f64,
    add: Box<CombineFn>,
    subtract: Box<CombineFn>,

    parents: Mutex<HashMap<KeyPathHash, ParentState>>,
    children: Mutex<HashMap<(KeyPathHash, Key), Props>>,
    modified_sinks: Mutex<SinkList>,
}

impl CommutativeAggregateStep {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        upstream: Arc<dyn Step>,
        child_seg_path: SegPath,
        tracked_property: impl Into<PropName>,
        property_name: impl Into<PropName>,
        identity: f64,
        add: impl Fn(f64, &Props) -> f64 + Send + Sync + 'static,
        subtract: impl Fn(f64, &Props) -> f64 + Send + Sync + 'static,
    ) -> Arc<Self> {
        let tracked_property = tracked_property.into();
        let step = Arc::new(Self {
            upstream: upstream.clone(),
            child_seg_path: child_seg_path.clone(),
            tracked_property: tracked_property.clone(),
            property_name: property_name.into(),
            identity,
            add: Box::new(add),
            subtract: Box::new(subtract),
            parents: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
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

impl Step for CommutativeAggregateStep {
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

impl EventSink for CommutativeAggregateStep {
    fn on_added(&self, _seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) {
        let parent_hash = key_path.hash_id();
        let mut parents = self.parents.lock();
        let entry = parents.entry(parent_hash).or_insert(ParentState {
            acc: self.identity,
            count: 0,
        });
        let old = if entry.count == 0 { Aggregate::Absent } else { Aggregate::Present(entry.acc) };
        entry.acc = (self.add)(entry.acc, props);
        entry.count += 1;
        let new = Aggregate::Present(entry.acc);
        drop(parents);

        self.children.lock().insert((parent_hash, key.clone()), props.clone());
        self.emit(key_path, old, new);
    }

    fn on_removed(&self, _seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) {
        let parent_hash = key_path.hash_id();
        self.children.lock().remove(&(parent_hash, key.clone()));

        let mut parents = self.parents.lock();
        let Some(entry) = parents.get_mut(&parent_hash) else {
            flowtree_log::warn_once!("aggregate: removed for untracked parent");
            return;
        };
        let old = Aggregate::Present(entry.acc);
        entry.acc = (self.subtract)(entry.acc, props);
        entry.count -= 1;
        let new = if entry.count == 0 {
            parents.remove(&parent_hash);
            Aggregate::Absent
        } else {
            Aggregate::Present(entry.acc)
        };
        drop(parents);
        self.emit(key_path, old, new);
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
        let parent_hash = key_path.hash_id();
        let mut children = self.children.lock();
        let Some(cached) = children.get_mut(&(parent_hash, key.clone())) else {
            flowtree_log::warn_once!("aggregate: modified({property:?}) for untracked child");
            return;
        };
        let mut synth_old = cached.clone();
        synth_old.insert(property.to_string(), old.clone());
        let mut synth_new = cached.clone();
        synth_new.insert(property.to_string(), new.clone());
        cached.insert(property.to_string(), new.clone());
        drop(children);

        let mut parents = self.parents.lock();
        let Some(entry) = parents.get_mut(&parent_hash) else {
            flowtree_log::warn_once!("aggregate: modified for untracked parent");
            return;
        };
        let old_agg = Aggregate::Present(entry.acc);
        entry.acc = (self.add)((self.subtract)(entry.acc, &synth_old), &synth_new);
        let new_agg = Aggregate::Present(entry.acc);
        drop(parents);
        self.emit(key_path, old_agg, new_agg);
    }
}
