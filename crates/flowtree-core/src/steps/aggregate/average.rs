//! `AverageAggregateStep` (§4.7.3).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::parent_address;
use crate::descriptor::TypeDescriptor;
use crate::event::{notify_modified, EventSink, SinkList, Step};
use crate::path::{Key, KeyPath, KeyPathHash, PropName, SegPath};
use crate::value::{as_numeric, Aggregate, Props, Value};

#[derive(Default, Clone, Copy)]
struct ParentState {
    sum: f64,
    count: usize,
}

impl ParentState {
    fn average(self) -> Aggregate<f64> {
        if self.count == 0 {
            Aggregate::Absent
        } else {
            Aggregate::Present(self.sum / self.count as f64)
        }
    }
}

pub struct AverageAggregateStep {
    upstream: Arc<dyn Step>,
    child_seg_path: SegPath,
    tracked_property: PropName,
    property_name: PropName,

    parents: Mutex<HashMap<KeyPathHash, ParentState>>,
    /// Last-known numeric contribution of each child, so `removed`/`modified`
    /// can adjust `sum`/`count` correctly for children that never had a
    /// numeric value (and thus never contributed).
    contributions: Mutex<HashMap<(KeyPathHash, Key), Option<f64>>>,
    modified_sinks: Mutex<SinkList>,
}

impl AverageAggregateStep {
    pub fn new(
        upstream: Arc<dyn Step>,
        child_seg_path: SegPath,
        tracked_property: impl Into<PropName>,
        property_name: impl Into<PropName>,
    ) -> Arc<Self> {
        let tracked_property = tracked_property.into();
        let step = Arc::new(Self {
            upstream: upstream.clone(),
            child_seg_path: child_seg_path.clone(),
            tracked_property: tracked_property.clone(),
            property_name: property_name.into(),
            parents: Mutex::new(HashMap::new()),
            contributions: Mutex::new(HashMap::new()),
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

impl Step for AverageAggregateStep {
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

impl EventSink for AverageAggregateStep {
    fn on_added(&self, _seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) {
        let parent_hash = key_path.hash_id();
        let value = as_numeric(props.get(&*self.tracked_property).unwrap_or(&Value::Null));

        let mut parents = self.parents.lock();
        let entry = parents.entry(parent_hash).or_default();
        let old = entry.average();
        if let Some(v) = value {
            entry.sum += v;
            entry.count += 1;
        }
        let new = entry.average();
        drop(parents);

        self.contributions.lock().insert((parent_hash, key.clone()), value);
        self.emit(key_path, old, new);
    }

    fn on_removed(&self, _seg: &SegPath, key_path: &KeyPath, key: &Key, _props: &Props) {
        let parent_hash = key_path.hash_id();
        let contribution = self.contributions.lock().remove(&(parent_hash, key.clone())).flatten();

        let mut parents = self.parents.lock();
        let Some(entry) = parents.get_mut(&parent_hash) else {
            flowtree_log::warn_once!("average: removed for untracked parent");
            return;
        };
        let old = entry.average();
        if let Some(v) = contribution {
            entry.sum -= v;
            entry.count -= 1;
        }
        let new = if entry.count == 0 {
            parents.remove(&parent_hash);
            Aggregate::Absent
        } else {
            entry.average()
        };
        drop(parents);
        self.emit(key_path, old, new);
    }

    fn on_modified(&self, _seg: &SegPath, _property: &PropName, key_path: &KeyPath, key: &Key, _old: &Value, new: &Value) {
        let parent_hash = key_path.hash_id();
        let new_value = as_numeric(new);

        let mut contributions = self.contributions.lock();
        let old_value = contributions.insert((parent_hash, key.clone()), new_value).flatten();
        drop(contributions);

        let mut parents = self.parents.lock();
        let entry = parents.entry(parent_hash).or_default();
        let old = entry.average();
        if let Some(v) = old_value {
            entry.sum -= v;
            entry.count -= 1;
        }
        if let Some(v) = new_value {
            entry.sum += v;
            entry.count += 1;
        }
        let new = entry.average();
        drop(parents);
        self.emit(key_path, old, new);
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::ChildSource;
    use super::*;

    struct Capture(Mutex<Vec<Value>>);
    impl EventSink for Capture {
        fn on_added(&self, _: &SegPath, _: &KeyPath, _: &Key, _: &Props) {}
        fn on_removed(&self, _: &SegPath, _: &KeyPath, _: &Key, _: &Props) {}
        fn on_modified(&self, _: &SegPath, _: &PropName, _: &KeyPath, _: &Key, _old: &Value, new: &Value) {
            self.0.lock().push(new.clone());
        }
    }

    #[test]
    fn average_updates_as_children_join_change_and_leave() {
        let source = Arc::new(ChildSource::default());
        let step = AverageAggregateStep::new(source.clone(), ChildSource::seg(), "score", "mean");

        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        step.subscribe_modified(SegPath::root(), "mean".into(), capture.clone());

        source.add(&"a".into(), &[("score".to_string(), Value::from(2))].into_iter().collect());
        source.add(&"b".into(), &[("score".to_string(), Value::from(4))].into_iter().collect());
        source.remove(&"a".into(), &[("score".to_string(), Value::from(2))].into_iter().collect());

        let captured = std::mem::take(&mut *capture.0.lock());
        assert_eq!(captured, vec![Value::from(2.0), Value::from(3.0), Value::from(4.0)]);
    }

    #[test]
    fn non_numeric_children_are_excluded_from_the_average() {
        let source = Arc::new(ChildSource::default());
        let step = AverageAggregateStep::new(source.clone(), ChildSource::seg(), "score", "mean");

        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        step.subscribe_modified(SegPath::root(), "mean".into(), capture.clone());

        source.add(&"a".into(), &[("score".to_string(), Value::String("n/a".into()))].into_iter().collect());
        source.add(&"b".into(), &[("score".to_string(), Value::from(10))].into_iter().collect());

        let captured = capture.0.lock();
        assert_eq!(captured.last(), Some(&Value::from(10.0)));
    }
}
