//! `PickByMinMaxStep` (§4.7.4): like [`super::MinMaxAggregateStep`], but
//! returns the entire extremal child row rather than just its comparison
//! value.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::parent_address;
use crate::descriptor::TypeDescriptor;
use crate::event::{notify_modified, EventSink, SinkList, Step};
use crate::path::{Key, KeyPath, KeyPathHash, PropName, SegPath};
use crate::value::{as_numeric, Aggregate, Props, Value};

use super::minmax::MinMaxKind;

/// Per-child bookkeeping kept for *every* child under a parent, not only the
/// current pick — needed to recompute the extremum after a removal or a
/// mutable-property change (§4.7.4).
struct ChildState {
    immutable_props: Props,
    mutable_values: HashMap<PropName, Value>,
    comparison_value: Option<f64>,
}

impl ChildState {
    fn composed(&self) -> Props {
        let mut props = self.immutable_props.clone();
        for (name, value) in &self.mutable_values {
            props.insert(name.to_string(), value.clone());
        }
        props
    }
}

#[derive(Default)]
struct ParentState {
    /// Insertion order, so a tie is broken in favor of the first-inserted
    /// child (§4.7.4 "Ties: first-inserted child wins").
    children: IndexMap<Key, ChildState>,
    pick: Option<Key>,
}

impl ParentState {
    fn beats(kind: MinMaxKind, challenger: Option<f64>, incumbent: Option<f64>) -> bool {
        match (challenger, incumbent) {
            (Some(c), Some(i)) => match kind {
                MinMaxKind::Min => c < i,
                MinMaxKind::Max => c > i,
            },
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Rescans every child to find the current extremum, keeping the
    /// first-inserted child among ties.
    fn recompute_pick(&mut self, kind: MinMaxKind) {
        let mut best: Option<(&Key, Option<f64>)> = None;
        for (key, child) in &self.children {
            match &best {
                None => best = Some((key, child.comparison_value)),
                Some((_, best_value)) => {
                    if Self::beats(kind, child.comparison_value, *best_value) {
                        best = Some((key, child.comparison_value));
                    }
                }
            }
        }
        self.pick = best.map(|(key, _)| key.clone());
    }

    fn pick_composed(&self) -> Aggregate<Props> {
        match &self.pick {
            Some(key) => Aggregate::Present(self.children[key].composed()),
            None => Aggregate::Absent,
        }
    }
}

pub struct PickByMinMaxStep {
    upstream: Arc<dyn Step>,
    child_seg_path: SegPath,
    comparison_property: PropName,
    property_name: PropName,
    kind: MinMaxKind,
    /// Every mutable property of the child level — not just the comparison
    /// property — so the composed row handed out when a pick changes always
    /// reflects the child's latest mutable state (§4.7.4).
    mutable_properties: Vec<PropName>,

    parents: Mutex<HashMap<KeyPathHash, ParentState>>,
    modified_sinks: Mutex<SinkList>,
}

impl PickByMinMaxStep {
    pub fn new(
        upstream: Arc<dyn Step>,
        child_seg_path: SegPath,
        comparison_property: impl Into<PropName>,
        property_name: impl Into<PropName>,
        kind: MinMaxKind,
    ) -> Arc<Self> {
        let comparison_property = comparison_property.into();
        let mutable_properties: Vec<PropName> = upstream
            .type_descriptor()
            .at_path(child_seg_path.as_slice())
            .map(|t| t.mutable_properties.iter().cloned().collect())
            .unwrap_or_default();

        let step = Arc::new(Self {
            upstream: upstream.clone(),
            child_seg_path: child_seg_path.clone(),
            comparison_property: comparison_property.clone(),
            property_name: property_name.into(),
            kind,
            mutable_properties: mutable_properties.clone(),
            parents: Mutex::new(HashMap::new()),
            modified_sinks: Mutex::new(SinkList::new()),
        });

        upstream.subscribe_added(child_seg_path.clone(), step.clone());
        upstream.subscribe_removed(child_seg_path.clone(), step.clone());
        // `mutable_properties` already enumerates every mutable child
        // property the descriptor knows about, so this covers the
        // comparison property too whenever it's itself mutable (§4.7).
        for prop in &mutable_properties {
            upstream.subscribe_modified(child_seg_path.clone(), prop.clone(), step.clone());
        }

        step
    }

    fn emit(&self, key_path: &KeyPath, old: Aggregate<Props>, new: Aggregate<Props>) {
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

impl Step for PickByMinMaxStep {
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

impl EventSink for PickByMinMaxStep {
    fn on_added(&self, _seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) {
        let parent_hash = key_path.hash_id();
        let comparison_value = as_numeric(props.get(&*self.comparison_property).unwrap_or(&Value::Null));
        let mutable_values = self
            .mutable_properties
            .iter()
            .filter_map(|p| props.get(&**p).map(|v| (p.clone(), v.clone())))
            .collect();

        let mut parents = self.parents.lock();
        let parent = parents.entry(parent_hash).or_default();
        let old = parent.pick_composed();

        parent.children.insert(
            key.clone(),
            ChildState {
                immutable_props: props.clone(),
                mutable_values,
                comparison_value,
            },
        );

        let becomes_pick = match &parent.pick {
            None => true,
            Some(current) => {
                let incumbent = parent.children[current].comparison_value;
                ParentState::beats(self.kind, comparison_value, incumbent)
            }
        };
        if becomes_pick {
            parent.pick = Some(key.clone());
        }
        let new = parent.pick_composed();
        drop(parents);

        if becomes_pick {
            self.emit(key_path, old, new);
        }
    }

    fn on_removed(&self, _seg: &SegPath, key_path: &KeyPath, key: &Key, _props: &Props) {
        let parent_hash = key_path.hash_id();
        let mut parents = self.parents.lock();
        let Some(parent) = parents.get_mut(&parent_hash) else {
            flowtree_log::warn_once!("pick_by_min_max: removed for untracked parent");
            return;
        };

        let was_pick = parent.pick.as_ref() == Some(key);
        let old = parent.pick_composed();
        parent.children.shift_remove(key);

        if !was_pick {
            drop(parents);
            return;
        }

        if parent.children.is_empty() {
            parents.remove(&parent_hash);
            drop(parents);
            self.emit(key_path, old, Aggregate::Absent);
            return;
        }

        parent.recompute_pick(self.kind);
        let new = parent.pick_composed();
        drop(parents);
        self.emit(key_path, old, new);
    }

    fn on_modified(&self, _seg: &SegPath, property: &PropName, key_path: &KeyPath, key: &Key, _old: &Value, new: &Value) {
        let parent_hash = key_path.hash_id();
        let mut parents = self.parents.lock();
        let Some(parent) = parents.get_mut(&parent_hash) else {
            flowtree_log::warn_once!("pick_by_min_max: modified({property:?}) for untracked parent");
            return;
        };
        if !parent.children.contains_key(key) {
            flowtree_log::warn_once!("pick_by_min_max: modified({property:?}) for untracked child");
            return;
        }

        let is_comparison = *property == self.comparison_property;
        let was_pick = parent.pick.as_ref() == Some(key);

        // The cache update is unconditional (§4.7.4): every child's mutable
        // values must stay current even when it isn't the pick right now, so
        // that whenever it later *becomes* the pick, `pick_composed` doesn't
        // hand out stale mutable props.
        let old = parent.pick_composed();
        let child = parent.children.get_mut(key).expect("checked above");
        if is_comparison {
            child.comparison_value = as_numeric(new);
        } else {
            child.mutable_values.insert(property.clone(), new.clone());
        }

        if !is_comparison && !was_pick {
            // Neither the ranking nor the currently-emitted row is affected.
            drop(parents);
            return;
        }

        if is_comparison {
            parent.recompute_pick(self.kind);
        }
        let new = parent.pick_composed();
        drop(parents);

        if old != new {
            self.emit(key_path, old, new);
        }
    }
}
