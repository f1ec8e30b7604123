//! `DefinePropertyStep` (§4.4): synthesizes a new property at a scope level
//! by calling a pure `compute` function over the composed item view.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::descriptor::TypeDescriptor;
use crate::event::{notify_added, notify_modified, notify_removed, EventSink, SinkList, Step};
use crate::path::{Key, KeyPath, KeyPathHash, PropName, SegPath};
use crate::value::{Props, Value};

type ComputeFn = dyn Fn(&Props) -> Value + Send + Sync;

struct RowState {
    /// Base props as last seen from upstream (excludes our own synthesized property).
    props: Props,
    /// Cached current value of each declared mutable dependency.
    ///
    /// Resolves the open question in §9: we cache at `added`-time straight
    /// out of the `added` payload, rather than treating the value as absent
    /// until the first `modified` arrives. See `DESIGN.md`.
    mutable_values: HashMap<PropName, Value>,
    /// Last value `compute` produced for this row.
    value: Value,
}

pub struct DefinePropertyStep {
    upstream: Arc<dyn Step>,
    scope_path: SegPath,
    property_name: PropName,
    compute: Box<ComputeFn>,
    mutable_dependencies: Vec<PropName>,

    rows: Mutex<HashMap<(KeyPathHash, Key), RowState>>,
    scope_added: Mutex<SinkList>,
    scope_removed: Mutex<SinkList>,
    modified_sinks: Mutex<SinkList>,
}

impl DefinePropertyStep {
    pub fn new(
        upstream: Arc<dyn Step>,
        scope_path: SegPath,
        property_name: impl Into<PropName>,
        compute: impl Fn(&Props) -> Value + Send + Sync + 'static,
        mutable_dependencies: Vec<PropName>,
    ) -> Arc<Self> {
        let step = Arc::new(Self {
            upstream: upstream.clone(),
            scope_path: scope_path.clone(),
            property_name: property_name.into(),
            compute: Box::new(compute),
            mutable_dependencies: mutable_dependencies.clone(),
            rows: Mutex::new(HashMap::new()),
            scope_added: Mutex::new(SinkList::new()),
            scope_removed: Mutex::new(SinkList::new()),
            modified_sinks: Mutex::new(SinkList::new()),
        });

        upstream.subscribe_added(scope_path.clone(), step.clone());
        upstream.subscribe_removed(scope_path.clone(), step.clone());
        for dep in &mutable_dependencies {
            upstream.subscribe_modified(scope_path.clone(), dep.clone(), step.clone());
        }

        step
    }

    fn compose_view(props: &Props, mutable_values: &HashMap<PropName, Value>) -> Props {
        let mut view = props.clone();
        for (name, value) in mutable_values {
            view.insert(name.to_string(), value.clone());
        }
        view
    }
}

impl Step for DefinePropertyStep {
    fn type_descriptor(&self) -> TypeDescriptor {
        let mut ty = self.upstream.type_descriptor();
        if !self.mutable_dependencies.is_empty() {
            if let Some(level) = ty.at_path_mut(self.scope_path.as_slice()) {
                level.mark_mutable(self.property_name.clone());
            }
        }
        ty
    }

    fn subscribe_added(&self, seg: SegPath, sink: Arc<dyn EventSink>) {
        if seg == self.scope_path {
            self.scope_added.lock().push(sink);
        } else {
            self.upstream.subscribe_added(seg, sink);
        }
    }

    fn subscribe_removed(&self, seg: SegPath, sink: Arc<dyn EventSink>) {
        if seg == self.scope_path {
            self.scope_removed.lock().push(sink);
        } else {
            self.upstream.subscribe_removed(seg, sink);
        }
    }

    fn subscribe_modified(&self, seg: SegPath, property: PropName, sink: Arc<dyn EventSink>) {
        if seg == self.scope_path && property == self.property_name {
            self.modified_sinks.lock().push(sink);
        } else {
            self.upstream.subscribe_modified(seg, property, sink);
        }
    }
}

impl EventSink for DefinePropertyStep {
    fn on_added(&self, seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) {
        let mut mutable_values = HashMap::new();
        for dep in &self.mutable_dependencies {
            if let Some(value) = props.get(&**dep) {
                mutable_values.insert(dep.clone(), value.clone());
            }
        }

        let view = Self::compose_view(props, &mutable_values);
        let value = (self.compute)(&view);

        self.rows.lock().insert(
            (key_path.hash_id(), key.clone()),
            RowState {
                props: props.clone(),
                mutable_values,
                value: value.clone(),
            },
        );

        let mut out_props = props.clone();
        out_props.insert(self.property_name.to_string(), value);
        notify_added(&self.scope_added.lock(), seg, key_path, key, &out_props);
    }

    fn on_removed(&self, seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) {
        let state = self.rows.lock().remove(&(key_path.hash_id(), key.clone()));

        let mut out_props = props.clone();
        if let Some(state) = state {
            out_props.insert(self.property_name.to_string(), state.value);
        }
        notify_removed(&self.scope_removed.lock(), seg, key_path, key, &out_props);
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
        let mut rows = self.rows.lock();
        let Some(state) = rows.get_mut(&(key_path.hash_id(), key.clone())) else {
            flowtree_log::warn_once!(
                "define_property: modified({property:?}) for untracked row at {seg:?}"
            );
            return;
        };

        state.mutable_values.insert(property.clone(), new.clone());
        let view = Self::compose_view(&state.props, &state.mutable_values);
        let new_value = (self.compute)(&view);

        if new_value == state.value {
            // Silent no-op: de-duplication within define_property (§7).
            return;
        }

        let old_value = std::mem::replace(&mut state.value, new_value.clone());
        drop(rows);

        notify_modified(
            &self.modified_sinks.lock(),
            seg,
            &self.property_name,
            key_path,
            key,
            &old_value,
            &new_value,
        );
    }
}
