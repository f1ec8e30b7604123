//! `FilterStep` (§4.6): gates rows (and everything nested under them) on a
//! predicate, re-evaluated whenever a declared dependency changes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::descriptor::TypeDescriptor;
use crate::event::{notify_added, notify_modified, notify_removed, EventSink, SinkList, Step};
use crate::path::{path_starts_with, Key, KeyPath, KeyPathHash, PropName, SegPath};
use crate::value::{Props, Value};

type PredicateFn = dyn Fn(&Props) -> bool + Send + Sync;
type RowKey = (KeyPathHash, Key);
type RowTable = Mutex<HashMap<RowKey, RowState>>;

/// Per-row bookkeeping kept for *every* row seen, not only passing ones —
/// required for correct re-evaluation (§4.6).
struct RowState {
    props: Props,
    passed: bool,
}

struct PendingAdded {
    key_path: KeyPath,
    key: Key,
    props: Props,
}

struct PendingModified {
    property: PropName,
    key_path: KeyPath,
    key: Key,
    old: Value,
    new: Value,
}

/// A deep child already forwarded downstream for a row that currently
/// passes. Kept separately from the pending buffers because it was never
/// re-added or removed upstream — only the materialized tree's cascade
/// removal drops it when the row stops passing — so it must be replayed from
/// here, not from an upstream event that will never arrive again.
struct LiveChild {
    key_path: KeyPath,
    props: Props,
}

fn row_key_for(scope_len: usize, key_path: &KeyPath) -> RowKey {
    let prefix = KeyPath::from_keys(key_path.as_slice()[..scope_len].iter().cloned());
    let row_key = key_path.as_slice()[scope_len].clone();
    (prefix.hash_id(), row_key)
}

/// Gates a single segment path registered strictly below the filter's
/// scope. Holds its own per-row pending buffers (§4.6 "Nested paths below
/// the filter's scope") plus the downstream sinks registered for that path.
#[derive(Default)]
struct DeepGate {
    added_sinks: Mutex<SinkList>,
    removed_sinks: Mutex<SinkList>,
    modified_sinks: Mutex<HashMap<PropName, SinkList>>,
    pending_added: Mutex<HashMap<RowKey, VecDeque<PendingAdded>>>,
    pending_modified: Mutex<HashMap<RowKey, VecDeque<PendingModified>>>,
    /// Children currently forwarded downstream for a row, in insertion
    /// order. A row's `(true, false)` transition does not clear this —
    /// the children still exist upstream, only the materialized tree's
    /// cascade removal dropped them — so the next `(false, true)`
    /// transition replays from here instead of waiting on an upstream event
    /// that will never come.
    live: Mutex<HashMap<RowKey, IndexMap<Key, LiveChild>>>,
}

impl DeepGate {
    /// Replays a row's state for a `(false, true)` transition: first
    /// whatever was already live before the row last stopped passing (never
    /// re-added upstream, so there is no other event that will reproduce
    /// it), then anything buffered while the row was failing — adds before
    /// modifications, since adds always precede modifications for the same
    /// key (invariant §3.1), so this ordering can't reorder anything
    /// meaningful.
    fn flush(&self, seg: &SegPath, row_key: &RowKey) {
        if let Some(children) = self.live.lock().get(row_key) {
            let sinks = self.added_sinks.lock();
            for (key, child) in children {
                notify_added(&sinks, seg, &child.key_path, key, &child.props);
            }
        }

        let added = self.pending_added.lock().remove(row_key);
        if let Some(queue) = added {
            let sinks = self.added_sinks.lock();
            let mut live = self.live.lock();
            let entry = live.entry(row_key.clone()).or_default();
            for item in queue {
                notify_added(&sinks, seg, &item.key_path, &item.key, &item.props);
                entry.insert(item.key.clone(), LiveChild { key_path: item.key_path, props: item.props });
            }
        }

        let modified = self.pending_modified.lock().remove(row_key);
        if let Some(queue) = modified {
            for item in queue {
                let sinks = self.modified_sinks.lock();
                if let Some(list) = sinks.get(&item.property) {
                    notify_modified(list, seg, &item.property, &item.key_path, &item.key, &item.old, &item.new);
                }
                drop(sinks);
                if let Some(children) = self.live.lock().get_mut(row_key) {
                    if let Some(child) = children.get_mut(&item.key) {
                        child.props.insert(item.property.to_string(), item.new.clone());
                    }
                }
            }
        }
    }

    fn drop_row(&self, row_key: &RowKey) {
        self.pending_added.lock().remove(row_key);
        self.pending_modified.lock().remove(row_key);
        self.live.lock().remove(row_key);
    }

    /// Drops a single child's state without disturbing its row's other
    /// deep children (used when that one child is genuinely removed
    /// upstream while its row isn't passing, as opposed to the whole row
    /// going away).
    fn drop_child(&self, row_key: &RowKey, key: &Key) {
        if let Some(queue) = self.pending_added.lock().get_mut(row_key) {
            queue.retain(|item| &item.key != key);
        }
        if let Some(queue) = self.pending_modified.lock().get_mut(row_key) {
            queue.retain(|item| &item.key != key);
        }
        if let Some(children) = self.live.lock().get_mut(row_key) {
            children.shift_remove(key);
        }
    }
}

/// Forwards upstream events for one deep segment path into a [`DeepGate`],
/// consulting `rows` (shared with the owning [`FilterStep`]) to decide
/// whether to forward immediately or queue.
struct DeepRelay {
    scope_len: usize,
    rows: Arc<RowTable>,
    gate: Arc<DeepGate>,
}

impl EventSink for DeepRelay {
    fn on_added(&self, seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) {
        let row_key = row_key_for(self.scope_len, key_path);
        let passed = self.rows.lock().get(&row_key).is_some_and(|s| s.passed);
        if passed {
            notify_added(&self.gate.added_sinks.lock(), seg, key_path, key, props);
            self.gate.live.lock().entry(row_key).or_default().insert(
                key.clone(),
                LiveChild {
                    key_path: key_path.clone(),
                    props: props.clone(),
                },
            );
        } else {
            self.gate.pending_added.lock().entry(row_key).or_default().push_back(PendingAdded {
                key_path: key_path.clone(),
                key: key.clone(),
                props: props.clone(),
            });
        }
    }

    fn on_removed(&self, seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) {
        let row_key = row_key_for(self.scope_len, key_path);
        let passed = self.rows.lock().get(&row_key).is_some_and(|s| s.passed);
        if passed {
            notify_removed(&self.gate.removed_sinks.lock(), seg, key_path, key, props);
            if let Some(children) = self.gate.live.lock().get_mut(&row_key) {
                children.shift_remove(key);
            }
        } else {
            // Removes for a child whose row never passed upstream may be
            // dropped (§4.6): there is nothing downstream to remove, and any
            // queued or live state for it is now moot. Only this child's
            // state goes, not its row's other deep children.
            self.gate.drop_child(&row_key, key);
        }
    }

    fn on_modified(
        &self,
        seg: &SegPath,
        property: &PropName,
        key_path: &KeyPath,
        key: &Key,
        old: &Value,
        new: &Value,
    ) {
        let row_key = row_key_for(self.scope_len, key_path);
        let passed = self.rows.lock().get(&row_key).is_some_and(|s| s.passed);

        // Keep a live child's cached props current regardless of whether
        // its row is passing right now, so a later `(false, true)` replay
        // (driven entirely from `live`, with no upstream event of its own)
        // hands out the latest value instead of what was true when the row
        // last stopped passing.
        let was_live = match self.gate.live.lock().get_mut(&row_key) {
            Some(children) => match children.get_mut(key) {
                Some(child) => {
                    child.props.insert(property.to_string(), new.clone());
                    true
                }
                None => false,
            },
            None => false,
        };

        if passed {
            let sinks = self.gate.modified_sinks.lock();
            if let Some(list) = sinks.get(property) {
                notify_modified(list, seg, property, key_path, key, old, new);
            }
        } else if !was_live {
            self.gate.pending_modified.lock().entry(row_key).or_default().push_back(PendingModified {
                property: property.clone(),
                key_path: key_path.clone(),
                key: key.clone(),
                old: old.clone(),
                new: new.clone(),
            });
        }
    }
}

pub struct FilterStep {
    upstream: Arc<dyn Step>,
    scope_path: SegPath,
    predicate: Box<PredicateFn>,
    mutable_dependencies: Vec<PropName>,

    rows: Arc<RowTable>,
    scope_added: Mutex<SinkList>,
    scope_removed: Mutex<SinkList>,
    scope_modified: Mutex<HashMap<PropName, SinkList>>,
    /// One entry per distinct segment path strictly below `scope_path` that
    /// some downstream consumer has subscribed to.
    deep: Mutex<HashMap<SegPath, (Arc<DeepGate>, Arc<DeepRelay>)>>,
}

impl FilterStep {
    pub fn new(
        upstream: Arc<dyn Step>,
        scope_path: SegPath,
        predicate: impl Fn(&Props) -> bool + Send + Sync + 'static,
        mutable_dependencies: Vec<PropName>,
    ) -> Arc<Self> {
        let step = Arc::new(Self {
            upstream: upstream.clone(),
            scope_path: scope_path.clone(),
            predicate: Box::new(predicate),
            mutable_dependencies: mutable_dependencies.clone(),
            rows: Arc::new(Mutex::new(HashMap::new())),
            scope_added: Mutex::new(SinkList::new()),
            scope_removed: Mutex::new(SinkList::new()),
            scope_modified: Mutex::new(HashMap::new()),
            deep: Mutex::new(HashMap::new()),
        });

        upstream.subscribe_added(scope_path.clone(), step.clone());
        upstream.subscribe_removed(scope_path.clone(), step.clone());
        for dep in &mutable_dependencies {
            upstream.subscribe_modified(scope_path.clone(), dep.clone(), step.clone());
        }

        step
    }

    /// Returns the (possibly freshly subscribed) gate + relay for a segment
    /// path strictly below `scope_path`, subscribing upstream for
    /// added/removed the first time that exact path is requested.
    fn deep_gate_for(&self, seg: &SegPath) -> (Arc<DeepGate>, Arc<DeepRelay>) {
        let mut deep = self.deep.lock();
        if let Some(entry) = deep.get(seg) {
            return entry.clone();
        }
        let gate = Arc::new(DeepGate::default());
        let relay = Arc::new(DeepRelay {
            scope_len: self.scope_path.len(),
            rows: self.rows.clone(),
            gate: gate.clone(),
        });
        deep.insert(seg.clone(), (gate.clone(), relay.clone()));
        drop(deep);

        self.upstream.subscribe_added(seg.clone(), relay.clone());
        self.upstream.subscribe_removed(seg.clone(), relay.clone());
        (gate, relay)
    }

    fn flush_deep_gates(&self, row_key: &RowKey) {
        for (seg, (gate, _)) in self.deep.lock().iter() {
            gate.flush(seg, row_key);
        }
    }

    fn drop_deep_rows(&self, row_key: &RowKey) {
        for (gate, _) in self.deep.lock().values() {
            gate.drop_row(row_key);
        }
    }
}

impl Step for FilterStep {
    fn type_descriptor(&self) -> TypeDescriptor {
        self.upstream.type_descriptor()
    }

    fn subscribe_added(&self, seg: SegPath, sink: Arc<dyn EventSink>) {
        if seg == self.scope_path {
            self.scope_added.lock().push(sink);
        } else if path_starts_with(&seg, &self.scope_path) {
            self.deep_gate_for(&seg).0.added_sinks.lock().push(sink);
        } else {
            self.upstream.subscribe_added(seg, sink);
        }
    }

    fn subscribe_removed(&self, seg: SegPath, sink: Arc<dyn EventSink>) {
        if seg == self.scope_path {
            self.scope_removed.lock().push(sink);
        } else if path_starts_with(&seg, &self.scope_path) {
            self.deep_gate_for(&seg).0.removed_sinks.lock().push(sink);
        } else {
            self.upstream.subscribe_removed(seg, sink);
        }
    }

    fn subscribe_modified(&self, seg: SegPath, property: PropName, sink: Arc<dyn EventSink>) {
        if seg == self.scope_path {
            self.scope_modified.lock().entry(property).or_default().push(sink);
        } else if path_starts_with(&seg, &self.scope_path) {
            let (gate, relay) = self.deep_gate_for(&seg);
            let first_for_property = !gate.modified_sinks.lock().contains_key(&property);
            gate.modified_sinks.lock().entry(property.clone()).or_default().push(sink);
            if first_for_property {
                self.upstream.subscribe_modified(seg, property, relay);
            }
        } else {
            self.upstream.subscribe_modified(seg, property, sink);
        }
    }
}

impl EventSink for FilterStep {
    fn on_added(&self, seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) {
        let passed = (self.predicate)(props);
        self.rows.lock().insert(
            (key_path.hash_id(), key.clone()),
            RowState {
                props: props.clone(),
                passed,
            },
        );
        if passed {
            notify_added(&self.scope_added.lock(), seg, key_path, key, props);
        }
    }

    fn on_removed(&self, seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) {
        let row_key = (key_path.hash_id(), key.clone());
        let state = self.rows.lock().remove(&row_key);
        if state.is_some_and(|s| s.passed) {
            notify_removed(&self.scope_removed.lock(), seg, key_path, key, props);
        }
        self.drop_deep_rows(&row_key);
    }

    fn on_modified(
        &self,
        seg: &SegPath,
        property: &PropName,
        key_path: &KeyPath,
        key: &Key,
        old: &Value,
        new: &Value,
    ) {
        let row_key = (key_path.hash_id(), key.clone());
        let mut rows = self.rows.lock();
        let Some(state) = rows.get_mut(&row_key) else {
            flowtree_log::warn_once!("filter: modified({property:?}) for untracked row at {seg:?}");
            return;
        };

        state.props.insert(property.to_string(), new.clone());
        let was_passing = state.passed;
        let now_passing = (self.predicate)(&state.props);
        state.passed = now_passing;
        let current_props = state.props.clone();
        drop(rows);

        match (was_passing, now_passing) {
            (false, true) => {
                notify_added(&self.scope_added.lock(), seg, key_path, key, &current_props);
                self.flush_deep_gates(&row_key);
            }
            (true, false) => {
                notify_removed(&self.scope_removed.lock(), seg, key_path, key, &current_props);
            }
            (true, true) => {
                let sinks = self.scope_modified.lock();
                if let Some(list) = sinks.get(property) {
                    notify_modified(list, seg, property, key_path, key, old, new);
                }
            }
            (false, false) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal upstream that can emit at the root level and at one fixed
    /// child segment path below it — enough to drive both the scope-level
    /// gating and the deep-gate / pending-buffer machinery without a real
    /// `group_by` in front of it.
    #[derive(Default)]
    struct Upstream {
        root_added: Mutex<SinkList>,
        root_removed: Mutex<SinkList>,
        root_modified: Mutex<HashMap<PropName, SinkList>>,
        child_added: Mutex<SinkList>,
        child_removed: Mutex<SinkList>,
    }

    fn items_seg() -> SegPath {
        SegPath::root().child("items")
    }

    impl Step for Upstream {
        fn type_descriptor(&self) -> TypeDescriptor {
            TypeDescriptor::default()
        }
        fn subscribe_added(&self, seg: SegPath, sink: Arc<dyn EventSink>) {
            if seg == items_seg() {
                self.child_added.lock().push(sink);
            } else {
                self.root_added.lock().push(sink);
            }
        }
        fn subscribe_removed(&self, seg: SegPath, sink: Arc<dyn EventSink>) {
            if seg == items_seg() {
                self.child_removed.lock().push(sink);
            } else {
                self.root_removed.lock().push(sink);
            }
        }
        fn subscribe_modified(&self, _seg: SegPath, property: PropName, sink: Arc<dyn EventSink>) {
            self.root_modified.lock().entry(property).or_default().push(sink);
        }
    }

    impl Upstream {
        fn add_root(&self, key: &Key, props: &Props) {
            notify_added(&self.root_added.lock(), &SegPath::root(), &KeyPath::root(), key, props);
        }
        fn modify_root(&self, key: &Key, property: &str, old: &Value, new: &Value) {
            let sinks = self.root_modified.lock();
            if let Some(list) = sinks.get(property) {
                notify_modified(list, &SegPath::root(), &property.into(), &KeyPath::root(), key, old, new);
            }
        }
        fn add_child(&self, parent_key: &Key, key: &Key, props: &Props) {
            let key_path = KeyPath::root().child(parent_key.clone());
            notify_added(&self.child_added.lock(), &items_seg(), &key_path, key, props);
        }
    }

    #[derive(Default)]
    struct Capture {
        added: Mutex<Vec<(Key, Props)>>,
        removed: Mutex<Vec<Key>>,
    }

    impl EventSink for Capture {
        fn on_added(&self, _: &SegPath, _: &KeyPath, key: &Key, props: &Props) {
            self.added.lock().push((key.clone(), props.clone()));
        }
        fn on_removed(&self, _: &SegPath, _: &KeyPath, key: &Key, _: &Props) {
            self.removed.lock().push(key.clone());
        }
        fn on_modified(&self, _: &SegPath, _: &PropName, _: &KeyPath, _: &Key, _: &Value, _: &Value) {}
    }

    fn active(props: &Props) -> bool {
        props.get("active").and_then(Value::as_bool).unwrap_or(false)
    }

    #[test]
    fn only_passing_rows_reach_downstream() {
        let upstream = Arc::new(Upstream::default());
        let step = FilterStep::new(upstream.clone(), SegPath::root(), active, vec!["active".into()]);

        let capture = Arc::new(Capture::default());
        step.subscribe_added(SegPath::root(), capture.clone());

        upstream.add_root(&"a".into(), &[("active".to_string(), Value::Bool(true))].into_iter().collect());
        upstream.add_root(&"b".into(), &[("active".to_string(), Value::Bool(false))].into_iter().collect());

        let added = capture.added.lock();
        assert_eq!(added.len(), 1);
        assert_eq!(&*added[0].0, "a");
    }

    #[test]
    fn a_child_added_under_a_not_yet_passing_row_is_buffered_then_flushed() {
        let upstream = Arc::new(Upstream::default());
        let step = FilterStep::new(upstream.clone(), SegPath::root(), active, vec!["active".into()]);

        let scope_capture = Arc::new(Capture::default());
        let child_capture = Arc::new(Capture::default());
        step.subscribe_added(SegPath::root(), scope_capture.clone());
        step.subscribe_added(items_seg(), child_capture.clone());

        upstream.add_root(&"a".into(), &[("active".to_string(), Value::Bool(false))].into_iter().collect());
        upstream.add_child(&"a".into(), &"i1".into(), &[("qty".to_string(), Value::from(1))].into_iter().collect());

        assert!(child_capture.added.lock().is_empty(), "child buffered while parent doesn't pass");

        upstream.modify_root(&"a".into(), "active", &Value::Bool(false), &Value::Bool(true));

        assert_eq!(scope_capture.added.lock().len(), 1, "parent now passes");
        assert_eq!(child_capture.added.lock().len(), 1, "buffered child flushed once parent passes");
    }

    #[test]
    fn a_passing_row_that_stops_passing_is_removed_downstream() {
        let upstream = Arc::new(Upstream::default());
        let step = FilterStep::new(upstream.clone(), SegPath::root(), active, vec!["active".into()]);

        let capture = Arc::new(Capture::default());
        step.subscribe_added(SegPath::root(), capture.clone());
        step.subscribe_removed(SegPath::root(), capture.clone());

        upstream.add_root(&"a".into(), &[("active".to_string(), Value::Bool(true))].into_iter().collect());
        upstream.modify_root(&"a".into(), "active", &Value::Bool(true), &Value::Bool(false));

        assert_eq!(capture.added.lock().len(), 1);
        assert_eq!(capture.removed.lock().len(), 1);
    }

    /// A deep child already forwarded downstream before its row stops
    /// passing must be replayed when the row starts passing again, even
    /// though it never received a fresh upstream `added`/`removed` of its
    /// own in between (§4.6; the materialized tree is the only thing that
    /// ever drops it, via cascade removal, not this step).
    #[test]
    fn a_live_deep_child_is_replayed_on_the_second_pass() {
        let upstream = Arc::new(Upstream::default());
        let step = FilterStep::new(upstream.clone(), SegPath::root(), active, vec!["active".into()]);

        let child_capture = Arc::new(Capture::default());
        step.subscribe_added(items_seg(), child_capture.clone());

        upstream.add_root(&"a".into(), &[("active".to_string(), Value::Bool(true))].into_iter().collect());
        upstream.add_child(&"a".into(), &"i1".into(), &[("qty".to_string(), Value::from(1))].into_iter().collect());
        assert_eq!(child_capture.added.lock().len(), 1, "forwarded immediately while the row passes");

        upstream.modify_root(&"a".into(), "active", &Value::Bool(true), &Value::Bool(false));
        upstream.modify_root(&"a".into(), "active", &Value::Bool(false), &Value::Bool(true));

        let added = child_capture.added.lock();
        assert_eq!(added.len(), 2, "i1 is replayed even with no upstream event of its own");
        assert_eq!(&*added[1].0, "i1");
        assert_eq!(added[1].1.get("qty"), Some(&Value::from(1)));
    }
}
