//! `DropPropertyStep` (§4.5): pure renaming at the event level. No state.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::descriptor::TypeDescriptor;
use crate::event::{notify_added, notify_modified, notify_removed, EventSink, SinkList, Step};
use crate::path::{Key, KeyPath, PropName, SegPath};
use crate::value::{Props, Value};

pub struct DropPropertyStep {
    upstream: Arc<dyn Step>,
    scope_path: SegPath,
    property_name: PropName,

    scope_added: Mutex<SinkList>,
    scope_removed: Mutex<SinkList>,
}

impl DropPropertyStep {
    pub fn new(upstream: Arc<dyn Step>, scope_path: SegPath, property_name: impl Into<PropName>) -> Arc<Self> {
        let step = Arc::new(Self {
            upstream: upstream.clone(),
            scope_path: scope_path.clone(),
            property_name: property_name.into(),
            scope_added: Mutex::new(SinkList::new()),
            scope_removed: Mutex::new(SinkList::new()),
        });

        upstream.subscribe_added(scope_path.clone(), step.clone());
        upstream.subscribe_removed(scope_path.clone(), step.clone());

        step
    }
}

impl Step for DropPropertyStep {
    fn type_descriptor(&self) -> TypeDescriptor {
        let mut ty = self.upstream.type_descriptor();
        if let Some(level) = ty.at_path_mut(self.scope_path.as_slice()) {
            level.unmark_mutable(&self.property_name);
            level.arrays.retain(|a| a.name != self.property_name);
            level.objects.retain(|o| o.name != self.property_name);
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
        // Every event we forward at `scope_path` already has the property
        // stripped before it reaches the caller (see `on_*` below), so a
        // downstream subscription for the dropped property itself would
        // simply never fire; everything else passes straight through.
        self.upstream.subscribe_modified(seg, property, sink);
    }
}

impl EventSink for DropPropertyStep {
    fn on_added(&self, seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) {
        let mut out = props.clone();
        out.remove(&*self.property_name);
        notify_added(&self.scope_added.lock(), seg, key_path, key, &out);
    }

    fn on_removed(&self, seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) {
        let mut out = props.clone();
        out.remove(&*self.property_name);
        notify_removed(&self.scope_removed.lock(), seg, key_path, key, &out);
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
        // We never subscribe upstream for modifications of the dropped
        // property itself (nothing asks us to), so anything reaching us
        // here is a pass-through property and is forwarded untouched. This
        // exists only so `DropPropertyStep` satisfies `EventSink`; the
        // registration for it was made directly against `self.upstream` by
        // `subscribe_modified` above, so this path is unreachable for props
        // we manage but kept symmetric with the other transparent steps.
        let _ = (seg, property, key_path, key, old, new);
        unreachable!("drop_property never subscribes upstream for modified events itself")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputStep;

    #[derive(Default)]
    struct Capture {
        added: Mutex<Vec<Props>>,
        removed: Mutex<Vec<Props>>,
    }

    impl EventSink for Capture {
        fn on_added(&self, _: &SegPath, _: &KeyPath, _: &Key, props: &Props) {
            self.added.lock().push(props.clone());
        }
        fn on_removed(&self, _: &SegPath, _: &KeyPath, _: &Key, props: &Props) {
            self.removed.lock().push(props.clone());
        }
        fn on_modified(&self, _: &SegPath, _: &PropName, _: &KeyPath, _: &Key, _: &Value, _: &Value) {}
    }

    #[test]
    fn dropped_property_is_absent_from_added_and_removed_events() {
        let input = InputStep::new();
        let step = DropPropertyStep::new(input.clone(), SegPath::root(), "secret");

        let capture = Arc::new(Capture::default());
        step.subscribe_added(SegPath::root(), capture.clone());
        step.subscribe_removed(SegPath::root(), capture.clone());

        let props: Props = [("name".to_string(), Value::String("a".into())), ("secret".to_string(), Value::from(42))]
            .into_iter()
            .collect();
        input.add(&"a".into(), &props);
        input.remove(&"a".into(), &props);

        assert!(!capture.added.lock()[0].contains_key("secret"));
        assert!(capture.added.lock()[0].contains_key("name"));
        assert!(!capture.removed.lock()[0].contains_key("secret"));
    }

    /// An upstream whose descriptor declares `secret` mutable, so dropping it
    /// can be checked to also unmark it.
    struct FixedUpstream(Arc<InputStep>, TypeDescriptor);

    impl Step for FixedUpstream {
        fn type_descriptor(&self) -> TypeDescriptor {
            self.1.clone()
        }
        fn subscribe_added(&self, seg: SegPath, sink: Arc<dyn EventSink>) {
            self.0.subscribe_added(seg, sink);
        }
        fn subscribe_removed(&self, seg: SegPath, sink: Arc<dyn EventSink>) {
            self.0.subscribe_removed(seg, sink);
        }
        fn subscribe_modified(&self, seg: SegPath, property: PropName, sink: Arc<dyn EventSink>) {
            self.0.subscribe_modified(seg, property, sink);
        }
    }

    #[test]
    fn dropped_property_is_unmarked_in_the_type_descriptor() {
        let input = InputStep::new();
        let mut ty = TypeDescriptor::default();
        ty.mark_mutable("secret");
        let fixed: Arc<dyn Step> = Arc::new(FixedUpstream(input, ty));

        let step = DropPropertyStep::new(fixed, SegPath::root(), "secret");
        assert!(!step.type_descriptor().is_mutable("secret"));
    }
}
