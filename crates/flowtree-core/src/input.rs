//! The implicit root "input step": emits a single `added` at the root
//! segment path per record the caller adds, and the matching `removed`.
//!
//! This is the one piece of the step graph that is a pure *source* rather
//! than a subscriber — it has no upstream of its own.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::descriptor::TypeDescriptor;
use crate::event::{notify_added, notify_removed, EventSink, SinkList, Step};
use crate::path::{Key, KeyPath, PropName, SegPath};
use crate::value::Props;

/// The pipeline's entry point. [`crate::pipeline::Pipeline::add`] and
/// [`crate::pipeline::Pipeline::remove`] (§6) funnel straight into this.
#[derive(Default)]
pub struct InputStep {
    added: Mutex<SinkList>,
    removed: Mutex<SinkList>,
}

impl InputStep {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inject a row at the root segment path (§6 `add`).
    pub fn add(&self, key: &Key, props: &Props) {
        let root = SegPath::root();
        let key_path = KeyPath::root();
        notify_added(&self.added.lock(), &root, &key_path, key, props);
    }

    /// Announce the disappearance of a row at the root segment path (§6
    /// `remove`). `props` must match what was originally added: aggregates
    /// read values out of it when subtracting.
    pub fn remove(&self, key: &Key, props: &Props) {
        let root = SegPath::root();
        let key_path = KeyPath::root();
        notify_removed(&self.removed.lock(), &root, &key_path, key, props);
    }
}

impl Step for InputStep {
    fn type_descriptor(&self) -> TypeDescriptor {
        TypeDescriptor::default()
    }

    fn subscribe_added(&self, seg: SegPath, sink: Arc<dyn EventSink>) {
        debug_assert!(seg.is_root(), "input step only emits at the root segment path");
        self.added.lock().push(sink);
    }

    fn subscribe_removed(&self, seg: SegPath, sink: Arc<dyn EventSink>) {
        debug_assert!(seg.is_root(), "input step only emits at the root segment path");
        self.removed.lock().push(sink);
    }

    fn subscribe_modified(&self, _seg: SegPath, _property: PropName, _sink: Arc<dyn EventSink>) {
        // The root never re-emits an item with changed base values (§3
        // "Immutable properties": changes arrive as modified events on named
        // properties from a `define_property` step, never from raw input).
    }
}
