//! The step base contract (§4.2): the subscription API every step satisfies,
//! and the [`EventSink`] trait a step implements so that *its* upstream can
//! deliver events to it.
//!
//! Steps are single-threaded and synchronous: handling an event may invoke
//! downstream handlers inline; nothing here enqueues, batches, or reorders
//! events (batching happens only at the output binder, see [`crate::batch`]).

use std::sync::Arc;

use crate::descriptor::TypeDescriptor;
use crate::path::{Key, KeyPath, PropName, SegPath};
use crate::value::{Props, Value};

/// Receives events forwarded by an upstream [`Step`].
///
/// Every concrete step implements this on itself so it can hand `Arc<Self>`
/// (coerced to `Arc<dyn EventSink>`) to its upstream at construction time.
/// The output binder (§4.8) and the pipeline's root input step are the two
/// other implementors: the binder is a pure sink, the root step is a pure
/// source.
pub trait EventSink: Send + Sync {
    fn on_added(&self, seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props);

    fn on_removed(&self, seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props);

    #[allow(clippy::too_many_arguments)]
    fn on_modified(
        &self,
        seg: &SegPath,
        property: &PropName,
        key_path: &KeyPath,
        key: &Key,
        old: &Value,
        new: &Value,
    );
}

/// Every step exposes the three subscription operations plus its output
/// descriptor. A step holds a reference to exactly one upstream step; the
/// builder enforces that graphs are acyclic by construction (§9), so there is
/// no cycle detection here.
///
/// Subscription is one-shot per segment path: concrete steps register with
/// upstream at construction time and multiplex downstream handlers
/// internally (§4.2). Any `(seg[, property])` combination a step doesn't
/// itself intercept is forwarded untouched to its own upstream — see the
/// "Transparent pass-through" design note (§9) and invariant §3.4.
pub trait Step: Send + Sync {
    /// Pure and idempotent: must return identical trees across calls
    /// (testable property #7).
    fn type_descriptor(&self) -> TypeDescriptor;

    fn subscribe_added(&self, seg: SegPath, sink: Arc<dyn EventSink>);

    fn subscribe_removed(&self, seg: SegPath, sink: Arc<dyn EventSink>);

    fn subscribe_modified(&self, seg: SegPath, property: PropName, sink: Arc<dyn EventSink>);
}

/// A list of sinks registered for one exact `(SegPath[, property])` key,
/// multiplexed so more than one downstream consumer (a further step, or the
/// output binder) can subscribe to the same produced path.
pub(crate) type SinkList = smallvec::SmallVec<[Arc<dyn EventSink>; 1]>;

pub(crate) fn notify_added(sinks: &SinkList, seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) {
    for sink in sinks {
        sink.on_added(seg, key_path, key, props);
    }
}

pub(crate) fn notify_removed(sinks: &SinkList, seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) {
    for sink in sinks {
        sink.on_removed(seg, key_path, key, props);
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn notify_modified(
    sinks: &SinkList,
    seg: &SegPath,
    property: &PropName,
    key_path: &KeyPath,
    key: &Key,
    old: &Value,
    new: &Value,
) {
    for sink in sinks {
        sink.on_modified(seg, property, key_path, key, old, new);
    }
}
