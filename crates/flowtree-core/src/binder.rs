//! The output binder (§4.8): subscribes to the *last* step at every path the
//! final [`TypeDescriptor`] exposes, translating its events into operations
//! on the [`BatchedStateUpdater`].

use std::sync::Arc;

use crate::batch::{BatchedStateUpdater, Operation};
use crate::descriptor::TypeDescriptor;
use crate::event::EventSink;
use crate::path::{Key, KeyPath, PropName, SegPath};
use crate::value::{Props, Value};
use crate::Step;

pub struct OutputBinder {
    updater: Arc<BatchedStateUpdater>,
}

impl OutputBinder {
    /// Walks `last_step`'s descriptor and registers itself for every
    /// `added`/`removed` at every exposed segment path, plus `modified` for
    /// every property that path's descriptor marks mutable.
    pub fn new(last_step: Arc<dyn Step>, updater: Arc<BatchedStateUpdater>) -> Arc<Self> {
        let binder = Arc::new(Self { updater });
        let descriptor = last_step.type_descriptor();
        binder.subscribe_tree(&last_step, &SegPath::root(), &descriptor);
        binder
    }

    fn subscribe_tree(self: &Arc<Self>, step: &Arc<dyn Step>, seg: &SegPath, ty: &TypeDescriptor) {
        step.subscribe_added(seg.clone(), self.clone());
        step.subscribe_removed(seg.clone(), self.clone());
        for property in &ty.mutable_properties {
            step.subscribe_modified(seg.clone(), property.clone(), self.clone());
        }
        for array in &ty.arrays {
            self.subscribe_tree(step, &seg.child(array.name.clone()), &array.ty);
        }
    }
}

impl EventSink for OutputBinder {
    fn on_added(&self, seg: &SegPath, key_path: &KeyPath, key: &Key, props: &Props) {
        self.updater.enqueue(Operation::Added {
            seg: seg.clone(),
            key_path: key_path.clone(),
            key: key.clone(),
            props: props.clone(),
        });
    }

    fn on_removed(&self, seg: &SegPath, key_path: &KeyPath, key: &Key, _props: &Props) {
        self.updater.enqueue(Operation::Removed {
            seg: seg.clone(),
            key_path: key_path.clone(),
            key: key.clone(),
        });
    }

    fn on_modified(&self, seg: &SegPath, property: &PropName, key_path: &KeyPath, key: &Key, _old: &Value, new: &Value) {
        self.updater.enqueue(Operation::Modified {
            seg: seg.clone(),
            property: property.clone(),
            key_path: key_path.clone(),
            key: key.clone(),
            new: new.clone(),
        });
    }
}
