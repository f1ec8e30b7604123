//! Ties the step graph together behind the two operations §6 describes as
//! the engine's external interface: `add`/`remove` on the way in, and a
//! single `set_state` call on the way out.
//!
//! Building the actual chain of steps (group-by, define-property, ...) is
//! the fluent builder's job (§6, out of scope for this crate) — a
//! [`Pipeline`] is handed the already-constructed root [`InputStep`] and the
//! last step in the chain, and wires up the output binder and batched
//! updater around them.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::batch::{BatchedStateUpdater, StateSink};
use crate::binder::OutputBinder;
use crate::input::InputStep;
use crate::path::Key;
use crate::tree::MaterializedTree;
use crate::value::Props;
use crate::Step;

/// Default batch threshold and time slice, chosen to coalesce a burst of
/// adds from a single logical transaction without holding up a quiet
/// pipeline for long.
pub const DEFAULT_BATCH_THRESHOLD: usize = 256;
pub const DEFAULT_TIME_SLICE: Duration = Duration::from_millis(16);

/// A complete, running pipeline: the root input step, the constructed step
/// graph's last step, and the output plumbing (binder + batched updater)
/// that projects its events onto the caller's [`StateSink`].
pub struct Pipeline {
    input: Arc<InputStep>,
    updater: Arc<BatchedStateUpdater>,
    // Kept alive so its subscriptions (held as `Arc<dyn EventSink>` on every
    // step it registered with) stay live for the pipeline's lifetime.
    _binder: Arc<OutputBinder>,
}

impl Pipeline {
    pub fn new(input: Arc<InputStep>, last_step: Arc<dyn Step>, sink: Arc<dyn StateSink>) -> Self {
        Self::with_batch_params(input, last_step, sink, DEFAULT_BATCH_THRESHOLD, DEFAULT_TIME_SLICE)
    }

    pub fn with_batch_params(
        input: Arc<InputStep>,
        last_step: Arc<dyn Step>,
        sink: Arc<dyn StateSink>,
        batch_threshold: usize,
        time_slice: Duration,
    ) -> Self {
        let updater = BatchedStateUpdater::new(sink, batch_threshold, time_slice);
        let binder = OutputBinder::new(last_step, updater.clone());
        Self { input, updater, _binder: binder }
    }

    /// `add(key, props)` (§6): inject a row at the root segment path.
    pub fn add(&self, key: impl Into<Key>, props: Props) {
        self.input.add(&key.into(), &props);
    }

    /// `remove(key, props)` (§6): `props` must match what was originally
    /// added, since aggregates read values out of it when subtracting.
    pub fn remove(&self, key: impl Into<Key>, props: Props) {
        self.input.remove(&key.into(), &props);
    }

    /// Drains any pending batched operations synchronously (§5
    /// `force_flush`), so a caller that reads the materialized tree right
    /// after sees every change applied so far.
    pub fn force_flush(&self) {
        self.updater.flush();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.updater.dispose();
    }
}

/// A minimal [`StateSink`] that just holds the materialized tree behind a
/// mutex. Handy for tests and for callers that don't already have their own
/// outer state container — the real one is an external collaborator (§1)
/// the core only ever talks to through `set_state`.
#[derive(Default)]
pub struct InMemoryStateContainer {
    tree: Mutex<MaterializedTree>,
}

impl InMemoryStateContainer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> MaterializedTree {
        self.tree.lock().clone()
    }
}

impl StateSink for InMemoryStateContainer {
    fn set_state(&self, transform: Box<dyn FnOnce(MaterializedTree) -> MaterializedTree + Send>) {
        let mut tree = self.tree.lock();
        *tree = transform(std::mem::take(&mut *tree));
    }
}
