//! The batched state updater (§4.8, §5): orders and coalesces emitted
//! transforms before committing them to the outer state container.
//!
//! A flush is triggered either by the queue reaching [`BatchedStateUpdater`]'s
//! threshold, or by a single time-slice timer elapsing after the most recent
//! enqueue — modeled here the same way `re_analytics`'s native pipeline
//! debounces disk flushes: a dedicated thread blocked on
//! `crossbeam::channel::Receiver::recv_timeout`, reset on every enqueue and
//! woken immediately to shut down on disposal.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError};
use parking_lot::Mutex;

use crate::path::{Key, KeyPath, PropName, SegPath};
use crate::tree::{self, MaterializedTree};
use crate::value::{Props, Value};

/// One entry in the FIFO queue (§4.8 "Operations must be applied in enqueue
/// order"). Each variant owns everything it needs so it can outlive the
/// event that produced it.
#[derive(Clone, Debug)]
pub enum Operation {
    Added { seg: SegPath, key_path: KeyPath, key: Key, props: Props },
    Removed { seg: SegPath, key_path: KeyPath, key: Key },
    Modified { seg: SegPath, property: PropName, key_path: KeyPath, key: Key, new: Value },
}

impl Operation {
    fn apply(&self, tree: &mut MaterializedTree) {
        let outcome = match self {
            Operation::Added { seg, key_path, key, props } => tree::apply_added(tree, seg, key_path, key, props).map(|()| true),
            Operation::Removed { seg, key_path, key } => tree::apply_removed(tree, seg, key_path, key),
            Operation::Modified { seg, property, key_path, key, new } => tree::apply_modified(tree, seg, property, key_path, key, new),
        };
        match outcome {
            Ok(true) => {}
            Ok(false) => flowtree_log::warn!("{self:?}: path references unknown item, skipping"),
            Err(err) => {
                // `added` into a missing parent at a non-root segment path
                // (§7): a contract violation by the step graph, not a
                // recoverable race. Use the chain-aware formatter so a
                // wrapped source (if one is ever added to `TransformError`)
                // doesn't get silently dropped from the panic message.
                panic!("flowtree: contract violation applying {self:?}: {}", flowtree_error::format(&err));
            }
        }
    }
}

/// The outer state container's one entry point (§6 `set_state`): the engine
/// calls this with a pure transform from the current tree to the next.
pub trait StateSink: Send + Sync {
    fn set_state(&self, transform: Box<dyn FnOnce(MaterializedTree) -> MaterializedTree + Send>);
}

enum TimerMsg {
    Reset,
    Shutdown,
}

pub struct BatchedStateUpdater {
    queue: Mutex<VecDeque<Operation>>,
    batch_threshold: usize,
    sink: Arc<dyn StateSink>,
    timer_tx: channel::Sender<TimerMsg>,
    disposed: AtomicBool,
}

impl BatchedStateUpdater {
    /// `batch_threshold`: flush as soon as the queue reaches this many
    /// pending operations. `time_slice`: flush this long after the most
    /// recent enqueue, even if the threshold was never reached.
    pub fn new(sink: Arc<dyn StateSink>, batch_threshold: usize, time_slice: Duration) -> Arc<Self> {
        let (timer_tx, timer_rx) = channel::unbounded();

        let updater = Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            batch_threshold,
            sink,
            timer_tx,
            disposed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&updater);
        std::thread::Builder::new()
            .name("flowtree-batch-timer".into())
            .spawn(move || loop {
                match timer_rx.recv_timeout(time_slice) {
                    Ok(TimerMsg::Reset) => continue,
                    Ok(TimerMsg::Shutdown) => break,
                    Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(updater) = weak.upgrade() else { break };
                        updater.flush();
                    }
                }
            })
            .expect("failed to spawn flowtree batch timer thread");

        updater
    }

    /// Appends an operation to the queue, flushing immediately if that
    /// brings it to the batch threshold, otherwise resetting the debounce
    /// timer (§4.8).
    pub fn enqueue(&self, op: Operation) {
        let should_flush_now = {
            let mut queue = self.queue.lock();
            queue.push_back(op);
            queue.len() >= self.batch_threshold
        };
        if should_flush_now {
            self.flush();
        } else {
            // The timer thread treats a disconnected receiver the same as a
            // dropped send: harmless if disposal raced us here.
            let _ = self.timer_tx.send(TimerMsg::Reset);
        }
    }

    /// Drains the queue synchronously and commits one `set_state` call if
    /// anything was pending (§5 "a `force_flush()` operation drains the
    /// queue synchronously").
    pub fn flush(&self) {
        let ops: Vec<Operation> = {
            let mut queue = self.queue.lock();
            if queue.is_empty() {
                return;
            }
            queue.drain(..).collect()
        };

        self.sink.set_state(Box::new(move |mut tree| {
            for op in &ops {
                op.apply(&mut tree);
            }
            tree
        }));
    }

    /// Cancels the debounce timer and flushes whatever is still pending
    /// (§4.8 "Disposal"). Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flush();
        let _ = self.timer_tx.send(TimerMsg::Shutdown);
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.queue.lock().len()
    }
}

impl Drop for BatchedStateUpdater {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::SegPath;

    struct RecordingSink {
        tree: Mutex<MaterializedTree>,
        applies: Mutex<usize>,
    }

    impl StateSink for RecordingSink {
        fn set_state(&self, transform: Box<dyn FnOnce(MaterializedTree) -> MaterializedTree + Send>) {
            let mut tree = self.tree.lock();
            *tree = transform(std::mem::take(&mut *tree));
            *self.applies.lock() += 1;
        }
    }

    #[test]
    fn threshold_triggers_synchronous_flush() {
        let sink = Arc::new(RecordingSink {
            tree: Mutex::new(MaterializedTree::default()),
            applies: Mutex::new(0),
        });
        let updater = BatchedStateUpdater::new(sink.clone(), 2, Duration::from_secs(30));

        updater.enqueue(Operation::Added {
            seg: SegPath::root(),
            key_path: KeyPath::root(),
            key: "a".into(),
            props: Props::new(),
        });
        assert_eq!(updater.pending_len(), 1);
        assert_eq!(*sink.applies.lock(), 0);

        updater.enqueue(Operation::Added {
            seg: SegPath::root(),
            key_path: KeyPath::root(),
            key: "b".into(),
            props: Props::new(),
        });
        assert_eq!(updater.pending_len(), 0);
        assert_eq!(*sink.applies.lock(), 1);
        assert_eq!(sink.tree.lock().len(), 2);
    }

    #[test]
    fn force_flush_drains_queue_synchronously() {
        let sink = Arc::new(RecordingSink {
            tree: Mutex::new(MaterializedTree::default()),
            applies: Mutex::new(0),
        });
        let updater = BatchedStateUpdater::new(sink.clone(), 100, Duration::from_secs(30));

        updater.enqueue(Operation::Added {
            seg: SegPath::root(),
            key_path: KeyPath::root(),
            key: "a".into(),
            props: Props::new(),
        });
        updater.flush();

        assert_eq!(*sink.applies.lock(), 1);
        assert_eq!(sink.tree.lock().len(), 1);
    }

    #[test]
    fn dispose_flushes_pending_operations() {
        let sink = Arc::new(RecordingSink {
            tree: Mutex::new(MaterializedTree::default()),
            applies: Mutex::new(0),
        });
        let updater = BatchedStateUpdater::new(sink.clone(), 100, Duration::from_secs(30));
        updater.enqueue(Operation::Added {
            seg: SegPath::root(),
            key_path: KeyPath::root(),
            key: "a".into(),
            props: Props::new(),
        });
        updater.dispose();
        assert_eq!(*sink.applies.lock(), 1);
    }
}
