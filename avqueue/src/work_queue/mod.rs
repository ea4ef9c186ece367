use std::cmp;
use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

use crate::work_item::{FnWorkItem, WorkItem, WorkItemHandle, WorkItemStatus};

use self::scheduler::{NodeId, Scheduler, ROOT};

mod scheduler;
mod semaphore;

/// Scheduling priority. Lower values run first; equal values run in the order
/// they were added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub u32);

impl Priority {
    pub const HIGH: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(100);
    pub const LOW: Priority = Priority(200);
    pub const BACKGROUND: Priority = Priority(300);
}

impl Default for Priority {
    fn default() -> Priority {
        Priority::NORMAL
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// `<= 0`: all cores minus that many. `> 0`: at most that many, capped at
    /// the core count.
    pub max_concurrent: i32,
}

/// Maps a ceiling argument to a concrete limit for a machine with `cores` cores.
pub fn resolve_ceiling(requested: i32, cores: usize) -> usize {
    let cores = cores.max(1);
    if requested <= 0 {
        cores.saturating_sub(requested.unsigned_abs() as usize).max(1)
    } else {
        cmp::min(requested as usize, cores)
    }
}

static MAIN: Lazy<WorkItemQueue> = Lazy::new(|| WorkItemQueue::new_root(0));

struct QueueInner {
    scheduler: Arc<Scheduler>,
    node: NodeId,
    // Keeps every ancestor, and with it the pool, alive.
    _target: Option<WorkItemQueue>,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        if self.node == ROOT {
            self.scheduler.shutdown();
        } else {
            self.scheduler.release_node(self.node);
        }
    }
}

/// A node in a hierarchy of priority queues that share one worker pool.
///
/// Items run on pool threads owned by the root. A queue never runs more items
/// at once, counting everything running in the queues below it, than its
/// `max_concurrent`. Clones refer to the same queue; when the last clone is
/// dropped its idle items are cancelled. Dropping a root also stops its pool
/// once the running items finish.
#[derive(Clone)]
pub struct WorkItemQueue {
    inner: Arc<QueueInner>,
}

impl WorkItemQueue {
    /// The process-wide queue sized from the core count. Queues created with
    /// [`new`](Self::new) run under it.
    pub fn main() -> &'static WorkItemQueue {
        &MAIN
    }

    /// A new hierarchy with its own worker pool.
    pub fn new_root(max_concurrent: i32) -> WorkItemQueue {
        let max = resolve_ceiling(max_concurrent, num_cpus::get());
        debug!(max_concurrent = max, "work item root queue created");
        WorkItemQueue {
            inner: Arc::new(QueueInner {
                scheduler: Scheduler::new(max),
                node: ROOT,
                _target: None,
            }),
        }
    }

    pub fn from_config(cfg: &SchedulerConfig) -> WorkItemQueue {
        WorkItemQueue::new_root(cfg.max_concurrent)
    }

    pub fn new(max_concurrent: i32) -> WorkItemQueue {
        WorkItemQueue::with_target(WorkItemQueue::main(), max_concurrent)
    }

    /// A child of `target`. Its items also count against every ancestor's limit.
    pub fn with_target(target: &WorkItemQueue, max_concurrent: i32) -> WorkItemQueue {
        let scheduler = target.inner.scheduler.clone();
        let max = resolve_ceiling(max_concurrent, num_cpus::get());
        let node = scheduler.add_node(target.inner.node, max);
        WorkItemQueue {
            inner: Arc::new(QueueInner {
                scheduler,
                node,
                _target: Some(target.clone()),
            }),
        }
    }

    pub fn add<W: WorkItem + 'static>(&self, item: W, priority: Priority) -> WorkItemHandle {
        let handle = WorkItemHandle::new(item);
        self.add_handle(handle.clone(), priority);
        handle
    }

    /// Queues an existing handle. Handles that already left `Waiting` are
    /// dropped on the next pass without running.
    pub fn add_handle(&self, handle: WorkItemHandle, priority: Priority) {
        self.inner.scheduler.add(self.inner.node, priority, handle);
    }

    pub fn add_fn<F>(&self, priority: Priority, job: F) -> WorkItemHandle
    where
        F: FnOnce(&WorkItemStatus) + Send + 'static,
    {
        self.add(FnWorkItem::new(job), priority)
    }

    /// Returns true if `handle` was idle or running in this queue.
    pub fn cancel(&self, handle: &WorkItemHandle) -> bool {
        self.cancel_where(|h| h.ptr_eq(handle)) > 0
    }

    /// Idle matches are cancelled right away, running ones are flagged and
    /// finish on their own. Returns how many items were cancelled.
    pub fn cancel_where<F>(&self, matches: F) -> usize
    where
        F: Fn(&WorkItemHandle) -> bool,
    {
        self.inner.scheduler.cancel(self.inner.node, matches)
    }

    pub fn cancel_ids<S: AsRef<str>>(&self, ids: &[S]) -> usize {
        let ids: HashSet<&str> = ids.iter().map(|id| id.as_ref()).collect();
        self.cancel_where(|handle| handle.id().map_or(false, |id| ids.contains(id)))
    }

    pub fn cancel_reference(&self, reference: &str) -> usize {
        self.cancel_where(|handle| handle.reference() == Some(reference))
    }

    pub fn cancel_all(&self) -> usize {
        self.cancel_where(|_| true)
    }

    /// Stops new activations here and below. Running items are unaffected.
    pub fn pause(&self) {
        self.inner.scheduler.set_paused(self.inner.node, true);
    }

    pub fn resume(&self) {
        self.inner.scheduler.set_paused(self.inner.node, false);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.scheduler.is_paused(self.inner.node)
    }

    /// Blocks until this queue has no idle or active items and every
    /// cancellation hook of its items has returned. Items of child queues are
    /// not waited for.
    pub fn wait(&self) {
        self.inner.scheduler.wait(self.inner.node);
    }

    pub fn idle_count(&self) -> usize {
        self.inner.scheduler.counts(self.inner.node).0
    }

    pub fn active_count(&self) -> usize {
        self.inner.scheduler.counts(self.inner.node).1
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.scheduler.max_concurrent(self.inner.node)
    }

    /// Threads spawned so far by this hierarchy's pool. The pool never shrinks.
    pub fn worker_count(&self) -> usize {
        self.inner.scheduler.worker_count()
    }
}
