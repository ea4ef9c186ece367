use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use super::semaphore::Semaphore;
use super::Priority;
use crate::errors::QueueError;
use crate::work_item::WorkItemHandle;

pub(crate) type NodeId = usize;

pub(crate) const ROOT: NodeId = 0;

/// Idle entries sort by priority, then by insertion order.
type Key = (Priority, u64);

struct Node {
    max_concurrent: usize,
    paused: bool,
    idle: BTreeMap<Key, WorkItemHandle>,
    active: Vec<WorkItemHandle>,
    /// Cancelled items whose cancellation hook has not returned yet.
    notifying: usize,
    /// Active items here and in every descendant.
    active_deep: usize,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
    detached: bool,
}

impl Node {
    fn new(parent: Option<NodeId>, max_concurrent: usize) -> Node {
        Node {
            max_concurrent,
            paused: false,
            idle: BTreeMap::new(),
            active: Vec::new(),
            notifying: 0,
            active_deep: 0,
            children: Vec::new(),
            parent,
            detached: false,
        }
    }
}

/// Every queue of one hierarchy, stored in an arena indexed by [`NodeId`].
struct Tree {
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
    next_sequence: u64,
}

impl Tree {
    fn new(root_max: usize) -> Tree {
        Tree {
            nodes: vec![Some(Node::new(None, root_max))],
            free: Vec::new(),
            next_sequence: 0,
        }
    }

    fn node(&self, id: NodeId) -> &Node {
        match self.nodes.get(id) {
            Some(Some(node)) => node,
            _ => panic!("work item queue node {} does not exist", id),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.nodes.get_mut(id) {
            Some(Some(node)) => node,
            _ => panic!("work item queue node {} does not exist", id),
        }
    }

    fn insert(&mut self, parent: NodeId, max_concurrent: usize) -> NodeId {
        let node = Node::new(Some(parent), max_concurrent);
        let id = match self.free.pop() {
            Some(id) => {
                self.nodes[id] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.node_mut(parent).children.push(id);
        id
    }

    fn push_idle(&mut self, id: NodeId, priority: Priority, handle: WorkItemHandle) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.node_mut(id).idle.insert((priority, sequence), handle);
    }

    fn best(&self, id: NodeId) -> Option<(Key, NodeId)> {
        let node = self.node(id);
        if node.paused || node.active_deep >= node.max_concurrent {
            return None;
        }
        let mut best = node.idle.keys().next().map(|key| (*key, id));
        for &child in &node.children {
            if let Some(candidate) = self.best(child) {
                if best.map_or(true, |(key, _)| candidate.0 < key) {
                    best = Some(candidate);
                }
            }
        }
        best
    }

    fn bump_active(&mut self, id: NodeId, delta: isize) {
        let mut cursor = Some(id);
        while let Some(id) = cursor {
            let node = self.node_mut(id);
            node.active_deep = (node.active_deep as isize + delta) as usize;
            cursor = node.parent;
        }
    }

    fn activate_next(&mut self) -> Option<Assignment> {
        loop {
            let (key, id) = self.best(ROOT)?;
            let handle = match self.node_mut(id).idle.remove(&key) {
                Some(handle) => handle,
                None => continue,
            };
            if !handle.activate() {
                continue;
            }
            self.node_mut(id).active.push(handle.clone());
            self.bump_active(id, 1);
            return Some(Assignment { node: id, key, handle });
        }
    }

    fn retire(&mut self, id: NodeId, handle: &WorkItemHandle) {
        let node = self.node_mut(id);
        if let Some(pos) = node.active.iter().position(|h| h.ptr_eq(handle)) {
            node.active.swap_remove(pos);
            self.bump_active(id, -1);
        }
        self.collect(id);
    }

    /// Frees a detached node once its last active item is gone.
    fn collect(&mut self, id: NodeId) {
        let node = self.node(id);
        if node.detached && node.active.is_empty() && node.idle.is_empty() && node.notifying == 0 {
            self.nodes[id] = None;
            self.free.push(id);
        }
    }

    fn pending(&self, id: NodeId) -> usize {
        let node = self.node(id);
        node.idle.len() + node.active.len() + node.notifying
    }

    /// Removes matching idle items and flags matching active ones. Returns the
    /// removed items and the number of active items flagged.
    fn cancel<F>(&mut self, id: NodeId, matches: F) -> (Vec<WorkItemHandle>, usize)
    where
        F: Fn(&WorkItemHandle) -> bool,
    {
        let removed = self.cancel_idle(id, &matches);
        let flagged = self
            .node(id)
            .active
            .iter()
            .filter(|handle| matches(handle) && handle.cancel_active())
            .count();
        (removed, flagged)
    }

    fn cancel_idle<F>(&mut self, id: NodeId, matches: F) -> Vec<WorkItemHandle>
    where
        F: Fn(&WorkItemHandle) -> bool,
    {
        let node = self.node_mut(id);
        let keys: Vec<Key> = node
            .idle
            .iter()
            .filter(|&(_, handle)| matches(handle))
            .map(|(key, _)| *key)
            .collect();
        let removed: Vec<WorkItemHandle> = keys.iter().filter_map(|key| node.idle.remove(key)).collect();
        for handle in &removed {
            handle.cancel_waiting();
        }
        removed
    }
}

struct Assignment {
    node: NodeId,
    key: Key,
    handle: WorkItemHandle,
}

struct Worker {
    id: usize,
    semaphore: Semaphore,
    job: Mutex<Option<Assignment>>,
}

#[derive(Default)]
struct Pool {
    idle: Vec<Arc<Worker>>,
    spawned: usize,
}

/// State shared by one queue hierarchy: the node arena behind one lock and the
/// worker pool behind another. Neither lock is held while an item performs.
pub(crate) struct Scheduler {
    tree: Mutex<Tree>,
    drained: Condvar,
    pool: Mutex<Pool>,
    shutdown: AtomicBool,
}

impl Scheduler {
    pub fn new(root_max: usize) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            tree: Mutex::new(Tree::new(root_max)),
            drained: Condvar::new(),
            pool: Mutex::new(Pool::default()),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn add_node(&self, parent: NodeId, max_concurrent: usize) -> NodeId {
        let id = self.tree.lock().insert(parent, max_concurrent);
        debug!(node = id, parent, max_concurrent, "work item queue created");
        id
    }

    /// Drops a queue: idle items are cancelled, running ones finish first.
    pub fn release_node(&self, id: NodeId) {
        let cancelled = {
            let mut tree = self.tree.lock();
            let cancelled = tree.cancel_idle(id, |_| true);
            let parent = tree.node(id).parent;
            if let Some(parent) = parent {
                tree.node_mut(parent).children.retain(|&child| child != id);
            }
            tree.node_mut(id).detached = true;
            tree.collect(id);
            cancelled
        };
        debug!(node = id, cancelled = cancelled.len(), "work item queue released");
        for handle in cancelled {
            handle.notify_cancelled();
        }
        self.drained.notify_all();
    }

    pub fn add(self: &Arc<Self>, id: NodeId, priority: Priority, handle: WorkItemHandle) {
        self.tree.lock().push_idle(id, priority, handle);
        self.schedule();
    }

    pub fn cancel<F>(&self, id: NodeId, matches: F) -> usize
    where
        F: Fn(&WorkItemHandle) -> bool,
    {
        let (cancelled, flagged) = {
            let mut tree = self.tree.lock();
            let (cancelled, flagged) = tree.cancel(id, matches);
            // Still pending for `wait` until the hooks below have returned.
            tree.node_mut(id).notifying += cancelled.len();
            (cancelled, flagged)
        };
        trace!(node = id, idle = cancelled.len(), active = flagged, "work items cancelled");
        for handle in &cancelled {
            handle.notify_cancelled();
        }
        if !cancelled.is_empty() {
            let mut tree = self.tree.lock();
            tree.node_mut(id).notifying -= cancelled.len();
            tree.collect(id);
            self.drained.notify_all();
        }
        cancelled.len() + flagged
    }

    pub fn set_paused(self: &Arc<Self>, id: NodeId, paused: bool) {
        self.tree.lock().node_mut(id).paused = paused;
        if !paused {
            self.schedule();
        }
    }

    pub fn is_paused(&self, id: NodeId) -> bool {
        self.tree.lock().node(id).paused
    }

    pub fn max_concurrent(&self, id: NodeId) -> usize {
        self.tree.lock().node(id).max_concurrent
    }

    pub fn counts(&self, id: NodeId) -> (usize, usize) {
        let tree = self.tree.lock();
        let node = tree.node(id);
        (node.idle.len(), node.active.len())
    }

    pub fn worker_count(&self) -> usize {
        self.pool.lock().spawned
    }

    pub fn wait(&self, id: NodeId) {
        let mut tree = self.tree.lock();
        while tree.pending(id) > 0 {
            self.drained.wait(&mut tree);
        }
    }

    /// Activates eligible items, best first, until none is left or every
    /// ceiling on the way is reached.
    pub fn schedule(self: &Arc<Self>) {
        while !self.shutdown.load(Ordering::Acquire) {
            let assignment = match self.tree.lock().activate_next() {
                Some(assignment) => assignment,
                None => return,
            };
            trace!(node = assignment.node, id = ?assignment.handle.id(), "work item activated");
            if let Err(err) = self.dispatch(assignment) {
                error!(%err, "work item left waiting, no worker could take it");
                return;
            }
        }
    }

    fn dispatch(self: &Arc<Self>, assignment: Assignment) -> Result<(), QueueError> {
        let mut pool = self.pool.lock();
        if let Some(worker) = pool.idle.pop() {
            drop(pool);
            *worker.job.lock() = Some(assignment);
            worker.semaphore.signal();
            return Ok(());
        }

        let id = pool.spawned;
        pool.spawned += 1;
        drop(pool);

        let worker = Arc::new(Worker {
            id,
            semaphore: Semaphore::new(),
            job: Mutex::new(None),
        });
        let scheduler = self.clone();
        let thread_worker = worker.clone();
        let spawned = thread::Builder::new()
            .name(format!("work-item-{}", id))
            .spawn(move || scheduler.worker_main(thread_worker));
        match spawned {
            Ok(_) => {
                debug!(worker = id, "worker thread started");
                *worker.job.lock() = Some(assignment);
                worker.semaphore.signal();
                Ok(())
            }
            Err(err) => {
                self.pool.lock().spawned -= 1;
                self.requeue(assignment);
                Err(QueueError::Spawn(err))
            }
        }
    }

    fn requeue(&self, assignment: Assignment) {
        let Assignment { node, key, handle } = assignment;
        let mut tree = self.tree.lock();
        if !tree.node(node).detached && handle.deactivate() {
            tree.retire(node, &handle);
            tree.node_mut(node).idle.insert(key, handle);
            return;
        }
        // Cancelled, or its queue is gone, while we were looking for a thread.
        handle.cancel_active();
        drop(tree);
        handle.run();
        self.tree.lock().retire(node, &handle);
        self.drained.notify_all();
    }

    fn worker_main(self: Arc<Self>, worker: Arc<Worker>) {
        loop {
            let job = worker.job.lock().take();
            match job {
                Some(assignment) => {
                    assignment.handle.run();
                    // Parked before retiring, so a pass triggered by the retire
                    // finds this worker instead of spawning another.
                    self.pool.lock().idle.push(worker.clone());
                    {
                        let mut tree = self.tree.lock();
                        tree.retire(assignment.node, &assignment.handle);
                        self.drained.notify_all();
                    }
                    self.schedule();
                }
                None => {
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    worker.semaphore.wait();
                }
            }
        }
        debug!(worker = worker.id, "worker thread exiting");
    }

    /// Stops the pool. Idle root items are cancelled, workers finish their
    /// current item and exit.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let cancelled = self.tree.lock().cancel_idle(ROOT, |_| true);
        for handle in &cancelled {
            handle.notify_cancelled();
        }
        self.drained.notify_all();
        let pool = self.pool.lock();
        for worker in &pool.idle {
            worker.semaphore.signal();
        }
        debug!(workers = pool.spawned, cancelled = cancelled.len(), "work item pool shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_item::{FnWorkItem, WorkItemState};

    fn item() -> WorkItemHandle {
        WorkItemHandle::new(FnWorkItem::new(|_| {}))
    }

    #[test]
    fn best_prefers_priority_then_insertion_order() {
        let mut tree = Tree::new(4);
        let child = tree.insert(ROOT, 4);
        let normal = item();
        let high = item();
        let later_high = item();
        tree.push_idle(ROOT, Priority::NORMAL, normal.clone());
        tree.push_idle(child, Priority::HIGH, high.clone());
        tree.push_idle(ROOT, Priority::HIGH, later_high.clone());

        let first = tree.activate_next().unwrap();
        assert!(first.handle.ptr_eq(&high));
        assert_eq!(first.node, child);
        let second = tree.activate_next().unwrap();
        assert!(second.handle.ptr_eq(&later_high));
        let third = tree.activate_next().unwrap();
        assert!(third.handle.ptr_eq(&normal));
        assert!(tree.activate_next().is_none());
    }

    #[test]
    fn ceilings_propagate_to_ancestors() {
        let mut tree = Tree::new(2);
        let a = tree.insert(ROOT, 5);
        let b = tree.insert(a, 1);
        for _ in 0..3 {
            tree.push_idle(b, Priority::NORMAL, item());
        }
        tree.push_idle(a, Priority::LOW, item());
        tree.push_idle(ROOT, Priority::LOW, item());

        let first = tree.activate_next().unwrap();
        assert_eq!(first.node, b);
        // b is at its ceiling of one, so the LOW item in a goes next.
        let second = tree.activate_next().unwrap();
        assert_eq!(second.node, a);
        // Root ceiling of two reached.
        assert!(tree.activate_next().is_none());
        assert_eq!(tree.node(ROOT).active_deep, 2);
        assert_eq!(tree.node(a).active_deep, 2);
        assert_eq!(tree.node(b).active_deep, 1);

        tree.retire(first.node, &first.handle);
        assert_eq!(tree.node(ROOT).active_deep, 1);
        let third = tree.activate_next().unwrap();
        assert_eq!(third.node, b);
    }

    #[test]
    fn paused_node_hides_its_subtree() {
        let mut tree = Tree::new(4);
        let a = tree.insert(ROOT, 4);
        let b = tree.insert(a, 4);
        tree.push_idle(b, Priority::HIGH, item());
        tree.node_mut(a).paused = true;
        assert!(tree.activate_next().is_none());
        tree.node_mut(a).paused = false;
        assert_eq!(tree.activate_next().unwrap().node, b);
    }

    #[test]
    fn cancel_removes_idle_and_flags_active() {
        let mut tree = Tree::new(1);
        let running = item();
        let waiting = item();
        tree.push_idle(ROOT, Priority::NORMAL, running.clone());
        tree.push_idle(ROOT, Priority::NORMAL, waiting.clone());
        tree.activate_next().unwrap();

        let (removed, flagged) = tree.cancel(ROOT, |_| true);
        assert_eq!(removed.len(), 1);
        assert_eq!(flagged, 1);
        assert!(removed[0].ptr_eq(&waiting));
        assert_eq!(waiting.state(), WorkItemState::Cancelled);
        assert_eq!(running.state(), WorkItemState::Cancelled);
        assert!(running.is_cancelled());
        assert_eq!(tree.pending(ROOT), 1);
    }

    #[test]
    fn unfinished_cancellation_hooks_count_as_pending() {
        let mut tree = Tree::new(1);
        tree.push_idle(ROOT, Priority::NORMAL, item());
        let (removed, _) = tree.cancel(ROOT, |_| true);
        assert_eq!(tree.pending(ROOT), 0);
        tree.node_mut(ROOT).notifying += removed.len();
        assert_eq!(tree.pending(ROOT), 1);
        tree.node_mut(ROOT).notifying -= removed.len();
        assert_eq!(tree.pending(ROOT), 0);
    }

    #[test]
    fn detached_node_is_freed_after_last_item() {
        let mut tree = Tree::new(2);
        let a = tree.insert(ROOT, 2);
        tree.push_idle(a, Priority::NORMAL, item());
        let running = tree.activate_next().unwrap();
        tree.node_mut(ROOT).children.retain(|&c| c != a);
        tree.node_mut(a).detached = true;
        tree.collect(a);
        assert!(tree.nodes[a].is_some());

        tree.retire(a, &running.handle);
        assert!(tree.nodes[a].is_none());
        assert_eq!(tree.node(ROOT).active_deep, 0);
        assert_eq!(tree.insert(ROOT, 1), a, "slot is reused");
    }
}
