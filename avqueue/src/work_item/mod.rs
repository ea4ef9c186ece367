use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkItemState {
    Waiting = 0,
    Active = 1,
    Completed = 2,
    Cancelled = 3,
}

impl WorkItemState {
    fn from_u8(value: u8) -> WorkItemState {
        match value {
            0 => WorkItemState::Waiting,
            1 => WorkItemState::Active,
            2 => WorkItemState::Completed,
            _ => WorkItemState::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkItemState::Completed | WorkItemState::Cancelled)
    }
}

/// A unit of work run by a [`WorkItemQueue`](crate::WorkItemQueue).
///
/// `perform` runs exactly once on a pool thread. Cancellation of a running item
/// is cooperative: long running work should poll [`WorkItemStatus::is_cancelled`].
/// Exactly one of `completed` or `cancelled` is called afterwards.
pub trait WorkItem: Send + Sync {
    fn perform(&self, status: &WorkItemStatus);

    fn completed(&self) {}

    fn cancelled(&self) {}

    fn id(&self) -> Option<&str> {
        None
    }

    fn reference(&self) -> Option<&str> {
        None
    }
}

/// State visible to the item itself while it runs.
#[derive(Debug)]
pub struct WorkItemStatus {
    state: AtomicU8,
    cancel_requested: AtomicBool,
}

impl WorkItemStatus {
    fn new() -> WorkItemStatus {
        WorkItemStatus {
            state: AtomicU8::new(WorkItemState::Waiting as u8),
            cancel_requested: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> WorkItemState {
        WorkItemState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    #[inline]
    fn transition(&self, from: WorkItemState, to: WorkItemState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct Tracked {
    status: WorkItemStatus,
    item: Mutex<Option<Arc<dyn WorkItem>>>,
    dispose_on_terminal: bool,
    id: Option<String>,
    reference: Option<String>,
}

/// Shared token for an item handed to a queue.
///
/// Clones refer to the same item. Items created through [`WorkItemHandle::new`]
/// are released as soon as their terminal hook has run.
#[derive(Clone)]
pub struct WorkItemHandle {
    inner: Arc<Tracked>,
}

impl WorkItemHandle {
    pub fn new<W: WorkItem + 'static>(item: W) -> WorkItemHandle {
        WorkItemHandle::from_arc(Arc::new(item), true)
    }

    pub fn from_arc(item: Arc<dyn WorkItem>, dispose_on_terminal: bool) -> WorkItemHandle {
        let id = item.id().map(str::to_owned);
        let reference = item.reference().map(str::to_owned);
        WorkItemHandle {
            inner: Arc::new(Tracked {
                status: WorkItemStatus::new(),
                item: Mutex::new(Some(item)),
                dispose_on_terminal,
                id,
                reference,
            }),
        }
    }

    pub fn state(&self) -> WorkItemState {
        self.inner.status.state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.status.is_cancelled()
    }

    pub fn id(&self) -> Option<&str> {
        self.inner.id.as_deref()
    }

    pub fn reference(&self) -> Option<&str> {
        self.inner.reference.as_deref()
    }

    /// The item, unless it was disposed after reaching a terminal state.
    pub fn item(&self) -> Option<Arc<dyn WorkItem>> {
        self.inner.item.lock().clone()
    }

    pub fn ptr_eq(&self, other: &WorkItemHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn activate(&self) -> bool {
        self.inner.status.transition(WorkItemState::Waiting, WorkItemState::Active)
    }

    pub(crate) fn deactivate(&self) -> bool {
        self.inner.status.transition(WorkItemState::Active, WorkItemState::Waiting)
    }

    /// Runs `perform` and the terminal hook. Skips `perform` when a cancel
    /// landed between activation and this call.
    pub(crate) fn run(&self) {
        let status = &self.inner.status;
        if let Some(item) = self.item() {
            if status.state() == WorkItemState::Active && !status.is_cancelled() {
                item.perform(status);
            }
        }
        if status.transition(WorkItemState::Active, WorkItemState::Completed) {
            trace!(id = ?self.id(), "work item completed");
            self.finish(|item| item.completed());
        } else {
            trace!(id = ?self.id(), "work item finished after cancel");
            self.finish(|item| item.cancelled());
        }
    }

    /// Cancels an item that never left the idle list. The hook runs later via
    /// [`notify_cancelled`](Self::notify_cancelled), outside the queue lock.
    pub(crate) fn cancel_waiting(&self) -> bool {
        let status = &self.inner.status;
        status.cancel_requested.store(true, Ordering::Release);
        status.transition(WorkItemState::Waiting, WorkItemState::Cancelled)
    }

    pub(crate) fn notify_cancelled(&self) {
        self.finish(|item| item.cancelled());
    }

    /// Flags a running item. Its `cancelled` hook fires once `perform` returns.
    pub(crate) fn cancel_active(&self) -> bool {
        let status = &self.inner.status;
        status.cancel_requested.store(true, Ordering::Release);
        status.transition(WorkItemState::Active, WorkItemState::Cancelled)
    }

    fn finish<F: FnOnce(&dyn WorkItem)>(&self, hook: F) {
        let item = if self.inner.dispose_on_terminal {
            self.inner.item.lock().take()
        } else {
            self.item()
        };
        if let Some(item) = item {
            hook(&*item);
        }
    }
}

impl fmt::Debug for WorkItemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItemHandle")
            .field("id", &self.inner.id)
            .field("reference", &self.inner.reference)
            .field("state", &self.state())
            .finish()
    }
}

type Job = Box<dyn FnOnce(&WorkItemStatus) + Send>;

/// Adapts a closure to [`WorkItem`].
pub struct FnWorkItem {
    job: Mutex<Option<Job>>,
    id: Option<String>,
    reference: Option<String>,
}

impl FnWorkItem {
    pub fn new<F>(job: F) -> FnWorkItem
    where
        F: FnOnce(&WorkItemStatus) + Send + 'static,
    {
        FnWorkItem {
            job: Mutex::new(Some(Box::new(job))),
            id: None,
            reference: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> FnWorkItem {
        self.id = Some(id.into());
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> FnWorkItem {
        self.reference = Some(reference.into());
        self
    }
}

impl WorkItem for FnWorkItem {
    fn perform(&self, status: &WorkItemStatus) {
        let job = self.job.lock().take();
        if let Some(job) = job {
            job(status);
        }
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }
}
