mod core;
pub mod errors;
pub mod queue;
pub mod reader;
pub mod work_item;
pub mod work_queue;
pub mod writer;

#[cfg(test)]
mod tests;

pub use crate::core::{QueueConfig, DEFAULT_CAPACITY};
pub use crate::errors::QueueError;
pub use crate::queue::{BipQueue, SegmentedBipQueue};
pub use crate::work_item::{FnWorkItem, WorkItem, WorkItemHandle, WorkItemState, WorkItemStatus};
pub use crate::work_queue::{Priority, SchedulerConfig, WorkItemQueue};
