use std::io;

use thiserror::Error;

/// Failures surfaced by queue construction and the worker pool.
///
/// Running out of data or space is not an error: the queues report it with an
/// empty region.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue capacity must be greater than zero")]
    ZeroCapacity,
    #[error("segmented queue needs at least one segment")]
    ZeroSegments,
    #[error("{segments} segments of {capacity} bytes do not fit in memory")]
    CapacityOverflow { capacity: usize, segments: usize },
    #[error("writer and reader belong to different queues")]
    MismatchedHalves,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}
