use std::cell::UnsafeCell;
use std::cmp;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_derive::{Deserialize, Serialize};

use crate::errors::QueueError;

pub const DEFAULT_CAPACITY: usize = 65536;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Bytes per segment. For a plain queue this is the whole buffer.
    pub capacity: usize,
    pub segments: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            capacity: DEFAULT_CAPACITY,
            segments: 1,
        }
    }
}

/// A contiguous run handed out by the cursor bookkeeping.
///
/// `ahead` records whether the writer was at or ahead of the reader when the
/// run was granted; only such writes reset the watermark on commit.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Grant {
    pub start: usize,
    pub len: usize,
    pub ahead: bool,
}

impl Grant {
    #[inline]
    fn empty(start: usize) -> Grant {
        Grant {
            start,
            len: 0,
            ahead: false,
        }
    }
}

/// Byte storage plus the read/write/watermark cursor triple.
///
/// The buffer holds `lanes` segments of `size` bytes each; cursors are offsets
/// within one segment and apply to every lane at once. `write` and `watermark`
/// are stored only by the writer half, `read` only by the reader half.
pub(crate) struct RingRegion {
    buffer: Box<[UnsafeCell<u8>]>,
    size: usize,
    lanes: usize,
    read: AtomicUsize,
    write: AtomicUsize,
    watermark: AtomicUsize,
}

// Each half only touches bytes inside the runs it was granted, and the cursor
// protocol keeps the writer's and reader's runs disjoint.
unsafe impl Sync for RingRegion {}
unsafe impl Send for RingRegion {}

impl RingRegion {
    pub fn new(size: usize, lanes: usize) -> Result<RingRegion, QueueError> {
        if size == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        if lanes == 0 {
            return Err(QueueError::ZeroSegments);
        }
        let total = size.checked_mul(lanes).ok_or(QueueError::CapacityOverflow {
            capacity: size,
            segments: lanes,
        })?;
        let buffer = (0..total).map(|_| UnsafeCell::new(0u8)).collect();
        Ok(RingRegion {
            buffer,
            size,
            lanes,
            read: AtomicUsize::new(0),
            write: AtomicUsize::new(0),
            watermark: AtomicUsize::new(size),
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn lanes(&self) -> usize {
        self.lanes
    }

    /// Raw pointer to byte `offset` of lane `lane`.
    #[inline]
    pub fn lane_ptr(&self, lane: usize, offset: usize) -> *mut u8 {
        assert!(lane < self.lanes, "lane {} out of range ({} lanes)", lane, self.lanes);
        debug_assert!(offset <= self.size);
        // At most one past the end, for an empty run at the end of the last lane.
        let index = lane * self.size + offset;
        unsafe { UnsafeCell::raw_get(self.buffer.as_ptr().add(index)) }
    }

    pub fn grant_write(&self, max: usize) -> Grant {
        let size = self.size;
        let write = self.write.load(Ordering::Relaxed);
        let read = self.read.load(Ordering::Acquire);
        if max == 0 {
            return Grant::empty(write);
        }
        if write >= read {
            let tail = size - write;
            if tail >= max {
                return Grant {
                    start: write,
                    len: max,
                    ahead: true,
                };
            }
            if read > max {
                self.wrap_writer(write);
                return Grant {
                    start: 0,
                    len: max,
                    ahead: false,
                };
            }
            if tail > 0 {
                return Grant {
                    start: write,
                    len: tail,
                    ahead: true,
                };
            }
            // The head run must stop one byte short of the reader so that
            // write == read keeps meaning "empty".
            if read > 1 {
                self.wrap_writer(write);
                return Grant {
                    start: 0,
                    len: read - 1,
                    ahead: false,
                };
            }
            Grant::empty(write)
        } else {
            let room = read - write - 1;
            if room == 0 {
                return Grant::empty(write);
            }
            Grant {
                start: write,
                len: cmp::min(max, room),
                ahead: false,
            }
        }
    }

    #[inline]
    fn wrap_writer(&self, write: usize) {
        // Publish the end of the readable run before the reader can observe
        // the writer behind it.
        self.watermark.store(write, Ordering::Release);
        self.write.store(0, Ordering::Release);
    }

    pub fn commit_write(&self, grant: Grant, n: usize) {
        assert!(
            n <= grant.len,
            "committed {} bytes but only {} were granted",
            n,
            grant.len
        );
        if n == 0 {
            return;
        }
        let mut write = grant.start + n;
        if grant.ahead {
            self.watermark.store(self.size, Ordering::Release);
            // Resting at `size` while the reader sits at 0 is how a full
            // buffer stays distinguishable from an empty one.
            if write == self.size && self.read.load(Ordering::Acquire) > 0 {
                write = 0;
            }
        }
        debug_assert!(write <= self.size);
        self.write.store(write, Ordering::Release);
    }

    pub fn readable(&self) -> Grant {
        let read = self.read.load(Ordering::Relaxed);
        let write = self.write.load(Ordering::Acquire);
        if write >= read {
            return Grant {
                start: read,
                len: write - read,
                ahead: false,
            };
        }
        let watermark = self.watermark.load(Ordering::Acquire);
        if read >= watermark {
            Grant {
                start: 0,
                len: write,
                ahead: false,
            }
        } else {
            Grant {
                start: read,
                len: watermark - read,
                ahead: false,
            }
        }
    }

    pub fn commit_read(&self, grant: Grant, n: usize) {
        assert!(
            n <= grant.len,
            "consumed {} bytes but only {} were readable",
            n,
            grant.len
        );
        if n == 0 {
            return;
        }
        let mut read = grant.start + n;
        let write = self.write.load(Ordering::Acquire);
        if write < read && read >= self.watermark.load(Ordering::Acquire) {
            read = 0;
        }
        self.read.store(read, Ordering::Release);
    }

    /// True when `grant_write` would return an empty region for any size.
    pub fn is_full(&self) -> bool {
        let write = self.write.load(Ordering::Relaxed);
        let read = self.read.load(Ordering::Acquire);
        if write >= read {
            write == self.size && read <= 1
        } else {
            read - write == 1
        }
    }

    /// Total committed bytes the reader has not consumed yet, across the wrap.
    pub fn available(&self) -> usize {
        let read = self.read.load(Ordering::Relaxed);
        let write = self.write.load(Ordering::Acquire);
        if write >= read {
            write - read
        } else {
            let watermark = self.watermark.load(Ordering::Acquire);
            watermark.saturating_sub(read) + write
        }
    }

    /// Callers must hold both halves, so neither side is running.
    pub fn reset(&self) {
        self.read.store(0, Ordering::Release);
        self.write.store(0, Ordering::Release);
        self.watermark.store(self.size, Ordering::Release);
    }

    #[cfg(test)]
    pub fn cursors(&self) -> (usize, usize, usize) {
        (
            self.read.load(Ordering::SeqCst),
            self.write.load(Ordering::SeqCst),
            self.watermark.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_zero_sizes() {
        assert!(matches!(RingRegion::new(0, 1), Err(QueueError::ZeroCapacity)));
        assert!(matches!(RingRegion::new(16, 0), Err(QueueError::ZeroSegments)));
    }

    #[test]
    fn new_rejects_sizes_that_overflow() {
        let huge = usize::MAX / 2 + 1;
        assert!(matches!(
            RingRegion::new(huge, 2),
            Err(QueueError::CapacityOverflow { capacity, segments: 2 }) if capacity == huge
        ));
        assert!(matches!(
            RingRegion::new(2, usize::MAX),
            Err(QueueError::CapacityOverflow { .. })
        ));
    }

    #[test]
    fn partial_tail_after_reader_catches_up() {
        let ring = RingRegion::new(1024, 1).unwrap();
        let g = ring.grant_write(600);
        assert_eq!(g, Grant { start: 0, len: 600, ahead: true });
        ring.commit_write(g, 600);
        let r = ring.readable();
        assert_eq!((r.start, r.len), (0, 600));
        ring.commit_read(r, 400);

        let g = ring.grant_write(500);
        assert_eq!((g.start, g.len), (600, 424));
        assert_eq!(ring.cursors(), (400, 600, 1024));
    }

    #[test]
    fn wraps_when_head_fits_whole_request() {
        let ring = RingRegion::new(100, 1).unwrap();
        let g = ring.grant_write(80);
        ring.commit_write(g, 80);
        let r = ring.readable();
        ring.commit_read(r, 60);

        let g = ring.grant_write(30);
        assert_eq!(g, Grant { start: 0, len: 30, ahead: false });
        assert_eq!(ring.cursors(), (60, 0, 80));

        // Reader still drains the old tail up to the watermark first.
        let r = ring.readable();
        assert_eq!((r.start, r.len), (60, 20));
        ring.commit_write(g, 30);
        ring.commit_read(r, 20);
        assert_eq!(ring.cursors().0, 0);
        let r = ring.readable();
        assert_eq!((r.start, r.len), (0, 30));
    }

    #[test]
    fn full_buffer_is_not_mistaken_for_empty() {
        let ring = RingRegion::new(64, 1).unwrap();
        let g = ring.grant_write(64);
        assert_eq!(g.len, 64);
        ring.commit_write(g, 64);
        assert_eq!(ring.cursors(), (0, 64, 64));
        assert_eq!(ring.available(), 64);
        assert_eq!(ring.grant_write(1).len, 0);
        assert!(ring.is_full());

        let r = ring.readable();
        assert_eq!((r.start, r.len), (0, 64));
        ring.commit_read(r, 64);
        assert_eq!(ring.readable().len, 0);
        assert!(!ring.is_full());

        // Writer at the end wraps on its next request.
        let g = ring.grant_write(10);
        assert_eq!((g.start, g.len), (0, 10));
        ring.commit_write(g, 10);
        let r = ring.readable();
        assert_eq!((r.start, r.len), (0, 10));
    }

    #[test]
    fn behind_writer_keeps_one_byte_gap() {
        let ring = RingRegion::new(32, 1).unwrap();
        let g = ring.grant_write(32);
        ring.commit_write(g, 32);
        let r = ring.readable();
        ring.commit_read(r, 8);

        let g = ring.grant_write(16);
        assert_eq!((g.start, g.len), (0, 7));
        ring.commit_write(g, 7);
        assert_eq!(ring.grant_write(1).len, 0);
        assert_eq!(ring.available(), 24 + 7);
    }

    #[test]
    #[should_panic(expected = "only 4 were granted")]
    fn over_commit_panics() {
        let ring = RingRegion::new(32, 1).unwrap();
        let g = ring.grant_write(4);
        ring.commit_write(g, 5);
    }
}
