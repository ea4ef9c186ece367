use std::mem;
use std::ops::{Deref, DerefMut};
use std::slice;
use std::sync::Arc;

use tracing::trace;

use super::core::{Grant, RingRegion};

/// Contiguous bytes granted to the writer. Empty when the queue is full.
pub struct WriteRegion<'a> {
    data: &'a mut [u8],
}

impl<'a> Deref for WriteRegion<'a> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

impl<'a> DerefMut for WriteRegion<'a> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data
    }
}

/// The producing half of a [`BipQueue`](crate::BipQueue).
pub struct BipWriter {
    pub(crate) ring: Arc<RingRegion>,
    pub(crate) pending: Grant,
}

impl BipWriter {
    pub(crate) fn new(ring: Arc<RingRegion>) -> BipWriter {
        BipWriter {
            ring,
            pending: Grant::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.size()
    }

    /// No byte can be granted until the reader consumes some.
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    /// Grants at most `max_size` contiguous bytes, never past the buffer end.
    pub fn request_write(&mut self, max_size: usize) -> WriteRegion<'_> {
        let grant = self.ring.grant_write(max_size);
        trace!(start = grant.start, len = grant.len, max_size, "write region granted");
        self.pending = grant;
        let data = unsafe { slice::from_raw_parts_mut(self.ring.lane_ptr(0, grant.start), grant.len) };
        WriteRegion { data }
    }

    /// Publishes the first `n` bytes of the last granted region to the reader.
    ///
    /// # Panics
    ///
    /// If `n` exceeds the size of the last region returned by `request_write`.
    pub fn commit_write(&mut self, n: usize) {
        let grant = mem::take(&mut self.pending);
        self.ring.commit_write(grant, n);
    }

    /// Copies as much of `bytes` as currently fits and returns how much that was.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let mut written = 0;
        while written < bytes.len() {
            let mut region = self.request_write(bytes.len() - written);
            let n = region.len();
            if n == 0 {
                break;
            }
            region.copy_from_slice(&bytes[written..written + n]);
            self.commit_write(n);
            written += n;
        }
        written
    }
}

/// The same byte range in every lane of a segmented queue.
pub struct SegmentedWriteRegion<'a> {
    ring: &'a RingRegion,
    start: usize,
    len: usize,
}

impl<'a> SegmentedWriteRegion<'a> {
    /// Bytes available in each lane.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of the region inside every segment.
    pub fn offset(&self) -> usize {
        self.start
    }

    pub fn lane_count(&self) -> usize {
        self.ring.lanes()
    }

    pub fn lane_mut(&mut self, lane: usize) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ring.lane_ptr(lane, self.start), self.len) }
    }

    pub fn lanes_mut(&mut self) -> impl Iterator<Item = &mut [u8]> + '_ {
        let (ring, start, len) = (self.ring, self.start, self.len);
        (0..ring.lanes()).map(move |lane| unsafe { slice::from_raw_parts_mut(ring.lane_ptr(lane, start), len) })
    }
}

/// The producing half of a [`SegmentedBipQueue`](crate::SegmentedBipQueue).
pub struct SegmentedWriter {
    pub(crate) ring: Arc<RingRegion>,
    pub(crate) pending: Grant,
}

impl SegmentedWriter {
    pub(crate) fn new(ring: Arc<RingRegion>) -> SegmentedWriter {
        SegmentedWriter {
            ring,
            pending: Grant::default(),
        }
    }

    pub fn segment_size(&self) -> usize {
        self.ring.size()
    }

    pub fn segment_count(&self) -> usize {
        self.ring.lanes()
    }

    pub fn request_write(&mut self, max_size: usize) -> SegmentedWriteRegion<'_> {
        let grant = self.ring.grant_write(max_size);
        trace!(start = grant.start, len = grant.len, max_size, "segmented write region granted");
        self.pending = grant;
        SegmentedWriteRegion {
            ring: &*self.ring,
            start: grant.start,
            len: grant.len,
        }
    }

    pub fn commit_write(&mut self, n: usize) {
        let grant = mem::take(&mut self.pending);
        self.ring.commit_write(grant, n);
    }

    /// Appends one slice per lane, all of the same length. Returns the number of
    /// bytes written to each lane.
    pub fn write_lanes(&mut self, lanes: &[&[u8]]) -> usize {
        assert_eq!(lanes.len(), self.segment_count(), "one slice per segment expected");
        let total = lanes.first().map_or(0, |lane| lane.len());
        assert!(lanes.iter().all(|lane| lane.len() == total), "lanes must have equal length");

        let mut written = 0;
        while written < total {
            let mut region = self.request_write(total - written);
            let n = region.len();
            if n == 0 {
                break;
            }
            for (dst, src) in region.lanes_mut().zip(lanes) {
                dst.copy_from_slice(&src[written..written + n]);
            }
            self.commit_write(n);
            written += n;
        }
        written
    }
}
