use std::mem;
use std::ops::Deref;
use std::slice;
use std::sync::Arc;

use tracing::trace;

use super::core::{Grant, RingRegion};

/// Contiguous committed bytes visible to the reader. Empty when nothing is queued.
pub struct ReadRegion<'a> {
    data: &'a [u8],
}

impl<'a> Deref for ReadRegion<'a> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

/// The consuming half of a [`BipQueue`](crate::BipQueue).
pub struct BipReader {
    pub(crate) ring: Arc<RingRegion>,
    pub(crate) pending: Grant,
}

impl BipReader {
    pub(crate) fn new(ring: Arc<RingRegion>) -> BipReader {
        BipReader {
            ring,
            pending: Grant::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.size()
    }

    /// Bytes committed by the writer and not yet consumed, including any run
    /// that starts over at the beginning of the buffer.
    pub fn available(&self) -> usize {
        self.ring.available()
    }

    /// The next contiguous run of committed bytes. Calling it again without a
    /// commit in between returns the same run, possibly grown.
    pub fn request_read(&mut self) -> ReadRegion<'_> {
        let grant = self.ring.readable();
        trace!(start = grant.start, len = grant.len, "read region granted");
        self.pending = grant;
        let data = unsafe { slice::from_raw_parts(self.ring.lane_ptr(0, grant.start) as *const u8, grant.len) };
        ReadRegion { data }
    }

    /// Releases the first `n` bytes of the last read region back to the writer.
    ///
    /// # Panics
    ///
    /// If `n` exceeds the size of the last region returned by `request_read`.
    pub fn commit_read(&mut self, n: usize) {
        let grant = mem::take(&mut self.pending);
        self.ring.commit_read(grant, n);
    }

    /// Copies up to `out.len()` queued bytes into `out`, returning the count.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let mut read = 0;
        while read < out.len() {
            let region = self.request_read();
            let n = region.len().min(out.len() - read);
            if n == 0 {
                break;
            }
            out[read..read + n].copy_from_slice(&region[..n]);
            self.commit_read(n);
            read += n;
        }
        read
    }
}

/// The same committed byte range in every lane of a segmented queue.
pub struct SegmentedReadRegion<'a> {
    ring: &'a RingRegion,
    start: usize,
    len: usize,
}

impl<'a> SegmentedReadRegion<'a> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> usize {
        self.start
    }

    pub fn lane_count(&self) -> usize {
        self.ring.lanes()
    }

    pub fn lane(&self, lane: usize) -> &'a [u8] {
        unsafe { slice::from_raw_parts(self.ring.lane_ptr(lane, self.start) as *const u8, self.len) }
    }

    pub fn lanes(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        (0..self.ring.lanes()).map(move |lane| self.lane(lane))
    }
}

/// The consuming half of a [`SegmentedBipQueue`](crate::SegmentedBipQueue).
pub struct SegmentedReader {
    pub(crate) ring: Arc<RingRegion>,
    pub(crate) pending: Grant,
}

impl SegmentedReader {
    pub(crate) fn new(ring: Arc<RingRegion>) -> SegmentedReader {
        SegmentedReader {
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

    /// Bytes queued per lane.
    pub fn available(&self) -> usize {
        self.ring.available()
    }

    pub fn request_read(&mut self) -> SegmentedReadRegion<'_> {
        let grant = self.ring.readable();
        trace!(start = grant.start, len = grant.len, "segmented read region granted");
        self.pending = grant;
        SegmentedReadRegion {
            ring: &*self.ring,
            start: grant.start,
            len: grant.len,
        }
    }

    pub fn commit_read(&mut self, n: usize) {
        let grant = mem::take(&mut self.pending);
        self.ring.commit_read(grant, n);
    }

    /// Fills one output slice per lane with up to `min(out lengths)` bytes.
    pub fn read_lanes(&mut self, out: &mut [&mut [u8]]) -> usize {
        assert_eq!(out.len(), self.segment_count(), "one slice per segment expected");
        let wanted = out.iter().map(|lane| lane.len()).min().unwrap_or(0);

        let mut read = 0;
        while read < wanted {
            let region = self.request_read();
            let n = region.len().min(wanted - read);
            if n == 0 {
                break;
            }
            for (dst, src) in out.iter_mut().zip(region.lanes()) {
                dst[read..read + n].copy_from_slice(&src[..n]);
            }
            self.commit_read(n);
            read += n;
        }
        read
    }
}
