use std::sync::Arc;

use tracing::debug;

use super::core::{QueueConfig, RingRegion};
use super::errors::QueueError;
use super::reader::{BipReader, ReadRegion, SegmentedReadRegion, SegmentedReader};
use super::writer::{BipWriter, SegmentedWriteRegion, SegmentedWriter, WriteRegion};

/// Single-reader/single-writer byte queue that hands out contiguous regions.
///
/// While unsplit, one owner drives both sides. [`split`](BipQueue::split) hands
/// the writer and reader to two threads; [`join`](BipQueue::join) takes them back,
/// which is the only point where [`reset`](BipQueue::reset) is allowed.
pub struct BipQueue {
    writer: BipWriter,
    reader: BipReader,
}

impl BipQueue {
    pub fn new(capacity: usize) -> Result<BipQueue, QueueError> {
        let ring = Arc::new(RingRegion::new(capacity, 1)?);
        debug!(capacity, "bip queue created");
        Ok(BipQueue {
            writer: BipWriter::new(ring.clone()),
            reader: BipReader::new(ring),
        })
    }

    pub fn from_config(cfg: &QueueConfig) -> Result<BipQueue, QueueError> {
        BipQueue::new(cfg.capacity)
    }

    pub fn capacity(&self) -> usize {
        self.writer.capacity()
    }

    pub fn available(&self) -> usize {
        self.reader.available()
    }

    pub fn request_write(&mut self, max_size: usize) -> WriteRegion<'_> {
        self.writer.request_write(max_size)
    }

    pub fn commit_write(&mut self, n: usize) {
        self.writer.commit_write(n)
    }

    pub fn request_read(&mut self) -> ReadRegion<'_> {
        self.reader.request_read()
    }

    pub fn commit_read(&mut self, n: usize) {
        self.reader.commit_read(n)
    }

    pub fn writer(&mut self) -> &mut BipWriter {
        &mut self.writer
    }

    pub fn reader(&mut self) -> &mut BipReader {
        &mut self.reader
    }

    /// Drops everything queued: both cursors back to the start, the whole
    /// buffer writable again.
    pub fn reset(&mut self) {
        self.reader.ring.reset();
        self.writer.pending = Default::default();
        self.reader.pending = Default::default();
        debug!(capacity = self.capacity(), "bip queue reset");
    }

    pub fn split(self) -> (BipWriter, BipReader) {
        (self.writer, self.reader)
    }

    pub fn join(writer: BipWriter, reader: BipReader) -> Result<BipQueue, QueueError> {
        if !Arc::ptr_eq(&writer.ring, &reader.ring) {
            return Err(QueueError::MismatchedHalves);
        }
        Ok(BipQueue { writer, reader })
    }
}

/// A [`BipQueue`] whose buffer is `segment_count` parallel lanes of
/// `segment_size` bytes that always advance together, e.g. one lane per
/// channel of planar audio.
pub struct SegmentedBipQueue {
    writer: SegmentedWriter,
    reader: SegmentedReader,
}

impl SegmentedBipQueue {
    pub fn new(segment_size: usize, segment_count: usize) -> Result<SegmentedBipQueue, QueueError> {
        let ring = Arc::new(RingRegion::new(segment_size, segment_count)?);
        debug!(segment_size, segment_count, "segmented bip queue created");
        Ok(SegmentedBipQueue {
            writer: SegmentedWriter::new(ring.clone()),
            reader: SegmentedReader::new(ring),
        })
    }

    pub fn from_config(cfg: &QueueConfig) -> Result<SegmentedBipQueue, QueueError> {
        SegmentedBipQueue::new(cfg.capacity, cfg.segments)
    }

    pub fn segment_size(&self) -> usize {
        self.writer.segment_size()
    }

    pub fn segment_count(&self) -> usize {
        self.writer.segment_count()
    }

    pub fn available(&self) -> usize {
        self.reader.available()
    }

    pub fn request_write(&mut self, max_size: usize) -> SegmentedWriteRegion<'_> {
        self.writer.request_write(max_size)
    }

    pub fn commit_write(&mut self, n: usize) {
        self.writer.commit_write(n)
    }

    pub fn request_read(&mut self) -> SegmentedReadRegion<'_> {
        self.reader.request_read()
    }

    pub fn commit_read(&mut self, n: usize) {
        self.reader.commit_read(n)
    }

    pub fn writer(&mut self) -> &mut SegmentedWriter {
        &mut self.writer
    }

    pub fn reader(&mut self) -> &mut SegmentedReader {
        &mut self.reader
    }

    pub fn reset(&mut self) {
        self.reader.ring.reset();
        self.writer.pending = Default::default();
        self.reader.pending = Default::default();
        debug!(segment_size = self.segment_size(), "segmented bip queue reset");
    }

    pub fn split(self) -> (SegmentedWriter, SegmentedReader) {
        (self.writer, self.reader)
    }

    pub fn join(writer: SegmentedWriter, reader: SegmentedReader) -> Result<SegmentedBipQueue, QueueError> {
        if !Arc::ptr_eq(&writer.ring, &reader.ring) {
            return Err(QueueError::MismatchedHalves);
        }
        Ok(SegmentedBipQueue { writer, reader })
    }
}
