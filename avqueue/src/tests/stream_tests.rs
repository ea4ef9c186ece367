use std::{
    convert::TryInto,
    error::Error,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
    thread,
};

use proptest::prelude::*;

use crate::{
    queue::{BipQueue, SegmentedBipQueue},
    reader::BipReader,
    writer::BipWriter,
    QueueConfig,
};

#[derive(Debug, Clone, PartialEq)]
struct StreamTestMessage {
    id: u64,
    data: Vec<u8>,
}

impl StreamTestMessage {
    fn new(id: u64, size: usize) -> Self {
        let val = (id % 250) as u8;
        StreamTestMessage {
            id,
            data: vec![val; size],
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(12 + self.data.len());
        bytes.extend_from_slice(&self.id.to_le_bytes());
        bytes.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.data);
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 12 {
            return None;
        }
        let id = u64::from_le_bytes(bytes[0..8].try_into().ok()?);
        let data_len = u32::from_le_bytes(bytes[8..12].try_into().ok()?) as usize;
        if bytes.len() < 12 + data_len {
            return None;
        }
        Some(StreamTestMessage {
            id,
            data: bytes[12..12 + data_len].to_vec(),
        })
    }

    fn is_consistent(&self) -> bool {
        let expected_val = (self.id % 250) as u8;
        self.data.iter().all(|&byte| byte == expected_val)
    }
}

/// Pushes all of `bytes`, spinning while the reader catches up.
fn write_all(writer: &mut BipWriter, bytes: &[u8]) {
    let mut written = 0;
    while written < bytes.len() {
        let n = writer.write(&bytes[written..]);
        if n == 0 {
            thread::yield_now();
        }
        written += n;
    }
}

fn read_exact(reader: &mut BipReader, out: &mut [u8], stop: &AtomicBool) -> bool {
    let mut read = 0;
    while read < out.len() {
        let n = reader.read(&mut out[read..]);
        if n == 0 {
            if stop.load(AtomicOrdering::Acquire) && reader.available() == 0 {
                return false;
            }
            thread::yield_now();
        }
        read += n;
    }
    true
}

#[test]
fn test_stream_message_serialization() {
    let original = StreamTestMessage::new(12345, 32);
    let decoded = StreamTestMessage::from_bytes(&original.to_bytes()).expect("decode failed");
    assert_eq!(original, decoded);
    assert!(decoded.is_consistent());
    assert!(StreamTestMessage::from_bytes(&[0u8; 11]).is_none());
}

#[test]
fn test_writer_and_reader_threads_keep_messages_in_order() -> Result<(), Box<dyn Error>> {
    let message_count = 20_000u64;
    // Small and odd sized so that messages straddle the wrap point often.
    let (mut writer, mut reader) = BipQueue::new(1021)?.split();
    let done = Arc::new(AtomicBool::new(false));

    let writer_done = Arc::clone(&done);
    let writer_thread = thread::spawn(move || {
        for id in 0..message_count {
            let msg = StreamTestMessage::new(id, (id % 97) as usize);
            write_all(&mut writer, &msg.to_bytes());
        }
        writer_done.store(true, AtomicOrdering::Release);
        writer
    });

    let reader_done = Arc::clone(&done);
    let reader_thread = thread::spawn(move || {
        let mut next_id = 0u64;
        let mut header = [0u8; 12];
        while read_exact(&mut reader, &mut header, &reader_done) {
            let data_len = u32::from_le_bytes(header[8..12].try_into().expect("4 bytes")) as usize;
            let mut frame = header.to_vec();
            frame.resize(12 + data_len, 0);
            assert!(read_exact(&mut reader, &mut frame[12..], &reader_done), "frame cut short");
            let msg = StreamTestMessage::from_bytes(&frame).expect("frame decodes");
            assert_eq!(msg.id, next_id, "messages out of order");
            assert!(msg.is_consistent(), "torn message {}", msg.id);
            next_id += 1;
        }
        (next_id, reader)
    });

    let writer = writer_thread.join().expect("writer thread panicked");
    let (received, reader) = reader_thread.join().expect("reader thread panicked");
    assert_eq!(received, message_count);

    let mut queue = BipQueue::join(writer, reader)?;
    assert_eq!(queue.available(), 0);
    queue.reset();
    assert_eq!(queue.request_write(1021).len(), 1021);
    Ok(())
}

#[test]
fn test_segmented_lanes_stay_in_lock_step_across_threads() -> Result<(), Box<dyn Error>> {
    let total = 200_000usize;
    let cfg = QueueConfig { capacity: 509, segments: 4 };
    let (mut writer, mut reader) = SegmentedBipQueue::from_config(&cfg)?.split();

    let writer_thread = thread::spawn(move || {
        let mut sent = 0usize;
        while sent < total {
            let mut region = writer.request_write(64usize.min(total - sent));
            let n = region.len();
            if n == 0 {
                thread::yield_now();
                continue;
            }
            for lane in 0..region.lane_count() {
                for (i, byte) in region.lane_mut(lane).iter_mut().enumerate() {
                    *byte = ((sent + i) as u8).wrapping_add(lane as u8);
                }
            }
            writer.commit_write(n);
            sent += n;
        }
    });

    let mut received = 0usize;
    while received < total {
        let region = reader.request_read();
        let n = region.len();
        if n == 0 {
            thread::yield_now();
            continue;
        }
        for (lane, bytes) in region.lanes().enumerate() {
            assert_eq!(bytes.len(), n);
            for (i, &byte) in bytes.iter().enumerate() {
                assert_eq!(byte, ((received + i) as u8).wrapping_add(lane as u8));
            }
        }
        reader.commit_read(n);
        received += n;
    }
    writer_thread.join().expect("writer thread panicked");
    assert_eq!(reader.available(), 0);
    Ok(())
}

#[derive(Debug, Clone)]
enum Op {
    Write(Vec<u8>),
    Read(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..48).prop_map(Op::Write),
        (0usize..64).prop_map(Op::Read),
    ]
}

proptest! {
    #[test]
    fn bytes_come_out_in_the_order_they_went_in(
        capacity in 1usize..128,
        ops in prop::collection::vec(op(), 1..200),
    ) {
        let mut queue = BipQueue::new(capacity).expect("capacity is positive");
        let mut model = std::collections::VecDeque::new();
        for op in ops {
            match op {
                Op::Write(bytes) => {
                    let n = queue.writer().write(&bytes);
                    prop_assert!(n <= bytes.len());
                    model.extend(&bytes[..n]);
                }
                Op::Read(len) => {
                    let mut out = vec![0u8; len];
                    let n = queue.reader().read(&mut out);
                    prop_assert!(n <= model.len(), "read more than was committed");
                    let expected: Vec<u8> = model.drain(..n).collect();
                    prop_assert_eq!(&out[..n], &expected[..]);
                }
            }
            prop_assert_eq!(queue.available(), model.len());
            prop_assert!(model.len() <= capacity);
        }
    }

    #[test]
    fn grants_respect_request_and_buffer_end(
        capacity in 1usize..256,
        requests in prop::collection::vec((0usize..300, 0usize..300), 1..100),
    ) {
        let mut queue = BipQueue::new(capacity).expect("capacity is positive");
        let base = queue.writer().ring.lane_ptr(0, 0) as usize;
        for (max, consume) in requests {
            let (offset, len) = {
                let region = queue.request_write(max);
                (region.as_ptr() as usize - base, region.len())
            };
            prop_assert!(len <= max);
            prop_assert!(offset + len <= capacity, "region runs past the buffer end");
            queue.commit_write(len);

            let readable = queue.request_read().len();
            queue.commit_read(consume.min(readable));
        }
    }
}
