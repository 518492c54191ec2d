//! Shared-memory frame channel properties across attach boundaries.
//!
//! The unit tests cover the slot protocol in-process; these tests exercise
//! the path a display client actually takes: attach to an existing channel
//! file with `open()` and read what another handle published.

use std::sync::Arc;
use std::thread;

use isi_daq::core::Frame;
use isi_daq::transport::shm::FrameChannel;

fn patterned_frame(sequence: u64, width: u32, height: u32) -> Frame {
    let mut pixels = Vec::with_capacity((width * height * 2) as usize);
    for i in 0..(width * height) as u64 {
        let v = ((sequence * 31 + i * 7) % 65_536) as u16;
        pixels.extend_from_slice(&v.to_le_bytes());
    }
    Frame::new(sequence, sequence as i64 * 33_333, width, height, 2, pixels.into()).unwrap()
}

#[test]
fn publish_and_read_back_through_a_second_attachment() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("camera.ring");

    let producer = FrameChannel::create(&path, 4, 32, 32, 2).unwrap();
    let consumer = FrameChannel::open(&path).unwrap();

    let frame = patterned_frame(3, 32, 32);
    producer.publish(&frame).unwrap();

    // A reader on the second attachment sees the exact bytes.
    let read = consumer.read_latest().unwrap().expect("frame present");
    assert_eq!(read.sequence_id, frame.sequence_id);
    assert_eq!(read.timestamp_us, frame.timestamp_us);
    assert_eq!((read.width, read.height, read.channel_depth), (32, 32, 2));
    assert_eq!(&read.pixel_buffer[..], &frame.pixel_buffer[..]);
}

#[test]
fn sequence_counter_exposes_gaps_to_slow_readers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("camera.ring");
    let channel = FrameChannel::create(&path, 2, 16, 16, 2).unwrap();

    for i in 0..7 {
        channel.publish(&patterned_frame(i, 16, 16)).unwrap();
    }

    // A reader that was away can tell how much it missed.
    let consumer = FrameChannel::open(&path).unwrap();
    assert_eq!(consumer.published(), 7);
    // Only the newest slots are still available in a 2-slot ring.
    let latest = consumer.read_latest().unwrap().expect("frame present");
    assert_eq!(latest.sequence_id, 6);
}

#[test]
fn concurrent_writer_never_yields_torn_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("camera.ring");
    let producer = Arc::new(FrameChannel::create(&path, 3, 64, 64, 2).unwrap());

    let writer = {
        let producer = Arc::clone(&producer);
        thread::spawn(move || {
            for i in 0..2_000u64 {
                producer.publish(&patterned_frame(i, 64, 64)).unwrap();
            }
        })
    };

    let reader = thread::spawn(move || {
        let consumer = FrameChannel::open(&path).unwrap();
        let mut checked = 0u32;
        while checked < 200 {
            match consumer.read_latest() {
                Ok(Some(frame)) => {
                    // Recompute the pattern from the header: any mix of two
                    // writes would break it.
                    let expected = patterned_frame(frame.sequence_id, 64, 64);
                    assert_eq!(&frame.pixel_buffer[..], &expected.pixel_buffer[..]);
                    checked += 1;
                }
                Ok(None) => {}
                // A persistently torn read is legal under contention; the
                // protocol only promises it is detected, not avoided.
                Err(_) => {}
            }
        }
    });

    writer.join().unwrap();
    reader.join().unwrap();
}
