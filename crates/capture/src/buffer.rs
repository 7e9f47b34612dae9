use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use ptzcam_core::Frame;

/// Slots per camera. Freshness wins over completeness.
pub const FRAME_BUFFER_CAPACITY: usize = 2;

/// Two-slot, drop-oldest exchange of the latest frames of one camera.
///
/// Producer and consumer only ever contend on the short critical section
/// guarding the slots; neither side blocks waiting for the other.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    slots: Mutex<Slots>,
}

#[derive(Debug, Default)]
struct Slots {
    frames: VecDeque<Frame>,
    // Bumped by every drain so publishers created earlier go stale.
    generation: u64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a frame, evicting the oldest one when full. Returns the
    /// evicted frame, if any.
    pub fn publish(&self, frame: Frame) -> Option<Frame> {
        let mut slots = self.slots.lock();
        push_bounded(&mut slots.frames, frame)
    }

    /// Removes and returns the oldest held frame.
    pub fn try_take(&self) -> Option<Frame> {
        self.slots.lock().frames.pop_front()
    }

    /// Empties the buffer and invalidates every existing [`Publisher`].
    /// Returns how many frames were discarded.
    pub fn drain(&self) -> usize {
        let mut slots = self.slots.lock();
        slots.generation += 1;
        let dropped = slots.frames.len();
        slots.frames.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.slots.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write handle bound to the buffer's current generation.
    pub fn publisher(self: &Arc<Self>) -> Publisher {
        let generation = self.slots.lock().generation;
        Publisher {
            buffer: Arc::clone(self),
            generation,
        }
    }
}

fn push_bounded(frames: &mut VecDeque<Frame>, frame: Frame) -> Option<Frame> {
    let evicted = if frames.len() >= FRAME_BUFFER_CAPACITY {
        frames.pop_front()
    } else {
        None
    };
    frames.push_back(frame);
    evicted
}

/// Producer side of a [`FrameBuffer`] owned by one ingestion worker.
///
/// Once the buffer has been drained, publishing through an older handle is
/// refused, so a worker that outlived its stop request can never leak a
/// stale frame into a restarted stream.
#[derive(Debug, Clone)]
pub struct Publisher {
    buffer: Arc<FrameBuffer>,
    generation: u64,
}

impl Publisher {
    /// Returns `false` when the frame was refused because the buffer was
    /// drained after this publisher was created.
    pub fn publish(&self, frame: Frame) -> bool {
        let mut slots = self.buffer.slots.lock();
        if slots.generation != self.generation {
            return false;
        }
        push_bounded(&mut slots.frames, frame);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::SystemTime;

    fn frame(sequence: usize) -> Frame {
        Frame {
            width: 640,
            height: 480,
            timestamp: SystemTime::now(),
            sequence,
            data: Bytes::from_static(b"jpeg"),
        }
    }

    #[test]
    fn test_never_holds_more_than_two() {
        let buffer = FrameBuffer::new();
        for i in 0..10 {
            buffer.publish(frame(i));
            assert!(buffer.len() <= FRAME_BUFFER_CAPACITY);
        }
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_drop_oldest_and_take_oldest_first() {
        let buffer = FrameBuffer::new();
        assert!(buffer.publish(frame(1)).is_none());
        assert!(buffer.publish(frame(2)).is_none());
        let evicted = buffer.publish(frame(3)).map(|f| f.sequence);
        assert_eq!(evicted, Some(1));

        assert_eq!(buffer.try_take().map(|f| f.sequence), Some(2));
        buffer.publish(frame(4));
        assert_eq!(buffer.try_take().map(|f| f.sequence), Some(3));
        assert_eq!(buffer.try_take().map(|f| f.sequence), Some(4));
        assert!(buffer.try_take().is_none());
    }

    #[test]
    fn test_drain_empties_and_invalidates_publishers() {
        let buffer = Arc::new(FrameBuffer::new());
        let old = buffer.publisher();
        assert!(old.publish(frame(1)));
        assert!(old.publish(frame(2)));

        assert_eq!(buffer.drain(), 2);
        assert!(buffer.is_empty());
        assert!(!old.publish(frame(3)));
        assert!(buffer.is_empty());

        let fresh = buffer.publisher();
        assert!(fresh.publish(frame(4)));
        assert_eq!(buffer.try_take().map(|f| f.sequence), Some(4));
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let buffer = Arc::new(FrameBuffer::new());
        let publisher = buffer.publisher();
        let producer = std::thread::spawn(move || {
            for i in 0..1000 {
                publisher.publish(frame(i));
            }
        });

        let mut last = None;
        while !producer.is_finished() || !buffer.is_empty() {
            assert!(buffer.len() <= FRAME_BUFFER_CAPACITY);
            if let Some(f) = buffer.try_take() {
                if let Some(prev) = last {
                    assert!(f.sequence > prev);
                }
                last = Some(f.sequence);
            }
        }
        producer.join().unwrap();
    }
}
