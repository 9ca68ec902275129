//! Bounded FIFO of frames waiting for a live link.

use std::collections::VecDeque;

use kirpich_proto::frame::ClientFrame;

/// Frames queued for transmission, oldest first.
///
/// When full, pushing evicts the oldest frame and hands it back so the
/// caller can report the drop.
#[derive(Debug)]
pub struct Outbox {
    frames: VecDeque<ClientFrame>,
    capacity: usize,
}

impl Outbox {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Appends a frame, returning the evicted oldest frame on overflow.
    pub fn push(&mut self, frame: ClientFrame) -> Option<ClientFrame> {
        let evicted = if self.frames.len() >= self.capacity {
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(frame);
        evicted
    }

    pub fn pop_front(&mut self) -> Option<ClientFrame> {
        self.frames.pop_front()
    }

    /// Puts a frame back at the head after a failed write.
    pub fn requeue(&mut self, frame: ClientFrame) {
        self.frames.push_front(frame);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
