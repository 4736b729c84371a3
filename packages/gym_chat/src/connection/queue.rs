use std::collections::VecDeque;

/// Bounded FIFO of encoded frames waiting for a channel to open.
///
/// A capacity of zero disables queueing entirely.
#[derive(Debug)]
pub(crate) struct OutboundQueue {
    frames: VecDeque<String>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Returns false when full (or disabled).
    pub fn enqueue(&mut self, frame: String) -> bool {
        if self.frames.len() >= self.capacity {
            return false;
        }
        self.frames.push_back(frame);
        true
    }

    /// Put frames that were handed to a dead connection back at the head,
    /// oldest first. Returns how many did not fit.
    pub fn requeue_front(&mut self, frames: Vec<String>) -> usize {
        let room = self.capacity.saturating_sub(self.frames.len());
        let total = frames.len();
        let kept = total.min(room);
        for frame in frames.into_iter().take(kept).rev() {
            self.frames.push_front(frame);
        }
        total - kept
    }

    pub fn drain(&mut self) -> Vec<String> {
        self.frames.drain(..).collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
