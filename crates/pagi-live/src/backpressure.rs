//! Input backpressure queue: microphone frames held back while a tool call is
//! outstanding, released in FIFO order once the session is free again.

use crate::codec::OutboundFrame;
use std::collections::VecDeque;
use std::time::Duration;

/// Ordered, unbounded, size-observable buffer of not-yet-sent frames.
#[derive(Debug, Default)]
pub struct InputQueue {
    frames: VecDeque<OutboundFrame>,
    high_water: usize,
    total_held: u64,
}

impl InputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: OutboundFrame) {
        self.frames.push_back(frame);
        self.total_held += 1;
        self.high_water = self.high_water.max(self.frames.len());
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Audio currently held back.
    pub fn buffered_duration(&self) -> Duration {
        self.frames.iter().map(|f| f.duration()).sum()
    }

    /// Largest length the queue ever reached.
    pub fn high_water_mark(&self) -> usize {
        self.high_water
    }

    /// Frames held since the queue was created.
    pub fn total_held(&self) -> u64 {
        self.total_held
    }

    /// Take every held frame, oldest first, leaving the queue empty.
    pub fn drain(&mut self) -> impl Iterator<Item = OutboundFrame> + '_ {
        self.frames.drain(..)
    }

    /// Throw away held frames (session closed). Returns how many were dropped.
    pub fn discard(&mut self) -> usize {
        let n = self.frames.len();
        self.frames.clear();
        n
    }
}
