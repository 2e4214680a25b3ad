//! Bounded queue for captured microphone frames
//!
//! The capture callback pushes frames; the connection pump pops them. When
//! the queue is full the oldest frame is evicted so that the newest audio
//! always reaches the service.
//!
//! # Memory Budget
//!
//! At 24kHz mono PCM16 with 100ms frames:
//! - Frame size: 2400 samples × 2 bytes = 4,800 bytes
//! - 50 frames (5 seconds) = 240 KB

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use super::{AudioFrame, Direction};

/// Drop-oldest frame queue shared between the capture thread and the pump
#[derive(Debug)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<AudioFrame>>,
    capacity: usize,
    next_sequence: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            next_sequence: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<AudioFrame>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push a new frame, evicting the oldest if at capacity.
    ///
    /// Returns the sequence number assigned to the frame, or `None` once the
    /// queue has been closed.
    pub fn push(&self, samples: Vec<i16>) -> Option<u64> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        {
            let mut frames = self.lock();
            if frames.len() >= self.capacity {
                frames.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 50 == 0 {
                    log::warn!("Capture queue full, dropped {} frame(s) so far", dropped);
                }
            }
            frames.push_back(AudioFrame::new(samples, Direction::Outbound, sequence));
        }
        self.notify.notify_one();
        Some(sequence)
    }

    pub fn try_pop(&self) -> Option<AudioFrame> {
        self.lock().pop_front()
    }

    /// Wait for the next frame. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<AudioFrame> {
        loop {
            let notified = self.notify.notified();
            if let Some(frame) = self.try_pop() {
                return Some(frame);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Stop accepting frames and wake any waiting consumer
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Discard queued frames without closing
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames evicted because the consumer fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Total frames ever accepted
    pub fn pushed(&self) -> u64 {
        self.next_sequence.load(Ordering::Relaxed)
    }
}
