//! Audio frames, decoded buffers and the outbound send queue
//!
//! The send queue is a bounded lock-free queue with a drop-oldest policy, so
//! producers on the capture path never wait on the network.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Audio frame containing interleaved samples
#[derive(Clone, Debug)]
pub struct AudioFrame {
    /// Interleaved audio samples (f32), immutable once produced
    pub samples: Arc<[f32]>,
    /// Number of channels
    pub channels: u16,
    /// Sample rate of `samples`
    pub sample_rate: u32,
    /// Timestamp in microseconds since the stream started
    pub timestamp: u64,
    /// Frame sequence number
    pub sequence: u32,
}

impl AudioFrame {
    pub fn new(
        samples: impl Into<Arc<[f32]>>,
        channels: u16,
        sample_rate: u32,
        timestamp: u64,
        sequence: u32,
    ) -> Self {
        Self {
            samples: samples.into(),
            channels,
            sample_rate,
            timestamp,
            sequence,
        }
    }

    /// Get number of samples per channel
    pub fn samples_per_channel(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Get frame duration in microseconds
    pub fn duration_us(&self) -> u64 {
        (self.samples_per_channel() as u64 * 1_000_000) / self.sample_rate.max(1) as u64
    }

    /// Average the channels into one mono signal
    pub fn to_mono(&self) -> Vec<f32> {
        let channels = self.channels.max(1) as usize;
        if channels == 1 {
            return self.samples.to_vec();
        }
        self.samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }
}

/// Decoded mono audio ready to be placed on the output timeline
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate.max(1) as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample at a time offset (seconds) from the buffer start
    pub fn sample_at(&self, offset: f64) -> Option<f32> {
        // Small bias so timeline positions that land on a sample boundary
        // are not lost to floating point error.
        let position = offset * self.sample_rate as f64 + 1e-6;
        if position < 0.0 {
            return None;
        }
        self.samples.get(position as usize).copied()
    }
}

/// Bounded queue that evicts the oldest entry when full
pub struct SendQueue<T> {
    queue: ArrayQueue<T>,
    notify: Notify,
    dropped: AtomicUsize,
}

impl<T> SendQueue<T> {
    /// Create a new queue with the specified capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            notify: Notify::new(),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Push an item, evicting the oldest one if the queue is full.
    /// Returns true if an item was dropped.
    pub fn push(&self, item: T) -> bool {
        let evicted = self.queue.force_push(item).is_some();
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Wait until an item is available
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.queue.pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Items evicted so far
    pub fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Discard everything queued
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_mono_and_duration() {
        let frame = AudioFrame::new(vec![0.5, -0.5, 1.0, 0.0], 2, 16000, 0, 0);
        assert_eq!(frame.samples_per_channel(), 2);
        assert_eq!(frame.to_mono(), vec![0.0, 0.5]);
        assert_eq!(frame.duration_us(), 125);
    }

    #[test]
    fn test_buffer_duration() {
        let buffer = AudioBuffer::new(vec![0.0; 12000], 24000);
        assert!((buffer.duration() - 0.5).abs() < f64::EPSILON);
        assert_eq!(buffer.sample_at(0.25), Some(0.0));
        assert_eq!(buffer.sample_at(0.5), None);
        assert_eq!(buffer.sample_at(-0.1), None);
    }

    #[test]
    fn test_send_queue_drops_oldest() {
        let queue = SendQueue::new(2);
        assert!(!queue.push(1));
        assert!(!queue.push(2));
        assert!(queue.push(3));

        assert_eq!(queue.dropped_count(), 1);
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_send_queue_wakes_consumer() {
        let queue = Arc::new(SendQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(42u32);
        assert_eq!(consumer.await.unwrap(), 42);
    }
}
