//! Shared live audio streams
//!
//! An [`AudioStream`] is a broadcast of [`AudioFrame`]s. The local capture and
//! every remote peer stream are `AudioStream`s. Consumers never read the
//! stream directly; each subscribes its own [`StreamView`], so muting or
//! dropping one view cannot starve or silence any other consumer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use uuid::Uuid;

use crate::audio::buffer::AudioFrame;
use crate::constants::STREAM_CAPACITY;

struct StreamShared {
    id: Uuid,
    sample_rate: u32,
    channels: u16,
    sequence: AtomicU32,
    started: Instant,
}

/// Cloneable handle to a live stream; any clone may produce or subscribe
#[derive(Clone)]
pub struct AudioStream {
    tx: broadcast::Sender<AudioFrame>,
    shared: Arc<StreamShared>,
}

impl AudioStream {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self::with_capacity(sample_rate, channels, STREAM_CAPACITY)
    }

    pub fn with_capacity(sample_rate: u32, channels: u16, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            shared: Arc::new(StreamShared {
                id: Uuid::new_v4(),
                sample_rate,
                channels: channels.max(1),
                sequence: AtomicU32::new(0),
                started: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.shared.channels
    }

    /// Publish interleaved samples. Returns the number of live views reached.
    pub fn push(&self, samples: &[f32]) -> usize {
        let sequence = self.shared.sequence.fetch_add(1, Ordering::Relaxed);
        let timestamp = self.shared.started.elapsed().as_micros() as u64;
        let frame = AudioFrame::new(
            samples.to_vec(),
            self.shared.channels,
            self.shared.sample_rate,
            timestamp,
            sequence,
        );
        self.tx.send(frame).unwrap_or(0)
    }

    /// Obtain an independent view of the stream
    pub fn subscribe(&self) -> StreamView {
        StreamView {
            rx: self.tx.subscribe(),
            stream_id: self.shared.id,
            muted: false,
            lagged: 0,
        }
    }

    /// Number of live views
    pub fn view_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Frames published so far
    pub fn frames_published(&self) -> u32 {
        self.shared.sequence.load(Ordering::Relaxed)
    }

    pub fn same_stream(&self, other: &AudioStream) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStream")
            .field("id", &self.shared.id)
            .field("sample_rate", &self.shared.sample_rate)
            .field("channels", &self.shared.channels)
            .finish()
    }
}

/// One consumer's private read position on an [`AudioStream`]
pub struct StreamView {
    rx: broadcast::Receiver<AudioFrame>,
    stream_id: Uuid,
    muted: bool,
    lagged: u64,
}

impl StreamView {
    pub fn stream_id(&self) -> Uuid {
        self.stream_id
    }

    /// Mute this view only; frames are replaced by silence
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Frames skipped because this view fell behind
    pub fn lagged_frames(&self) -> u64 {
        self.lagged
    }

    /// Next frame; `None` once every producer handle is gone
    pub async fn next_frame(&mut self) -> Option<AudioFrame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Some(self.apply_mute(frame)),
                Err(RecvError::Lagged(n)) => {
                    self.lagged += n;
                    tracing::warn!("Stream view {} lagged, skipped {} frames", self.stream_id, n);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next frame if one is already buffered
    pub fn try_next_frame(&mut self) -> Option<AudioFrame> {
        loop {
            match self.rx.try_recv() {
                Ok(frame) => return Some(self.apply_mute(frame)),
                Err(TryRecvError::Lagged(n)) => self.lagged += n,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn apply_mute(&self, frame: AudioFrame) -> AudioFrame {
        if !self.muted {
            return frame;
        }
        AudioFrame {
            samples: vec![0.0; frame.samples.len()].into(),
            ..frame
        }
    }
}
