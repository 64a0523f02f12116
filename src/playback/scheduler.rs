//! Playback scheduler
//!
//! Places decoded chunks back to back on the output timeline so consecutive
//! chunks of one utterance play without gaps, and flushes everything at once
//! when the remote agent is interrupted.
//!
//! All scheduling decisions, including the speaking signal, are made
//! synchronously under one short lock; the only asynchronous parts are the
//! completion pump (natural source ends reported by the output) and the
//! release timer that lowers the speaking signal.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::buffer::AudioBuffer;
use crate::codec;
use crate::error::CodecError;
use crate::playback::output::{AudioOutput, SourceId, SourceStart};

/// Lifecycle of a playback source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Start time is still ahead of the output clock
    Scheduled,
    /// Output clock is inside the source
    Playing,
    /// Played to the end or force-stopped
    Finished,
}

/// Snapshot of a source on the timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSource {
    pub id: SourceId,
    pub start_time: f64,
    pub duration: f64,
    pub state: SourceState,
}

impl PlaybackSource {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveSource {
    start_time: f64,
    duration: f64,
}

struct Timeline {
    next_start_time: f64,
    active: HashMap<SourceId, ActiveSource>,
    /// Bumped on every schedule and interrupt; pending release timers compare it
    generation: u64,
}

/// Scheduler statistics
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub chunks_scheduled: u64,
    pub chunks_dropped: u64,
    pub interruptions: u64,
}

/// Owns the output timeline for one voice (the agent, or one peer)
pub struct PlaybackScheduler {
    label: String,
    output: Arc<dyn AudioOutput>,
    timeline: Arc<Mutex<Timeline>>,
    speaking_tx: watch::Sender<bool>,
    ended_tx: mpsc::UnboundedSender<SourceId>,
    ended_rx: Mutex<Option<mpsc::UnboundedReceiver<SourceId>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    release: Duration,
    /// Runtime for release timers; end reports may come from any thread
    runtime: Option<Handle>,
    /// Only set while holding the timeline lock
    closed: AtomicBool,
    chunks_scheduled: AtomicU64,
    chunks_dropped: AtomicU64,
    interruptions: AtomicU64,
}

impl PlaybackScheduler {
    /// Create a scheduler without a completion pump; natural ends must be
    /// reported through [`PlaybackScheduler::source_ended`]. Outside a Tokio
    /// runtime the speaking signal is released without the delay.
    pub fn new(label: impl Into<String>, output: Arc<dyn AudioOutput>, release: Duration) -> Self {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let (speaking_tx, _) = watch::channel(false);
        let now = output.current_time();
        Self {
            label: label.into(),
            output,
            timeline: Arc::new(Mutex::new(Timeline {
                next_start_time: now,
                active: HashMap::new(),
                generation: 0,
            })),
            speaking_tx,
            ended_tx,
            ended_rx: Mutex::new(Some(ended_rx)),
            pump: Mutex::new(None),
            release,
            runtime: Handle::try_current().ok(),
            closed: AtomicBool::new(false),
            chunks_scheduled: AtomicU64::new(0),
            chunks_dropped: AtomicU64::new(0),
            interruptions: AtomicU64::new(0),
        }
    }

    /// Create a scheduler and spawn its completion pump on the current runtime
    pub fn start(label: impl Into<String>, output: Arc<dyn AudioOutput>, release: Duration) -> Arc<Self> {
        let scheduler = Arc::new(Self::new(label, output, release));
        scheduler.spawn_completion_pump();
        scheduler
    }

    fn spawn_completion_pump(self: &Arc<Self>) {
        let Some(mut rx) = self.ended_rx.lock().take() else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(id) = rx.recv().await {
                match weak.upgrade() {
                    Some(scheduler) => scheduler.source_ended(id),
                    None => break,
                }
            }
        });
        *self.pump.lock() = Some(handle);
    }

    /// Decode a base64 PCM16 chunk and append it to the timeline.
    ///
    /// Returns `Ok(None)` once the scheduler has been shut down. A chunk that
    /// cannot be decoded is dropped without touching the timeline.
    pub fn schedule_chunk(
        &self,
        payload: &str,
        sample_rate: u32,
    ) -> Result<Option<PlaybackSource>, CodecError> {
        let samples = match codec::decode(payload) {
            Ok(samples) => samples,
            Err(e) => {
                self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("[{}] Dropping undecodable chunk: {}", self.label, e);
                return Err(e);
            }
        };
        self.schedule_buffer(AudioBuffer::new(samples, sample_rate))
    }

    /// Append decoded audio to the timeline
    pub fn schedule_buffer(&self, buffer: AudioBuffer) -> Result<Option<PlaybackSource>, CodecError> {
        if buffer.is_empty() {
            self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("[{}] Dropping empty chunk", self.label);
            return Err(CodecError::Empty);
        }
        let duration = buffer.duration();
        let id = SourceId::next();

        let mut timeline = self.timeline.lock();
        if self.closed.load(Ordering::SeqCst) {
            drop(timeline);
            tracing::debug!("[{}] Scheduler closed, ignoring chunk", self.label);
            return Ok(None);
        }
        let now = self.output.current_time();
        let start_time = timeline.next_start_time.max(now);
        timeline.next_start_time = start_time + duration;
        timeline.generation += 1;
        timeline.active.insert(id, ActiveSource { start_time, duration });

        self.output.start(SourceStart {
            id,
            buffer: Arc::new(buffer),
            start_time,
            on_end: self.ended_tx.clone(),
        });
        self.speaking_tx.send_if_modified(|speaking| !std::mem::replace(speaking, true));
        drop(timeline);

        self.chunks_scheduled.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            "[{}] Scheduled {} at {:.3}s for {:.3}s",
            self.label,
            id,
            start_time,
            duration
        );

        Ok(Some(PlaybackSource {
            id,
            start_time,
            duration,
            state: if start_time > now {
                SourceState::Scheduled
            } else {
                SourceState::Playing
            },
        }))
    }

    /// Report that a source played to its end. Unknown or already-stopped
    /// sources are ignored, so each source leaves the active set once.
    pub fn source_ended(&self, id: SourceId) {
        let mut timeline = self.timeline.lock();
        if timeline.active.remove(&id).is_none() {
            return;
        }
        if !timeline.active.is_empty() {
            return;
        }
        let generation = timeline.generation;
        drop(timeline);

        let speaking_tx = self.speaking_tx.clone();
        let timeline = self.timeline.clone();
        let label = self.label.clone();
        let Some(runtime) = self.runtime.as_ref() else {
            release_speaking(&timeline, generation, &speaking_tx, &label);
            return;
        };
        let release = self.release;
        runtime.spawn(async move {
            tokio::time::sleep(release).await;
            release_speaking(&timeline, generation, &speaking_tx, &label);
        });
    }

    /// Flush the timeline immediately (barge-in)
    pub fn interrupt(&self) {
        let mut timeline = self.timeline.lock();
        let now = self.output.current_time();
        let stopped: Vec<SourceId> = timeline.active.drain().map(|(id, _)| id).collect();
        for id in &stopped {
            self.output.stop(*id);
        }
        timeline.next_start_time = now;
        timeline.generation += 1;
        self.speaking_tx.send_replace(false);
        drop(timeline);

        self.interruptions.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            "[{}] Interrupted: stopped {} sources, timeline reset to {:.3}s",
            self.label,
            stopped.len(),
            now
        );
    }

    /// Stop playback and refuse further chunks. Idempotent.
    pub fn shutdown(&self) {
        let timeline = self.timeline.lock();
        let already_closed = self.closed.swap(true, Ordering::SeqCst);
        drop(timeline);
        if already_closed {
            return;
        }
        self.interrupt();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Timeline cursor: where the next chunk would start
    pub fn next_start_time(&self) -> f64 {
        self.timeline.lock().next_start_time
    }

    pub fn active_count(&self) -> usize {
        self.timeline.lock().active.len()
    }

    /// Active sources ordered by start time
    pub fn active_sources(&self) -> Vec<PlaybackSource> {
        let now = self.output.current_time();
        let timeline = self.timeline.lock();
        let mut sources: Vec<PlaybackSource> = timeline
            .active
            .iter()
            .map(|(id, s)| PlaybackSource {
                id: *id,
                start_time: s.start_time,
                duration: s.duration,
                state: if s.start_time > now {
                    SourceState::Scheduled
                } else {
                    SourceState::Playing
                },
            })
            .collect();
        sources.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
        sources
    }

    /// State of a source issued by this scheduler
    pub fn source_state(&self, id: SourceId) -> SourceState {
        self.active_sources()
            .into_iter()
            .find(|s| s.id == id)
            .map(|s| s.state)
            .unwrap_or(SourceState::Finished)
    }

    /// Speaking signal: raised on every scheduled chunk, lowered after the
    /// release delay once nothing is left, or immediately on interrupt
    pub fn speaking(&self) -> watch::Receiver<bool> {
        self.speaking_tx.subscribe()
    }

    pub fn is_speaking(&self) -> bool {
        *self.speaking_tx.borrow()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            chunks_scheduled: self.chunks_scheduled.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
        }
    }
}

/// Lower the speaking signal unless a chunk or an interrupt came after
/// `generation`
fn release_speaking(
    timeline: &Mutex<Timeline>,
    generation: u64,
    speaking_tx: &watch::Sender<bool>,
    label: &str,
) {
    let timeline = timeline.lock();
    if timeline.generation != generation || !timeline.active.is_empty() {
        return;
    }
    if speaking_tx.send_if_modified(|speaking| std::mem::replace(speaking, false)) {
        tracing::debug!("[{}] Stopped speaking", label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Output with a hand-driven clock that records what it was asked to do
    #[derive(Default)]
    struct FakeOutput {
        now: Mutex<f64>,
        started: Mutex<Vec<SourceStart>>,
        stopped: Mutex<Vec<SourceId>>,
    }

    impl FakeOutput {
        fn set_time(&self, t: f64) {
            *self.now.lock() = t;
        }

        /// Report every started source as finished, like the mixer would
        fn finish_all(&self) {
            for source in self.started.lock().drain(..) {
                let _ = source.on_end.send(source.id);
            }
        }
    }

    impl AudioOutput for FakeOutput {
        fn current_time(&self) -> f64 {
            *self.now.lock()
        }

        fn start(&self, source: SourceStart) {
            self.started.lock().push(source);
        }

        fn stop(&self, id: SourceId) {
            self.started.lock().retain(|s| s.id != id);
            self.stopped.lock().push(id);
        }
    }

    fn scheduler() -> (Arc<FakeOutput>, PlaybackScheduler) {
        let output = Arc::new(FakeOutput::default());
        let scheduler = PlaybackScheduler::new("test", output.clone(), Duration::from_millis(200));
        (output, scheduler)
    }

    /// Half a second of audio at 24kHz, base64 encoded
    fn half_second() -> String {
        codec::encode(&vec![0.1; 12_000], 0).data
    }

    fn start_of(result: Result<Option<PlaybackSource>, CodecError>) -> f64 {
        result.unwrap().unwrap().start_time
    }

    #[test]
    fn test_chunks_are_contiguous() {
        let (_output, scheduler) = scheduler();
        let chunk = half_second();

        assert_eq!(start_of(scheduler.schedule_chunk(&chunk, 24_000)), 0.0);
        assert_eq!(start_of(scheduler.schedule_chunk(&chunk, 24_000)), 0.5);
        assert_eq!(start_of(scheduler.schedule_chunk(&chunk, 24_000)), 1.0);
        assert_eq!(scheduler.next_start_time(), 1.5);
        assert_eq!(scheduler.active_count(), 3);
        assert!(scheduler.is_speaking());
    }

    #[test]
    fn test_late_chunk_starts_at_clock() {
        let (output, scheduler) = scheduler();
        scheduler.schedule_chunk(&half_second(), 24_000).unwrap();

        output.set_time(3.0);
        assert_eq!(start_of(scheduler.schedule_chunk(&half_second(), 24_000)), 3.0);
        assert_eq!(scheduler.next_start_time(), 3.5);
    }

    #[test]
    fn test_source_states_follow_clock() {
        let (output, scheduler) = scheduler();
        let first = scheduler.schedule_chunk(&half_second(), 24_000).unwrap().unwrap();
        let second = scheduler.schedule_chunk(&half_second(), 24_000).unwrap().unwrap();
        assert_eq!(first.state, SourceState::Playing);
        assert_eq!(second.state, SourceState::Scheduled);

        output.set_time(0.6);
        assert_eq!(scheduler.source_state(second.id), SourceState::Playing);

        scheduler.source_ended(first.id);
        assert_eq!(scheduler.source_state(first.id), SourceState::Finished);
        let active = scheduler.active_sources();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);
        assert_eq!(active[0].end_time(), 1.0);
    }

    #[test]
    fn test_interrupt_stops_everything() {
        let (output, scheduler) = scheduler();
        let chunk = half_second();
        for _ in 0..3 {
            scheduler.schedule_chunk(&chunk, 24_000).unwrap();
        }
        let mut speaking = scheduler.speaking();
        speaking.borrow_and_update();

        output.set_time(0.7);
        scheduler.interrupt();

        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(output.stopped.lock().len(), 3);
        assert!(output.started.lock().is_empty());
        assert_eq!(scheduler.next_start_time(), 0.7);
        assert!(speaking.has_changed().unwrap());
        assert!(!*speaking.borrow_and_update());

        // The next chunk starts immediately rather than after the flushed audio
        assert_eq!(start_of(scheduler.schedule_chunk(&chunk, 24_000)), 0.7);
    }

    #[test]
    fn test_interrupt_when_idle() {
        let (output, scheduler) = scheduler();
        output.set_time(2.0);
        scheduler.interrupt();

        assert_eq!(scheduler.active_count(), 0);
        assert!(output.stopped.lock().is_empty());
        assert_eq!(scheduler.next_start_time(), 2.0);
        assert!(!scheduler.is_speaking());
        assert_eq!(scheduler.stats().interruptions, 1);
    }

    #[test]
    fn test_stopped_source_is_removed_once() {
        let (_output, scheduler) = scheduler();
        let source = scheduler.schedule_chunk(&half_second(), 24_000).unwrap().unwrap();
        scheduler.interrupt();

        // A late end report for a stopped source changes nothing
        scheduler.source_ended(source.id);
        scheduler.source_ended(source.id);
        assert_eq!(scheduler.active_count(), 0);
        assert!(!scheduler.is_speaking());
    }

    #[test]
    fn test_bad_chunk_leaves_timeline_untouched() {
        let (output, scheduler) = scheduler();
        scheduler.schedule_chunk(&half_second(), 24_000).unwrap();
        let before = scheduler.next_start_time();

        let odd = codec::encode_pcm16(&[0.1, 0.2]);
        let odd = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &odd[..3]);
        assert_eq!(
            scheduler.schedule_chunk(&odd, 24_000),
            Err(CodecError::InvalidLength(3))
        );
        assert!(matches!(
            scheduler.schedule_chunk("not base64!", 24_000),
            Err(CodecError::InvalidEncoding(_))
        ));
        assert_eq!(scheduler.schedule_chunk("", 24_000), Err(CodecError::Empty));

        assert_eq!(scheduler.next_start_time(), before);
        assert_eq!(scheduler.active_count(), 1);
        assert_eq!(output.started.lock().len(), 1);
        assert_eq!(scheduler.stats().chunks_dropped, 3);
    }

    #[test]
    fn test_shutdown_refuses_chunks() {
        let (output, scheduler) = scheduler();
        scheduler.schedule_chunk(&half_second(), 24_000).unwrap();
        scheduler.shutdown();
        scheduler.shutdown();

        assert!(scheduler.is_closed());
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.schedule_chunk(&half_second(), 24_000), Ok(None));
        assert!(output.started.lock().is_empty());
    }

    #[test]
    fn test_shutdown_races_scheduling() {
        let (output, scheduler) = scheduler();
        let scheduler = Arc::new(scheduler);
        let chunk = half_second();

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let scheduler = scheduler.clone();
                let chunk = chunk.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let _ = scheduler.schedule_chunk(&chunk, 24_000);
                    }
                })
            })
            .collect();
        scheduler.shutdown();
        for writer in writers {
            writer.join().unwrap();
        }

        // Nothing scheduled after the flush survives it
        assert_eq!(scheduler.active_count(), 0);
        assert!(output.started.lock().is_empty());
        assert!(!scheduler.is_speaking());
    }

    #[test]
    fn test_release_without_runtime() {
        let (_output, scheduler) = scheduler();
        let source = scheduler.schedule_chunk(&half_second(), 24_000).unwrap().unwrap();
        assert!(scheduler.is_speaking());

        scheduler.source_ended(source.id);
        assert_eq!(scheduler.active_count(), 0);
        assert!(!scheduler.is_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_reported_from_device_thread() {
        let output = Arc::new(FakeOutput::default());
        let scheduler = Arc::new(PlaybackScheduler::new(
            "test",
            output.clone(),
            Duration::from_millis(200),
        ));
        let source = scheduler.schedule_chunk(&half_second(), 24_000).unwrap().unwrap();

        let reporter = scheduler.clone();
        std::thread::spawn(move || reporter.source_ended(source.id))
            .join()
            .unwrap();
        assert_eq!(scheduler.active_count(), 0);
        assert!(scheduler.is_speaking());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!scheduler.is_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaking_released_after_delay() {
        let output = Arc::new(FakeOutput::default());
        let scheduler = PlaybackScheduler::start("test", output.clone(), Duration::from_millis(200));
        let chunk = half_second();
        scheduler.schedule_chunk(&chunk, 24_000).unwrap();
        scheduler.schedule_chunk(&chunk, 24_000).unwrap();
        assert!(scheduler.is_speaking());

        output.set_time(1.0);
        output.finish_all();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(scheduler.active_count(), 0);
        assert!(scheduler.is_speaking());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(scheduler.is_speaking());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!scheduler.is_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_chunk_cancels_release() {
        let output = Arc::new(FakeOutput::default());
        let scheduler = PlaybackScheduler::start("test", output.clone(), Duration::from_millis(200));
        let chunk = half_second();
        scheduler.schedule_chunk(&chunk, 24_000).unwrap();

        output.set_time(0.5);
        output.finish_all();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Next chunk of the same utterance arrives inside the release window
        scheduler.schedule_chunk(&chunk, 24_000).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(scheduler.is_speaking());
        assert_eq!(scheduler.active_count(), 1);
    }

    proptest! {
        #[test]
        fn prop_starts_are_back_to_back(lengths in prop::collection::vec(1usize..4000, 1..20)) {
            let (_output, scheduler) = scheduler();
            let mut expected = 0.0f64;
            for len in lengths {
                let buffer = AudioBuffer::new(vec![0.0; len], 24_000);
                let duration = buffer.duration();
                let start = scheduler.schedule_buffer(buffer).unwrap().unwrap().start_time;
                prop_assert!((start - expected).abs() < 1e-9);
                expected = start + duration;
            }
            prop_assert!((scheduler.next_start_time() - expected).abs() < 1e-9);
        }
    }
}
