//! Output timeline
//!
//! [`AudioOutput`] is the clock and sink the scheduler drives: it reports the
//! current output time and plays buffers starting at absolute timeline
//! positions. [`DeviceOutput`] implements it with a cpal output stream whose
//! callback mixes every source overlapping the block being rendered.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::audio::buffer::AudioBuffer;
use crate::audio::device::playback_device;
use crate::config::PlaybackConfig;
use crate::error::AudioError;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique playback source identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    pub fn next() -> Self {
        Self(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "src-{}", self.0)
    }
}

/// A buffer bound to a start time, handed to the output
#[derive(Clone)]
pub struct SourceStart {
    pub id: SourceId,
    pub buffer: Arc<AudioBuffer>,
    /// Absolute timeline position in seconds
    pub start_time: f64,
    /// Notified with `id` when the source plays to its end
    pub on_end: mpsc::UnboundedSender<SourceId>,
}

impl SourceStart {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.buffer.duration()
    }
}

/// Output clock and sink
pub trait AudioOutput: Send + Sync {
    /// Current output time in seconds
    fn current_time(&self) -> f64;

    /// Begin playing a source at its start time
    fn start(&self, source: SourceStart);

    /// Stop a source immediately. A stopped source is never reported as ended.
    fn stop(&self, id: SourceId);

    /// Release the device. Further starts are ignored.
    fn close(&self) {}
}

struct MixerState {
    sources: Mutex<Vec<SourceStart>>,
    frames_rendered: AtomicU64,
    sample_rate: u32,
    closed: AtomicBool,
}

impl MixerState {
    fn render(&self, data: &mut [f32], channels: usize) {
        let frames = data.len() / channels.max(1);
        let first = self.frames_rendered.load(Ordering::Relaxed);
        let rate = self.sample_rate as f64;
        let block_end = (first + frames as u64) as f64 / rate;

        let mut sources = self.sources.lock();
        for (i, frame) in data.chunks_mut(channels.max(1)).enumerate() {
            let t = (first + i as u64) as f64 / rate;
            let mut mixed = 0.0f32;
            for source in sources.iter() {
                if let Some(sample) = source.buffer.sample_at(t - source.start_time) {
                    mixed += sample;
                }
            }
            let mixed = mixed.clamp(-1.0, 1.0);
            for out in frame.iter_mut() {
                *out = mixed;
            }
        }

        sources.retain(|source| {
            if source.end_time() <= block_end {
                let _ = source.on_end.send(source.id);
                false
            } else {
                true
            }
        });
        drop(sources);

        self.frames_rendered.fetch_add(frames as u64, Ordering::Relaxed);
    }

    /// Render into a device buffer of any sample type, mixing in `scratch`
    fn render_into<T>(&self, data: &mut [T], channels: usize, scratch: &mut Vec<f32>)
    where
        T: Sample + FromSample<f32>,
    {
        scratch.clear();
        scratch.resize(data.len(), 0.0);
        self.render(scratch, channels);
        for (out, sample) in data.iter_mut().zip(scratch.iter()) {
            *out = T::from_sample(*sample);
        }
    }
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    state: Arc<MixerState>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch = Vec::new();
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            state.render_into(data, channels, &mut scratch);
        },
        move |err| {
            tracing::error!("Playback stream error: {}", err);
        },
        None,
    )
}

/// cpal-backed output mixer
pub struct DeviceOutput {
    state: Arc<MixerState>,
    running: Arc<AtomicBool>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceOutput {
    /// Open the configured (or default) output device
    pub fn open(config: &PlaybackConfig) -> Result<Self, AudioError> {
        let device = playback_device(config.device.as_deref())?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let default_config = device
            .default_output_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
        let sample_format = default_config.sample_format();
        if !matches!(
            sample_format,
            cpal::SampleFormat::F32 | cpal::SampleFormat::I16 | cpal::SampleFormat::U16
        ) {
            return Err(AudioError::UnsupportedFormat(format!("{:?}", sample_format)));
        }
        let stream_config: cpal::StreamConfig = default_config.into();
        let channels = stream_config.channels as usize;

        let state = Arc::new(MixerState {
            sources: Mutex::new(Vec::new()),
            frames_rendered: AtomicU64::new(0),
            sample_rate: stream_config.sample_rate.0,
            closed: AtomicBool::new(false),
        });
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let handle = {
            let state = state.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("playback".into())
                .spawn(move || {
                    let built = match sample_format {
                        cpal::SampleFormat::I16 => {
                            build_output_stream::<i16>(&device, &stream_config, state)
                        }
                        cpal::SampleFormat::U16 => {
                            build_output_stream::<u16>(&device, &stream_config, state)
                        }
                        _ => build_output_stream::<f32>(&device, &stream_config, state),
                    };
                    let output = match built {
                        Ok(output) => output,
                        Err(e) => {
                            let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                            return;
                        }
                    };
                    if let Err(e) = output.play() {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));

                    while running.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(10));
                    }
                    drop(output);
                })
                .map_err(|e| AudioError::StreamError(e.to_string()))?
        };

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::StreamError("playback thread exited".to_string())));
        if let Err(e) = ready {
            running.store(false, Ordering::SeqCst);
            let _ = handle.join();
            return Err(e);
        }

        tracing::info!(
            "Playback started on \"{}\": {}Hz, {} channels, {:?}",
            device_name,
            state.sample_rate,
            channels,
            sample_format
        );

        Ok(Self {
            state,
            running,
            thread_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.state.sample_rate
    }

    /// Sources currently held by the mixer
    pub fn source_count(&self) -> usize {
        self.state.sources.lock().len()
    }
}

impl AudioOutput for DeviceOutput {
    fn current_time(&self) -> f64 {
        self.state.frames_rendered.load(Ordering::Relaxed) as f64 / self.state.sample_rate as f64
    }

    fn start(&self, source: SourceStart) {
        if self.state.closed.load(Ordering::SeqCst) {
            return;
        }
        self.state.sources.lock().push(source);
    }

    fn stop(&self, id: SourceId) {
        self.state.sources.lock().retain(|s| s.id != id);
    }

    fn close(&self) {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.sources.lock().clear();
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.lock().take() {
            let _ = handle.join();
        }
        tracing::info!("Playback device released");
    }
}

impl Drop for DeviceOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Output without a device: its clock only moves when told to, and sources
/// end once the clock passes them. Used for headless runs and tests.
#[derive(Default)]
pub struct VirtualOutput {
    now: Mutex<f64>,
    sources: Mutex<Vec<SourceStart>>,
    closed: AtomicBool,
}

impl VirtualOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock without finishing anything
    pub fn set_time(&self, t: f64) {
        *self.now.lock() = t;
    }

    /// Move the clock and report every source that ended by `t`
    pub fn advance_to(&self, t: f64) {
        *self.now.lock() = t;
        self.sources.lock().retain(|source| {
            if source.end_time() <= t {
                let _ = source.on_end.send(source.id);
                false
            } else {
                true
            }
        });
    }

    /// Start times of the sources currently held, in start order
    pub fn start_times(&self) -> Vec<f64> {
        let mut times: Vec<f64> = self.sources.lock().iter().map(|s| s.start_time).collect();
        times.sort_by(f64::total_cmp);
        times
    }

    pub fn source_count(&self) -> usize {
        self.sources.lock().len()
    }
}

impl AudioOutput for VirtualOutput {
    fn current_time(&self) -> f64 {
        *self.now.lock()
    }

    fn start(&self, source: SourceStart) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.sources.lock().push(source);
    }

    fn stop(&self, id: SourceId) {
        self.sources.lock().retain(|s| s.id != id);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.sources.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixer(rate: u32) -> MixerState {
        MixerState {
            sources: Mutex::new(Vec::new()),
            frames_rendered: AtomicU64::new(0),
            sample_rate: rate,
            closed: AtomicBool::new(false),
        }
    }

    #[test]
    fn test_source_ids_unique() {
        let a = SourceId::next();
        let b = SourceId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_mixer_renders_integer_samples() {
        let state = mixer(10);
        let (tx, _rx) = mpsc::unbounded_channel();
        state.sources.lock().push(SourceStart {
            id: SourceId::next(),
            buffer: Arc::new(AudioBuffer::new(vec![0.5, -1.0, 1.0], 10)),
            start_time: 0.1,
            on_end: tx,
        });
        let mut scratch = Vec::new();

        let mut signed = vec![7i16; 5];
        state.render_into(&mut signed, 1, &mut scratch);
        assert_eq!(signed[0], 0);
        assert_eq!(signed[1], 16384);
        assert_eq!(signed[2], i16::MIN);
        assert!(signed[3] >= i16::MAX - 1);
        assert_eq!(signed[4], 0);
        assert_eq!(state.frames_rendered.load(Ordering::Relaxed), 5);

        // Unsigned output is centred on the midpoint
        let mut unsigned = vec![7u16; 5];
        state.render_into(&mut unsigned, 1, &mut scratch);
        assert!(unsigned.iter().all(|&s| s == 32768));
    }

    #[test]
    fn test_mixer_renders_on_timeline_and_reports_end() {
        let state = mixer(10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = SourceId::next();
        state.sources.lock().push(SourceStart {
            id,
            buffer: Arc::new(AudioBuffer::new(vec![0.5; 5], 10)),
            start_time: 0.2,
            on_end: tx,
        });

        let mut block = vec![0.0f32; 10 * 2];
        state.render(&mut block, 2);

        let left: Vec<f32> = block.iter().step_by(2).copied().collect();
        assert_eq!(left, vec![0.0, 0.0, 0.5, 0.5, 0.5, 0.5, 0.5, 0.0, 0.0, 0.0]);
        assert_eq!(rx.try_recv().unwrap(), id);
        assert!(state.sources.lock().is_empty());
    }

    #[test]
    fn test_mixer_keeps_unfinished_sources() {
        let state = mixer(10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.sources.lock().push(SourceStart {
            id: SourceId::next(),
            buffer: Arc::new(AudioBuffer::new(vec![0.5; 20], 10)),
            start_time: 0.0,
            on_end: tx,
        });

        let mut block = vec![0.0f32; 10];
        state.render(&mut block, 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(state.sources.lock().len(), 1);
    }

    #[test]
    fn test_virtual_output_ends_sources_by_clock() {
        let output = VirtualOutput::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = SourceId::next();
        for (id, start) in [(first, 0.0), (SourceId::next(), 0.5)] {
            output.start(SourceStart {
                id,
                buffer: Arc::new(AudioBuffer::new(vec![0.0; 5], 10)),
                start_time: start,
                on_end: tx.clone(),
            });
        }

        output.advance_to(0.7);
        assert_eq!(output.current_time(), 0.7);
        assert_eq!(rx.try_recv().unwrap(), first);
        assert!(rx.try_recv().is_err());
        assert_eq!(output.start_times(), vec![0.5]);

        output.close();
        assert_eq!(output.source_count(), 0);
    }
}
