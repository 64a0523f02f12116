//! Microphone capture
//!
//! Runs the cpal input stream on a dedicated thread and publishes every
//! callback block into an [`AudioStream`]. The stream is built before
//! [`DeviceCapture::open`] returns, so a denied or missing device is reported
//! to the caller with nothing left running.

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::capture_device;
use crate::audio::stream::AudioStream;
use crate::config::CaptureConfig;
use crate::error::PermissionError;

/// Live capture from an input device
pub struct DeviceCapture {
    stream: AudioStream,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    samples_captured: Arc<AtomicU64>,
    device_name: String,
}

impl DeviceCapture {
    /// Open the configured (or default) input device and start capturing
    pub fn open(config: &CaptureConfig) -> Result<Self, PermissionError> {
        let device = capture_device(config.device.as_deref())?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let default_config = device
            .default_input_config()
            .map_err(|e| PermissionError::Denied(e.to_string()))?;

        let stream_config = cpal::StreamConfig {
            channels: default_config.channels(),
            sample_rate: config
                .sample_rate
                .map(cpal::SampleRate)
                .unwrap_or_else(|| default_config.sample_rate()),
            buffer_size: match config.buffer_size {
                Some(size) => cpal::BufferSize::Fixed(size),
                None => cpal::BufferSize::Default,
            },
        };

        let stream = AudioStream::new(stream_config.sample_rate.0, stream_config.channels);
        let running = Arc::new(AtomicBool::new(true));
        let samples_captured = Arc::new(AtomicU64::new(0));
        let (ready_tx, ready_rx) = bounded::<Result<(), PermissionError>>(1);

        let handle = {
            let running = running.clone();
            let stream = stream.clone();
            let samples_captured = samples_captured.clone();

            thread::Builder::new()
                .name("capture".into())
                .spawn(move || {
                    let callback_running = running.clone();
                    let built = device.build_input_stream(
                        &stream_config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            if !callback_running.load(Ordering::Relaxed) {
                                return;
                            }
                            samples_captured.fetch_add(data.len() as u64, Ordering::Relaxed);
                            stream.push(data);
                        },
                        move |err| {
                            tracing::error!("Capture stream error: {}", err);
                        },
                        None,
                    );

                    let input = match built {
                        Ok(input) => input,
                        Err(e) => {
                            let _ = ready_tx.send(Err(PermissionError::Denied(e.to_string())));
                            return;
                        }
                    };
                    if let Err(e) = input.play() {
                        let _ = ready_tx.send(Err(PermissionError::Denied(e.to_string())));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));

                    while running.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(10));
                    }
                    drop(input);
                })
                .map_err(|e| PermissionError::Denied(e.to_string()))?
        };

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(PermissionError::Denied("capture thread exited".to_string())));
        if let Err(e) = ready {
            running.store(false, Ordering::SeqCst);
            let _ = handle.join();
            return Err(e);
        }

        tracing::info!(
            "Capture started on \"{}\": {}Hz, {} channels",
            device_name,
            stream.sample_rate(),
            stream.channels()
        );

        Ok(Self {
            stream,
            running,
            thread_handle: Some(handle),
            samples_captured,
            device_name,
        })
    }

    /// The live stream fed by this device
    pub fn stream(&self) -> &AudioStream {
        &self.stream
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::info!("Capture on \"{}\" stopped", self.device_name);
        }
    }

    /// Check if capture is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get total samples captured
    pub fn samples_captured(&self) -> u64 {
        self.samples_captured.load(Ordering::Relaxed)
    }
}

impl Drop for DeviceCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
