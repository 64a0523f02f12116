//! Frame assembly: downmix, resample and cut fixed-size frames
//!
//! Capture devices deliver blocks at their own rate, channel count and block
//! size. The live service and the peer transport both want mono frames of a
//! fixed length at 16 kHz, so every outbound path runs through a
//! [`FrameAssembler`].

use rubato::{FftFixedIn, Resampler};

use crate::audio::buffer::AudioFrame;
use crate::error::AudioError;

/// Input frames per resampler chunk (before rounding to the rate ratio)
const RESAMPLER_CHUNK: usize = 1024;

/// FFT sub-chunks per resampler chunk
const RESAMPLER_SUB_CHUNKS: usize = 2;

/// Mono FFT resampler fed with blocks of any size.
///
/// Input is buffered until a full resampler chunk is available, so the output
/// does not depend on how the input was split into blocks.
pub struct ChunkResampler {
    from_rate: u32,
    to_rate: u32,
    /// `None` when the rates match
    resampler: Option<FftFixedIn<f32>>,
    input: Vec<f32>,
    chunk_in: Vec<Vec<f32>>,
    chunk_out: Vec<Vec<f32>>,
}

impl ChunkResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, AudioError> {
        if from_rate == 0 || to_rate == 0 {
            return Err(AudioError::UnsupportedFormat(format!(
                "cannot resample {}Hz to {}Hz",
                from_rate, to_rate
            )));
        }
        let resampler = if from_rate == to_rate {
            None
        } else {
            Some(
                FftFixedIn::<f32>::new(
                    from_rate as usize,
                    to_rate as usize,
                    RESAMPLER_CHUNK,
                    RESAMPLER_SUB_CHUNKS,
                    1,
                )
                .map_err(|e| {
                    AudioError::UnsupportedFormat(format!(
                        "cannot resample {}Hz to {}Hz: {}",
                        from_rate, to_rate, e
                    ))
                })?,
            )
        };
        let (chunk_in, chunk_out) = match &resampler {
            Some(r) => (r.input_buffer_allocate(true), r.output_buffer_allocate(true)),
            None => (Vec::new(), Vec::new()),
        };

        Ok(Self {
            from_rate,
            to_rate,
            resampler,
            input: Vec::new(),
            chunk_in,
            chunk_out,
        })
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Resample one mono block, appending whatever is ready to `out`
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<(), AudioError> {
        let Some(resampler) = self.resampler.as_mut() else {
            out.extend_from_slice(input);
            return Ok(());
        };

        self.input.extend_from_slice(input);
        loop {
            let needed = resampler.input_frames_next();
            if self.input.len() < needed {
                return Ok(());
            }
            self.chunk_in[0].clear();
            self.chunk_in[0].extend(self.input.drain(..needed));

            let (_, produced) = resampler
                .process_into_buffer(&self.chunk_in, &mut self.chunk_out, None)
                .map_err(|e| AudioError::StreamError(format!("resampler: {}", e)))?;
            out.extend_from_slice(&self.chunk_out[0][..produced]);
        }
    }

    /// Input samples waiting for a full chunk
    pub fn buffered(&self) -> usize {
        self.input.len()
    }

    pub fn reset(&mut self) {
        self.input.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

/// Collects capture frames into fixed-size mono frames at a target rate
pub struct FrameAssembler {
    target_rate: u32,
    frame_samples: usize,
    /// `None` when the current source rate cannot be resampled
    resampler: Option<ChunkResampler>,
    source_rate: u32,
    pending: Vec<f32>,
    scratch: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(target_rate: u32, frame_samples: usize) -> Self {
        Self {
            target_rate,
            frame_samples: frame_samples.max(1),
            resampler: ChunkResampler::new(target_rate, target_rate).ok(),
            source_rate: target_rate,
            pending: Vec::with_capacity(frame_samples * 2),
            scratch: Vec::new(),
        }
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Feed a capture frame; returns every complete output frame
    pub fn push(&mut self, frame: &AudioFrame) -> Vec<Vec<f32>> {
        if frame.sample_rate != self.source_rate {
            self.source_rate = frame.sample_rate;
            self.resampler = match ChunkResampler::new(frame.sample_rate, self.target_rate) {
                Ok(resampler) => Some(resampler),
                Err(e) => {
                    tracing::error!("Dropping capture audio: {}", e);
                    None
                }
            };
        }
        let Some(resampler) = self.resampler.as_mut() else {
            return Vec::new();
        };

        self.scratch.clear();
        if let Err(e) = resampler.process(&frame.to_mono(), &mut self.scratch) {
            tracing::warn!("Dropping capture block: {}", e);
            resampler.reset();
            return Vec::new();
        }
        self.pending.extend_from_slice(&self.scratch);

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            frames.push(self.pending.drain(..self.frame_samples).collect());
        }
        frames
    }

    /// Output samples waiting for a complete frame
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_frames() {
        let mut assembler = FrameAssembler::new(16000, 4);
        let frame = AudioFrame::new(vec![0.1; 10], 1, 16000, 0, 0);

        let out = assembler.push(&frame);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 4);
        assert_eq!(assembler.pending(), 2);
    }

    #[test]
    fn test_downsample_rate() {
        let mut assembler = FrameAssembler::new(16000, 160);
        let mut out = Vec::new();
        // One second of 48kHz stereo in 100ms blocks
        for i in 0..10 {
            let frame = AudioFrame::new(vec![0.25; 9600], 2, 48000, i * 100_000, i as u32);
            out.extend(assembler.push(&frame));
        }

        let produced = out.len() * 160 + assembler.pending();
        assert!((15_000..=16_000).contains(&produced), "produced {}", produced);

        // Past the filter delay a constant input stays constant
        let samples: Vec<f32> = out.into_iter().flatten().collect();
        assert!(samples[4000..12_000].iter().all(|s| (*s - 0.25).abs() < 1e-2));
    }

    #[test]
    fn test_resampler_ignores_block_boundaries() {
        let signal: Vec<f32> = (0..8000).map(|i| (i as f32 * 0.05).sin() * 0.5).collect();

        let mut whole = ChunkResampler::new(8000, 16000).unwrap();
        let mut expected = Vec::new();
        whole.process(&signal, &mut expected).unwrap();

        let mut split = ChunkResampler::new(8000, 16000).unwrap();
        let mut actual = Vec::new();
        for block in signal.chunks(37) {
            split.process(block, &mut actual).unwrap();
        }

        assert!(!expected.is_empty());
        assert_eq!(expected.len(), actual.len());
        assert!(expected.iter().zip(&actual).all(|(a, b)| (a - b).abs() < 1e-6));
        assert_eq!(whole.buffered(), split.buffered());
    }

    #[test]
    fn test_unsupported_rate_drops_audio() {
        assert!(ChunkResampler::new(0, 16000).is_err());

        let mut assembler = FrameAssembler::new(16000, 4);
        let frame = AudioFrame::new(vec![0.1; 10], 1, 0, 0, 0);
        assert!(assembler.push(&frame).is_empty());
        assert_eq!(assembler.pending(), 0);
    }
}
