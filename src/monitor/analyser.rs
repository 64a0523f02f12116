//! Frequency analyser
//!
//! Byte-scaled magnitude spectrum over the most recent `fft_size` samples:
//! Blackman window, radix-2 FFT, per-bin exponential smoothing, then decibels
//! mapped linearly from `[min_decibels, max_decibels]` onto `0..=255`.

use std::f32::consts::PI;

use crate::config::MonitorConfig;

/// Average of a byte spectrum
pub fn average_magnitude(frequency_data: &[u8]) -> f32 {
    if frequency_data.is_empty() {
        return 0.0;
    }
    let sum: u32 = frequency_data.iter().map(|&b| b as u32).sum();
    sum as f32 / frequency_data.len() as f32
}

/// Speaking when the average magnitude exceeds `threshold`
pub fn is_speaking(frequency_data: &[u8], threshold: f32) -> bool {
    average_magnitude(frequency_data) > threshold
}

pub struct FrequencyAnalyser {
    fft_size: usize,
    window: Vec<f32>,
    /// Ring of the last `fft_size` samples
    history: Vec<f32>,
    write_pos: usize,
    smoothed: Vec<f32>,
    smoothing: f32,
    min_decibels: f32,
    max_decibels: f32,
    re: Vec<f32>,
    im: Vec<f32>,
}

impl FrequencyAnalyser {
    pub fn new(config: &MonitorConfig) -> Self {
        let fft_size = config.fft_size.clamp(32, 32768).next_power_of_two();
        Self {
            fft_size,
            window: blackman(fft_size),
            history: vec![0.0; fft_size],
            write_pos: 0,
            smoothed: vec![0.0; fft_size / 2],
            smoothing: config.smoothing.clamp(0.0, 1.0),
            min_decibels: config.min_decibels,
            max_decibels: config.max_decibels.max(config.min_decibels + 1.0),
            re: vec![0.0; fft_size],
            im: vec![0.0; fft_size],
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Append mono samples to the analysis window
    pub fn push_samples(&mut self, samples: &[f32]) {
        for &sample in samples {
            self.history[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % self.fft_size;
        }
    }

    /// Compute the current byte spectrum. Each call advances the smoothing.
    pub fn byte_frequency_data(&mut self) -> Vec<u8> {
        let n = self.fft_size;
        for i in 0..n {
            let sample = self.history[(self.write_pos + i) % n];
            self.re[i] = sample * self.window[i];
            self.im[i] = 0.0;
        }
        fft(&mut self.re, &mut self.im);

        let tau = self.smoothing;
        let range = self.max_decibels - self.min_decibels;
        let mut out = Vec::with_capacity(n / 2);
        for k in 0..n / 2 {
            let magnitude = (self.re[k] * self.re[k] + self.im[k] * self.im[k]).sqrt() / n as f32;
            let value = tau * self.smoothed[k] + (1.0 - tau) * magnitude;
            self.smoothed[k] = if value.is_finite() { value } else { 0.0 };

            let byte = if self.smoothed[k] <= 0.0 {
                0.0
            } else {
                let db = 20.0 * self.smoothed[k].log10();
                255.0 / range * (db - self.min_decibels)
            };
            out.push(byte.clamp(0.0, 255.0) as u8);
        }
        out
    }

    pub fn reset(&mut self) {
        self.history.iter_mut().for_each(|s| *s = 0.0);
        self.smoothed.iter_mut().for_each(|s| *s = 0.0);
        self.write_pos = 0;
    }
}

fn blackman(n: usize) -> Vec<f32> {
    const A0: f32 = 0.42;
    const A1: f32 = 0.5;
    const A2: f32 = 0.08;
    (0..n)
        .map(|i| {
            let x = i as f32 / n as f32;
            A0 - A1 * (2.0 * PI * x).cos() + A2 * (4.0 * PI * x).cos()
        })
        .collect()
}

/// In-place iterative radix-2 Cooley-Tukey FFT. `re.len()` must be a power
/// of two.
fn fft(re: &mut [f32], im: &mut [f32]) {
    let n = re.len();
    debug_assert!(n.is_power_of_two());

    // Bit-reversal permutation
    let mut j = 0;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j |= bit;
        if i < j {
            re.swap(i, j);
            im.swap(i, j);
        }
    }

    let mut len = 2;
    while len <= n {
        let angle = -2.0 * PI / len as f32;
        let (w_im, w_re) = angle.sin_cos();
        for start in (0..n).step_by(len) {
            let (mut cur_re, mut cur_im) = (1.0f32, 0.0f32);
            for k in 0..len / 2 {
                let a = start + k;
                let b = a + len / 2;
                let t_re = re[b] * cur_re - im[b] * cur_im;
                let t_im = re[b] * cur_im + im[b] * cur_re;
                re[b] = re[a] - t_re;
                im[b] = im[a] - t_im;
                re[a] += t_re;
                im[a] += t_im;
                let next_re = cur_re * w_re - cur_im * w_im;
                cur_im = cur_re * w_im + cur_im * w_re;
                cur_re = next_re;
            }
        }
        len <<= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic white noise in [-0.5, 0.5)
    fn noise(len: usize, seed: u32) -> Vec<f32> {
        let mut state = seed.max(1);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as f32 / u32::MAX as f32 - 0.5
            })
            .collect()
    }

    #[test]
    fn test_threshold_decision() {
        assert!(!is_speaking(&[5; 256], 10.0));
        assert!(is_speaking(&[50; 256], 10.0));
        assert!(!is_speaking(&[10; 256], 10.0));
        assert!(!is_speaking(&[], 10.0));
        assert_eq!(average_magnitude(&[0, 10, 20, 30]), 15.0);
    }

    #[test]
    fn test_fft_of_impulse_and_tone() {
        let mut re = vec![0.0f32; 8];
        let mut im = vec![0.0f32; 8];
        re[0] = 1.0;
        fft(&mut re, &mut im);
        assert!(re.iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert!(im.iter().all(|&v| v.abs() < 1e-6));

        // Cosine at bin 2 puts n/2 into bins 2 and n-2
        let n = 16;
        let mut re: Vec<f32> = (0..n).map(|i| (2.0 * PI * 2.0 * i as f32 / n as f32).cos()).collect();
        let mut im = vec![0.0f32; n];
        fft(&mut re, &mut im);
        let magnitude = |k: usize| (re[k] * re[k] + im[k] * im[k]).sqrt();
        assert!((magnitude(2) - 8.0).abs() < 1e-3);
        assert!((magnitude(14) - 8.0).abs() < 1e-3);
        assert!(magnitude(5) < 1e-3);
    }

    #[test]
    fn test_silence_is_zero() {
        let mut analyser = FrequencyAnalyser::new(&MonitorConfig::default());
        analyser.push_samples(&[0.0; 512]);
        let data = analyser.byte_frequency_data();
        assert_eq!(data.len(), 256);
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_noise_is_loud_and_decays() {
        let config = MonitorConfig::default();
        let mut analyser = FrequencyAnalyser::new(&config);
        analyser.push_samples(&noise(512, 7));
        let loud = average_magnitude(&analyser.byte_frequency_data());
        assert!(loud > 100.0, "noise level {}", loud);

        // Smoothing keeps the level up briefly after the input goes silent
        analyser.push_samples(&[0.0; 512]);
        let held = average_magnitude(&analyser.byte_frequency_data());
        assert!(held > config.threshold && held < loud);

        for _ in 0..60 {
            analyser.byte_frequency_data();
        }
        let quiet = average_magnitude(&analyser.byte_frequency_data());
        assert!(quiet < config.threshold, "decayed level {}", quiet);
    }

    #[test]
    fn test_fft_size_rounds_up() {
        let analyser = FrequencyAnalyser::new(&MonitorConfig {
            fft_size: 500,
            ..Default::default()
        });
        assert_eq!(analyser.fft_size(), 512);
        assert_eq!(analyser.frequency_bin_count(), 256);
    }
}
