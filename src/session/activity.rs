//! Frame-driven audio activity levels for visualization.
//!
//! The analyzer keeps a short window of remote audio, derives an output
//! level from its spectrum and blends in stepped stimuli from speech
//! events. Levels decay exponentially, once per sampled frame, so a host
//! rendering loop gets a smooth falloff regardless of event timing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use realfft::{RealFftPlanner, RealToComplex};

const FFT_SIZE: usize = 512;
const DECAY_PER_FRAME: f32 = 0.95;
const OUTPUT_PULSE: f32 = 0.8;
const INPUT_PULSE: f32 = 0.5;
const SPECTRUM_GAIN: f32 = 4.0;

/// A snapshot of input and output activity, both in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivitySample {
    pub input_level: f32,
    pub output_level: f32,
    pub timestamp: SystemTime,
}

pub struct ActivityAnalyzer {
    fft: Arc<dyn RealToComplex<f32>>,
    window: VecDeque<f32>,
    input_buf: Vec<f32>,
    output_buf: Vec<realfft::num_complex::Complex<f32>>,
    scratch: Vec<realfft::num_complex::Complex<f32>>,
    input_level: f32,
    input_held: bool,
    output_level: f32,
}

impl ActivityAnalyzer {
    #[must_use]
    pub fn new() -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);
        let input_buf = fft.make_input_vec();
        let output_buf = fft.make_output_vec();
        let scratch = fft.make_scratch_vec();
        Self {
            fft,
            window: VecDeque::with_capacity(FFT_SIZE),
            input_buf,
            output_buf,
            scratch,
            input_level: 0.0,
            input_held: false,
            output_level: 0.0,
        }
    }

    /// Append remote audio to the analysis window, keeping the newest
    /// `FFT_SIZE` samples.
    pub fn feed(&mut self, samples: &[f32]) {
        for &sample in samples {
            if self.window.len() == FFT_SIZE {
                self.window.pop_front();
            }
            self.window.push_back(sample);
        }
    }

    /// The assistant started speaking: pulse the output level.
    pub fn assistant_started_speaking(&mut self) {
        self.output_level = self.output_level.max(OUTPUT_PULSE);
    }

    /// Server VAD detected user speech: raise and hold the input level.
    pub fn user_started_speaking(&mut self) {
        self.input_level = self.input_level.max(INPUT_PULSE);
        self.input_held = true;
    }

    /// Server VAD detected the user going quiet: release the input level
    /// so it decays.
    pub fn user_stopped_speaking(&mut self) {
        self.input_held = false;
    }

    /// Magnitude spectrum of the current window, normalized to `[0, 1]`
    /// per bin. Returns `FFT_SIZE / 2 + 1` bins.
    pub(crate) fn spectrum(&mut self) -> Vec<f32> {
        self.input_buf.fill(0.0);
        for (slot, &sample) in self.input_buf.iter_mut().zip(self.window.iter()) {
            *slot = sample;
        }

        if self
            .fft
            .process_with_scratch(&mut self.input_buf, &mut self.output_buf, &mut self.scratch)
            .is_err()
        {
            return vec![0.0; FFT_SIZE / 2 + 1];
        }

        #[allow(clippy::cast_precision_loss)]
        let norm = FFT_SIZE as f32 / 2.0;
        self.output_buf.iter().map(|c| c.norm() / norm).collect()
    }

    /// Sample current levels and advance the decay by one frame.
    ///
    /// The returned sample reflects the state before decay, so an
    /// undisturbed level halves roughly every 13 frames.
    pub fn sample(&mut self) -> ActivitySample {
        let spectrum = self.spectrum();
        self.sample_with_spectrum(&spectrum)
    }

    /// Sample one frame and return its spectrum alongside the levels,
    /// running the FFT once.
    pub fn sample_frame(&mut self) -> (ActivitySample, Vec<f32>) {
        let spectrum = self.spectrum();
        let sample = self.sample_with_spectrum(&spectrum);
        (sample, spectrum)
    }

    fn sample_with_spectrum(&mut self, spectrum: &[f32]) -> ActivitySample {
        if !self.window.is_empty() {
            #[allow(clippy::cast_precision_loss)]
            let mean = spectrum.iter().sum::<f32>() / spectrum.len() as f32;
            let spectral_level = (mean * SPECTRUM_GAIN).clamp(0.0, 1.0);
            self.output_level = self.output_level.max(spectral_level);
        }

        let sample = ActivitySample {
            input_level: self.input_level.clamp(0.0, 1.0),
            output_level: self.output_level.clamp(0.0, 1.0),
            timestamp: SystemTime::now(),
        };

        if !self.input_held {
            self.input_level = (self.input_level * DECAY_PER_FRAME).clamp(0.0, 1.0);
        }
        self.output_level = (self.output_level * DECAY_PER_FRAME).clamp(0.0, 1.0);

        sample
    }

    /// Drop buffered audio and zero both levels.
    pub fn reset(&mut self) {
        self.window.clear();
        self.input_level = 0.0;
        self.input_held = false;
        self.output_level = 0.0;
    }
}

impl Default for ActivityAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}
