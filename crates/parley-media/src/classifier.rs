//! Energy-based speech-activity classification.

use parley_core::backend::FrameClassifier;
use parley_core::config::VadMetric;
use parley_core::types::AudioFrame;

/// Stateless classifier comparing frame energy to a threshold.
///
/// Energy is computed on normalized samples, so the same threshold applies to
/// f32 and s16 streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnergyClassifier {
    metric: VadMetric,
}

impl EnergyClassifier {
    pub fn new(metric: VadMetric) -> Self {
        Self { metric }
    }

    /// Mean absolute amplitude of a block of samples.
    pub fn mean_abs(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32
    }

    /// RMS energy of a block of samples.
    pub fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f32 = samples.iter().map(|&s| s * s).sum();
        (sum / samples.len() as f32).sqrt()
    }

    pub fn energy(&self, samples: &[f32]) -> f32 {
        match self.metric {
            VadMetric::MeanAbs => Self::mean_abs(samples),
            VadMetric::Rms => Self::rms(samples),
        }
    }
}

impl FrameClassifier for EnergyClassifier {
    fn classify(&self, frame: &AudioFrame, threshold: f32) -> bool {
        if frame.is_empty() {
            return false;
        }
        let samples = frame.samples();
        if samples.is_empty() {
            return false;
        }
        let energy = self.energy(&samples);
        // NaN never counts as speech
        energy > threshold
    }
}
