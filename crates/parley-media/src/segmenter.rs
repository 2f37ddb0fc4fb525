//! Utterance segmentation: accumulates speech frames, flushes on silence.

use chrono::Utc;
use tracing::debug;

use parley_core::config::SessionSettings;
use parley_core::types::{AudioFormat, AudioFrame, Utterance};

/// Outcome of feeding one frame to the segmenter.
#[derive(Debug)]
pub enum SegmentEvent {
    /// A complete utterance, long enough to start a turn.
    Flushed(Utterance),
    /// Buffered speech that ended before reaching the minimum length.
    Discarded { bytes: usize },
}

/// Streaming speech/silence segmenter.
///
/// Consumes classified frames one at a time. Memory is bounded by the one
/// in-flight utterance buffer.
#[derive(Debug)]
pub struct UtteranceSegmenter {
    format: AudioFormat,
    /// Buffers must be strictly longer than this to flush.
    min_bytes: usize,
    hysteresis: u32,

    buffer: Vec<u8>,
    frames: usize,
    started_at: Option<chrono::DateTime<Utc>>,
    speech_run: u32,
    silence_run: u32,
}

impl UtteranceSegmenter {
    pub fn new(format: AudioFormat, min_bytes: usize, hysteresis: u32) -> Self {
        Self {
            format,
            min_bytes,
            hysteresis: hysteresis.max(1),
            buffer: Vec::new(),
            frames: 0,
            started_at: None,
            speech_run: 0,
            silence_run: 0,
        }
    }

    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self::new(
            settings.format,
            settings.min_utterance_bytes,
            settings.silence_hysteresis_frames,
        )
    }

    /// Feed one classified frame.
    pub fn push(&mut self, frame: AudioFrame, is_speech: bool) -> Option<SegmentEvent> {
        if is_speech {
            if self.buffer.is_empty() {
                self.started_at = Some(Utc::now());
                self.buffer = frame.data;
            } else {
                self.buffer.extend_from_slice(&frame.data);
            }
            self.frames += 1;
            self.speech_run = self.speech_run.saturating_add(1);
            self.silence_run = 0;
            return None;
        }

        self.speech_run = 0;
        self.silence_run = self.silence_run.saturating_add(1);

        if self.buffer.is_empty() || self.silence_run < self.hysteresis {
            return None;
        }

        if self.buffer.len() > self.min_bytes {
            let utterance = self.take();
            debug!(
                bytes = utterance.audio.len(),
                frames = utterance.frames,
                duration_ms = utterance.duration_ms(),
                "Utterance flushed"
            );
            Some(SegmentEvent::Flushed(utterance))
        } else {
            let bytes = self.buffer.len();
            self.reset();
            debug!(bytes, "Utterance too short, discarded");
            Some(SegmentEvent::Discarded { bytes })
        }
    }

    fn take(&mut self) -> Utterance {
        let audio = std::mem::take(&mut self.buffer);
        let utterance = Utterance {
            audio,
            format: self.format,
            started_at: self.started_at.take().unwrap_or_else(Utc::now),
            frames: self.frames,
        };
        self.frames = 0;
        utterance
    }

    /// Drop any buffered audio and run counters.
    pub fn reset(&mut self) {
        self.buffer = Vec::new();
        self.frames = 0;
        self.started_at = None;
        self.speech_run = 0;
        self.silence_run = 0;
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn speech_run(&self) -> u32 {
        self.speech_run
    }

    pub fn silence_run(&self) -> u32 {
        self.silence_run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 128 f32 samples = 512 bytes = 8ms at 16kHz
    fn frame() -> AudioFrame {
        AudioFrame::new(vec![1u8; 512], AudioFormat::default())
    }

    fn segmenter() -> UtteranceSegmenter {
        // 0.5s minimum at 16kHz f32
        UtteranceSegmenter::new(AudioFormat::default(), 32_000, 2)
    }

    #[test]
    fn test_silence_only_never_flushes() {
        let mut seg = segmenter();
        for _ in 0..20 {
            assert!(seg.push(frame(), false).is_none());
        }
        assert_eq!(seg.buffered_bytes(), 0);
        assert_eq!(seg.silence_run(), 20);
    }

    #[test]
    fn test_counters_track_runs() {
        let mut seg = segmenter();
        seg.push(frame(), true);
        seg.push(frame(), true);
        assert_eq!(seg.speech_run(), 2);
        assert_eq!(seg.silence_run(), 0);
        seg.push(frame(), false);
        assert_eq!(seg.speech_run(), 0);
        assert_eq!(seg.silence_run(), 1);
    }

    #[test]
    fn test_flush_after_hysteresis() {
        let mut seg = segmenter();
        // 75 frames * 512 bytes = 38400 bytes = 0.6s
        for _ in 0..75 {
            assert!(seg.push(frame(), true).is_none());
        }
        // One silence frame is below the hysteresis count
        assert!(seg.push(frame(), false).is_none());
        assert_eq!(seg.buffered_bytes(), 38_400);

        match seg.push(frame(), false) {
            Some(SegmentEvent::Flushed(u)) => {
                assert_eq!(u.audio.len(), 38_400);
                assert_eq!(u.frames, 75);
                assert_eq!(u.duration_ms(), 600);
            }
            other => panic!("expected flush, got {other:?}"),
        }
        assert_eq!(seg.buffered_bytes(), 0);
    }

    #[test]
    fn test_short_utterance_discarded() {
        let mut seg = segmenter();
        for _ in 0..10 {
            seg.push(frame(), true);
        }
        seg.push(frame(), false);
        match seg.push(frame(), false) {
            Some(SegmentEvent::Discarded { bytes }) => assert_eq!(bytes, 5_120),
            other => panic!("expected discard, got {other:?}"),
        }
        assert_eq!(seg.buffered_bytes(), 0);
    }

    #[test]
    fn test_exact_minimum_is_not_flushed() {
        let mut seg = UtteranceSegmenter::new(AudioFormat::default(), 5_120, 1);
        for _ in 0..10 {
            seg.push(frame(), true);
        }
        assert!(matches!(
            seg.push(frame(), false),
            Some(SegmentEvent::Discarded { .. })
        ));
    }

    #[test]
    fn test_speech_resumes_before_hysteresis() {
        let mut seg = segmenter();
        for _ in 0..40 {
            seg.push(frame(), true);
        }
        assert!(seg.push(frame(), false).is_none());
        for _ in 0..40 {
            seg.push(frame(), true);
        }
        assert_eq!(seg.silence_run(), 0);
        assert_eq!(seg.buffered_bytes(), 80 * 512);
    }

    #[test]
    fn test_flushes_produce_fresh_buffers() {
        let mut seg = UtteranceSegmenter::new(AudioFormat::default(), 1_000, 1);
        let mut utterances = Vec::new();
        for round in 0..2u8 {
            for _ in 0..4 {
                seg.push(AudioFrame::new(vec![round; 512], AudioFormat::default()), true);
            }
            if let Some(SegmentEvent::Flushed(u)) = seg.push(frame(), false) {
                utterances.push(u);
            }
        }
        assert_eq!(utterances.len(), 2);
        assert!(utterances[0].audio.iter().all(|&b| b == 0));
        assert!(utterances[1].audio.iter().all(|&b| b == 1));
    }
}
