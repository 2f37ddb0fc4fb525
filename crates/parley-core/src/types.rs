use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sample encoding of raw PCM audio on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleEncoding {
    /// 32-bit little-endian IEEE float, nominal range [-1.0, 1.0].
    #[default]
    F32le,
    /// 16-bit little-endian signed integer.
    S16le,
}

impl SampleEncoding {
    /// Bytes per mono sample.
    pub fn sample_width(self) -> usize {
        match self {
            SampleEncoding::F32le => 4,
            SampleEncoding::S16le => 2,
        }
    }
}

/// Fixed stream format: mono PCM at a fixed sample rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub encoding: SampleEncoding,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            encoding: SampleEncoding::F32le,
        }
    }
}

impl AudioFormat {
    /// Number of bytes that hold `ms` milliseconds of audio.
    pub fn bytes_for_ms(&self, ms: u64) -> usize {
        let samples = ms * self.sample_rate as u64 / 1000;
        samples as usize * self.encoding.sample_width()
    }

    /// Duration in milliseconds of `len` bytes of audio.
    pub fn ms_for_bytes(&self, len: usize) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        let samples = (len / self.encoding.sample_width()) as u64;
        samples * 1000 / self.sample_rate as u64
    }

    /// Decode raw bytes into normalized `f32` samples.
    ///
    /// Trailing bytes that do not form a whole sample are ignored.
    pub fn decode(&self, bytes: &[u8]) -> Vec<f32> {
        match self.encoding {
            SampleEncoding::F32le => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            SampleEncoding::S16le => bytes
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
                .collect(),
        }
    }
}

/// One inbound chunk of raw audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub data: Vec<u8>,
    pub format: AudioFormat,
}

impl AudioFrame {
    pub fn new(data: Vec<u8>, format: AudioFormat) -> Self {
        Self { data, format }
    }

    /// Build a frame from float samples, encoded in `format`.
    pub fn from_samples(samples: &[f32], format: AudioFormat) -> Self {
        let data = match format.encoding {
            SampleEncoding::F32le => samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
            SampleEncoding::S16le => samples
                .iter()
                .flat_map(|s| ((s.clamp(-1.0, 1.0) * 32767.0) as i16).to_le_bytes())
                .collect(),
        };
        Self { data, format }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// A frame is well formed when it is non-empty and holds whole samples.
    pub fn is_well_formed(&self) -> bool {
        !self.data.is_empty() && self.data.len() % self.format.encoding.sample_width() == 0
    }

    /// Normalized samples of this frame.
    pub fn samples(&self) -> Vec<f32> {
        self.format.decode(&self.data)
    }

    pub fn duration_ms(&self) -> u64 {
        self.format.ms_for_bytes(self.data.len())
    }
}

/// A contiguous span of speech audio, flushed by the segmenter.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Concatenated bytes of every speech frame, in arrival order.
    pub audio: Vec<u8>,
    pub format: AudioFormat,
    pub started_at: DateTime<Utc>,
    /// Number of speech frames that make up this utterance.
    pub frames: usize,
}

impl Utterance {
    pub fn duration_ms(&self) -> u64 {
        self.format.ms_for_bytes(self.audio.len())
    }

    pub fn samples(&self) -> Vec<f32> {
        self.format.decode(&self.audio)
    }
}

/// Monotonically increasing turn identifier, unique within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(pub u64);

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pipeline stage a turn failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStage {
    Transcription,
    Generation,
    Synthesis,
    Task,
}

impl fmt::Display for TurnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnStage::Transcription => "transcription",
            TurnStage::Generation => "generation",
            TurnStage::Synthesis => "synthesis",
            TurnStage::Task => "task",
        };
        f.write_str(s)
    }
}

/// How a turn terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    /// The full response was emitted.
    Completed,
    /// Barge-in cancelled the turn.
    Interrupted,
    /// The transcript was empty or too short; nothing ran after transcription.
    AbortedEmpty,
    /// A collaborator failed.
    Failed { stage: TurnStage, reason: String },
    /// Outbound send failed; the peer is gone.
    Disconnected,
}

impl TurnStatus {
    /// Stable label used in logs, metrics, and wire events.
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Completed => "completed",
            TurnStatus::Interrupted => "interrupted",
            TurnStatus::AbortedEmpty => "aborted_empty",
            TurnStatus::Failed { .. } => "failed",
            TurnStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnStatus::Failed { stage, reason } => write!(f, "failed at {stage}: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Context handed to the generation collaborator on every turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: String,
    pub turn_id: TurnId,
}
