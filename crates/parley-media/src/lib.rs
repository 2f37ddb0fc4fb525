//! Media pipeline: speech-activity classification, utterance segmentation,
//! transcription and streaming synthesis adapters.

pub mod classifier;
pub mod segmenter;
pub mod stt;
pub mod tts_stream;

pub use classifier::EnergyClassifier;
pub use segmenter::{SegmentEvent, UtteranceSegmenter};
pub use stt::HttpTranscriber;
pub use tts_stream::HttpSynthesizer;
