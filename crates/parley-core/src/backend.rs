//! Collaborator contracts consumed by the turn-taking core.
//!
//! Every engine (speech activity, transcription, generation, synthesis) and
//! the duplex transport sit behind one of these traits so they can be swapped
//! without touching the session loop.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::protocol::ServerEvent;
use crate::types::{AudioFormat, AudioFrame, SampleEncoding, SessionContext, Utterance};

/// Lazy, order-preserving sequence of generated text fragments.
///
/// Dropping the stream must release every resource held by the producer.
pub type TextStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

/// Lazy, order-preserving sequence of synthesized audio chunks.
///
/// Same early-close contract as [`TextStream`].
pub type AudioStream = Pin<Box<dyn Stream<Item = anyhow::Result<Vec<u8>>> + Send>>;

/// Speech-activity classifier. Pure: no I/O, no interior state.
pub trait FrameClassifier: Send + Sync {
    /// Whether `frame` contains speech at the given sensitivity.
    ///
    /// Must return `false` for an empty frame.
    fn classify(&self, frame: &AudioFrame, threshold: f32) -> bool;
}

/// Speech-to-text engine.
#[async_trait]
pub trait Transcriber: Send + Sync {
    fn id(&self) -> &str;

    /// Transcribe one utterance. May return an empty string.
    async fn transcribe(&self, utterance: &Utterance) -> anyhow::Result<String>;
}

/// Incremental text-generation engine.
#[async_trait]
pub trait Generator: Send + Sync {
    fn id(&self) -> &str;

    /// Start generating a reply to `prompt`.
    async fn generate(&self, prompt: &str, context: &SessionContext) -> anyhow::Result<TextStream>;

    /// Release any per-session context held by the engine.
    async fn end_session(&self, _session_id: &str) {}
}

/// Incremental speech-synthesis engine.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn id(&self) -> &str;

    /// Format of the audio chunks this engine produces.
    fn output_format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: 16_000,
            encoding: SampleEncoding::S16le,
        }
    }

    /// Start synthesizing `text` into audio chunks.
    async fn synthesize(&self, text: &str) -> anyhow::Result<AudioStream>;
}

/// Inbound half of the duplex channel.
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next frame. `Ok(None)` means the channel closed.
    ///
    /// Must be cancel-safe: dropping the future before it resolves must not
    /// lose a frame.
    async fn recv_frame(&mut self) -> Result<Option<AudioFrame>, ChannelError>;
}

/// Outbound half of the duplex channel.
///
/// Sends enqueue onto an ordered per-connection queue and never block, so a
/// caller may hold a short critical section around a send.
pub trait AudioSink: Send + Sync {
    /// Emit one synthesized audio chunk.
    fn send_audio(&self, chunk: Vec<u8>) -> Result<(), ChannelError>;

    /// Emit an out-of-band event.
    fn send_event(&self, event: &ServerEvent) -> Result<(), ChannelError>;
}

/// Transport-level failure of the duplex channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel closed by peer")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

/// The set of engines one session's turns run against.
#[derive(Clone)]
pub struct Backends {
    pub classifier: Arc<dyn FrameClassifier>,
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn Generator>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("transcriber", &self.transcriber.id())
            .field("generator", &self.generator.id())
            .field("synthesizer", &self.synthesizer.id())
            .finish_non_exhaustive()
    }
}
