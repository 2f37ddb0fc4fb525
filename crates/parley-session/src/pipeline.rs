//! The response pipeline for one turn.
//!
//! transcribe -> generate (streamed) -> phrase chunking -> synthesize
//! (streamed) -> outbound audio, with the turn's [`CancelToken`] observed at
//! every await point and every outbound send gated on it.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio_stream::StreamExt;
use tracing::{debug, info};

use parley_core::backend::{AudioSink, Backends};
use parley_core::config::SessionSettings;
use parley_core::protocol::ServerEvent;
use parley_core::types::{SessionContext, TurnStage, TurnStatus, Utterance};

use crate::cancel::CancelToken;
use crate::chunker::PhraseChunker;
use crate::metrics;

/// Why a turn stopped before completing.
#[derive(Debug)]
enum Stop {
    Cancelled,
    Empty,
    Failed { stage: TurnStage, reason: String },
    Disconnected,
}

impl Stop {
    fn failed(stage: TurnStage) -> impl FnOnce(anyhow::Error) -> Stop {
        move |e| Stop::Failed {
            stage,
            reason: format!("{e:#}"),
        }
    }
}

impl From<Stop> for TurnStatus {
    fn from(stop: Stop) -> Self {
        match stop {
            Stop::Cancelled => TurnStatus::Interrupted,
            Stop::Empty => TurnStatus::AbortedEmpty,
            Stop::Failed { stage, reason } => TurnStatus::Failed { stage, reason },
            Stop::Disconnected => TurnStatus::Disconnected,
        }
    }
}

/// Await `fut` unless the token is (or becomes) signaled first.
///
/// The token is polled first, so a signal that landed before this call wins
/// even when `fut` is immediately ready. A losing `fut` is dropped.
async fn until_cancelled<F: Future>(token: &CancelToken, fut: F) -> Result<F::Output, Stop> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Stop::Cancelled),
        out = fut => Ok(out),
    }
}

fn check(token: &CancelToken) -> Result<(), Stop> {
    if token.is_cancelled() {
        Err(Stop::Cancelled)
    } else {
        Ok(())
    }
}

/// Everything a turn needs besides its utterance. Cheap to clone.
#[derive(Clone)]
pub struct TurnPipeline {
    backends: Backends,
    sink: Arc<dyn AudioSink>,
    min_transcript_chars: usize,
    phrase_max_chars: usize,
}

struct TurnRun<'a> {
    pipeline: &'a TurnPipeline,
    context: &'a SessionContext,
    token: &'a CancelToken,
    started: Instant,
    chunks_sent: usize,
    phrases: usize,
}

impl TurnPipeline {
    pub fn new(backends: Backends, sink: Arc<dyn AudioSink>, settings: &SessionSettings) -> Self {
        Self {
            backends,
            sink,
            min_transcript_chars: settings.min_transcript_chars,
            phrase_max_chars: settings.phrase_max_chars,
        }
    }

    /// Run one turn to termination. Never fails: every collaborator or
    /// transport error becomes the returned status.
    pub async fn run(
        &self,
        utterance: Utterance,
        context: SessionContext,
        token: CancelToken,
    ) -> TurnStatus {
        let mut run = TurnRun {
            pipeline: self,
            context: &context,
            token: &token,
            started: Instant::now(),
            chunks_sent: 0,
            phrases: 0,
        };
        let status = match run.drive(&utterance).await {
            Ok(()) => TurnStatus::Completed,
            Err(stop) => stop.into(),
        };
        debug!(
            session_id = %context.session_id,
            turn_id = %context.turn_id,
            phrases = run.phrases,
            chunks = run.chunks_sent,
            %status,
            "Turn pipeline finished"
        );
        status
    }
}

impl TurnRun<'_> {
    async fn drive(&mut self, utterance: &Utterance) -> Result<(), Stop> {
        let pipeline: &TurnPipeline = self.pipeline;
        let backends = &pipeline.backends;

        debug!(
            turn_id = %self.context.turn_id,
            audio_bytes = utterance.audio.len(),
            duration_ms = utterance.duration_ms(),
            "Transcribing utterance"
        );
        let transcript = until_cancelled(self.token, backends.transcriber.transcribe(utterance))
            .await?
            .map_err(Stop::failed(TurnStage::Transcription))?;
        let transcript = transcript.trim();
        if transcript.chars().count() < self.pipeline.min_transcript_chars {
            debug!(turn_id = %self.context.turn_id, transcript, "Transcript too short, aborting turn");
            return Err(Stop::Empty);
        }
        info!(turn_id = %self.context.turn_id, transcript, "User utterance transcribed");

        // From here on, user speech counts as barge-in
        if !self.token.arm() {
            return Err(Stop::Cancelled);
        }

        // Best-effort: a lost transcript event does not end the turn.
        let event = ServerEvent::Transcript {
            turn_id: self.context.turn_id,
            text: transcript.to_string(),
        };
        let _ = self
            .token
            .emit_if_live(|| self.pipeline.sink.send_event(&event));

        let mut fragments = until_cancelled(self.token, backends.generator.generate(transcript, self.context))
            .await?
            .map_err(Stop::failed(TurnStage::Generation))?;

        let mut chunker = PhraseChunker::new(pipeline.phrase_max_chars);
        while let Some(fragment) = until_cancelled(self.token, fragments.next()).await? {
            let fragment = fragment.map_err(Stop::failed(TurnStage::Generation))?;
            check(self.token)?;
            if let Some(phrase) = chunker.push(&fragment) {
                self.speak(&phrase).await?;
            }
        }
        drop(fragments);

        check(self.token)?;
        if let Some(phrase) = chunker.finish() {
            self.speak(&phrase).await?;
        }
        Ok(())
    }

    /// Synthesize one phrase and emit its chunks in order.
    async fn speak(&mut self, phrase: &str) -> Result<(), Stop> {
        self.phrases += 1;
        debug!(turn_id = %self.context.turn_id, phrase, "Synthesizing phrase");

        let mut audio = until_cancelled(self.token, self.pipeline.backends.synthesizer.synthesize(phrase))
            .await?
            .map_err(Stop::failed(TurnStage::Synthesis))?;

        while let Some(chunk) = until_cancelled(self.token, audio.next()).await? {
            let chunk = chunk.map_err(Stop::failed(TurnStage::Synthesis))?;
            match self.token.emit_if_live(|| self.pipeline.sink.send_audio(chunk)) {
                None => return Err(Stop::Cancelled),
                Some(Err(e)) => {
                    debug!(turn_id = %self.context.turn_id, error = %e, "Outbound send failed");
                    return Err(Stop::Disconnected);
                }
                Some(Ok(())) => {
                    if self.chunks_sent == 0 {
                        metrics::record_first_audio(self.started.elapsed().as_secs_f64());
                    }
                    self.chunks_sent += 1;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use parley_core::backend::{
        AudioStream, ChannelError, FrameClassifier, Generator, Synthesizer, TextStream, Transcriber,
    };
    use parley_core::types::{AudioFormat, AudioFrame, TurnId};

    struct NeverSpeech;

    impl FrameClassifier for NeverSpeech {
        fn classify(&self, _frame: &AudioFrame, _threshold: f32) -> bool {
            false
        }
    }

    struct FixedTranscript(&'static str);

    #[async_trait]
    impl Transcriber for FixedTranscript {
        fn id(&self) -> &str {
            "fixed"
        }
        async fn transcribe(&self, _utterance: &Utterance) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Fragments(Vec<&'static str>);

    #[async_trait]
    impl Generator for Fragments {
        fn id(&self) -> &str {
            "fragments"
        }
        async fn generate(&self, _prompt: &str, _context: &SessionContext) -> anyhow::Result<TextStream> {
            let items: Vec<anyhow::Result<String>> = self.0.iter().map(|f| Ok(f.to_string())).collect();
            Ok(Box::pin(tokio_stream::iter(items)))
        }
    }

    /// Echoes each phrase back as two chunks and records what it was asked.
    #[derive(Default)]
    struct Echo {
        phrases: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Synthesizer for Echo {
        fn id(&self) -> &str {
            "echo"
        }
        async fn synthesize(&self, text: &str) -> anyhow::Result<AudioStream> {
            if self.fail {
                anyhow::bail!("voice unavailable");
            }
            self.phrases.lock().unwrap().push(text.to_string());
            let chunks: Vec<anyhow::Result<Vec<u8>>> =
                vec![Ok(text.as_bytes().to_vec()), Ok(b"|".to_vec())];
            Ok(Box::pin(tokio_stream::iter(chunks)))
        }
    }

    #[derive(Default)]
    struct Recorder {
        audio: Mutex<Vec<Vec<u8>>>,
        events: Mutex<Vec<ServerEvent>>,
        closed: bool,
    }

    impl AudioSink for Recorder {
        fn send_audio(&self, chunk: Vec<u8>) -> Result<(), ChannelError> {
            if self.closed {
                return Err(ChannelError::Closed);
            }
            self.audio.lock().unwrap().push(chunk);
            Ok(())
        }
        fn send_event(&self, event: &ServerEvent) -> Result<(), ChannelError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn utterance() -> Utterance {
        Utterance {
            audio: vec![0u8; 64],
            format: AudioFormat::default(),
            started_at: chrono::Utc::now(),
            frames: 1,
        }
    }

    fn context() -> SessionContext {
        SessionContext {
            session_id: "test".into(),
            turn_id: TurnId(0),
        }
    }

    fn pipeline(
        transcript: &'static str,
        fragments: Vec<&'static str>,
        synth: Arc<Echo>,
        sink: Arc<Recorder>,
    ) -> TurnPipeline {
        let backends = Backends {
            classifier: Arc::new(NeverSpeech),
            transcriber: Arc::new(FixedTranscript(transcript)),
            generator: Arc::new(Fragments(fragments)),
            synthesizer: synth,
        };
        TurnPipeline::new(backends, sink, &SessionSettings::default())
    }

    #[tokio::test]
    async fn test_completed_turn_emits_phrases_in_order() {
        let synth = Arc::new(Echo::default());
        let sink = Arc::new(Recorder::default());
        let p = pipeline("hello", vec!["Hi", "!", " How", " are you?"], synth.clone(), sink.clone());

        let status = p.run(utterance(), context(), CancelToken::new()).await;
        assert_eq!(status, TurnStatus::Completed);
        assert_eq!(*synth.phrases.lock().unwrap(), vec!["Hi!", "How are you?"]);
        assert_eq!(
            sink.audio.lock().unwrap().concat(),
            b"Hi!|How are you?|".to_vec()
        );
        assert!(matches!(
            sink.events.lock().unwrap().first(),
            Some(ServerEvent::Transcript { text, .. }) if text == "hello"
        ));
    }

    #[tokio::test]
    async fn test_short_transcript_aborts_before_generation() {
        let synth = Arc::new(Echo::default());
        let sink = Arc::new(Recorder::default());
        let p = pipeline(" a ", vec!["never"], synth.clone(), sink.clone());

        let token = CancelToken::new();
        let status = p.run(utterance(), context(), token.clone()).await;
        assert_eq!(status, TurnStatus::AbortedEmpty);
        assert!(!token.is_armed());
        assert!(synth.phrases.lock().unwrap().is_empty());
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_accepted_transcript_arms_token() {
        let sink = Arc::new(Recorder::default());
        let p = pipeline("hello", vec!["Hi."], Arc::new(Echo::default()), sink);

        let token = CancelToken::new();
        let status = p.run(utterance(), context(), token.clone()).await;
        assert_eq!(status, TurnStatus::Completed);
        assert!(token.is_armed());
    }

    #[tokio::test]
    async fn test_pre_signaled_token_emits_nothing() {
        let synth = Arc::new(Echo::default());
        let sink = Arc::new(Recorder::default());
        let p = pipeline("hello", vec!["Hi."], synth.clone(), sink.clone());
        let token = CancelToken::new();
        token.signal();

        let status = p.run(utterance(), context(), token).await;
        assert_eq!(status, TurnStatus::Interrupted);
        assert!(sink.audio.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_synthesis_failure_fails_turn() {
        let synth = Arc::new(Echo {
            fail: true,
            ..Echo::default()
        });
        let sink = Arc::new(Recorder::default());
        let p = pipeline("hello", vec!["Hi."], synth, sink.clone());

        let status = p.run(utterance(), context(), CancelToken::new()).await;
        match status {
            TurnStatus::Failed { stage, reason } => {
                assert_eq!(stage, TurnStage::Synthesis);
                assert!(reason.contains("voice unavailable"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(sink.audio.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_sink_is_disconnect() {
        let synth = Arc::new(Echo::default());
        let sink = Arc::new(Recorder {
            closed: true,
            ..Recorder::default()
        });
        let p = pipeline("hello", vec!["Hi.", " Bye."], synth.clone(), sink);

        let status = p.run(utterance(), context(), CancelToken::new()).await;
        assert_eq!(status, TurnStatus::Disconnected);
        // Stops at the first failed send; the second phrase is never synthesized
        assert_eq!(synth.phrases.lock().unwrap().len(), 1);
    }
}
