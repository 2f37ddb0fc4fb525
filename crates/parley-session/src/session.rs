//! Per-connection session loop.
//!
//! One ingest loop per connection classifies and segments inbound frames and
//! drives the [`TurnController`]. Turn pipelines run as separately spawned
//! tasks whose handles the session tracks, so at most one is ever live.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use parley_core::backend::{AudioSink, Backends, FrameClassifier, FrameSource, Generator};
use parley_core::config::SessionSettings;
use parley_core::protocol::ServerEvent;
use parley_core::types::{AudioFrame, SessionContext, TurnId, TurnStage, TurnStatus, Utterance};
use parley_media::{SegmentEvent, UtteranceSegmenter};

use crate::controller::{BargeIn, TurnController};
use crate::metrics;
use crate::pipeline::TurnPipeline;

/// How long a closing session waits for a cancelled pipeline to wind down
/// before aborting its task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct ActiveTurn {
    turn_id: TurnId,
    handle: JoinHandle<TurnStatus>,
    started: Instant,
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    pub frames: u64,
    pub dropped_frames: u64,
    pub turns: u64,
    pub barge_ins: u64,
}

pub struct Session<S> {
    id: String,
    settings: SessionSettings,
    source: S,
    sink: Arc<dyn AudioSink>,
    classifier: Arc<dyn FrameClassifier>,
    generator: Arc<dyn Generator>,
    segmenter: UtteranceSegmenter,
    controller: TurnController,
    pipeline: TurnPipeline,
    active: Option<ActiveTurn>,
    shutdown: CancellationToken,
    summary: SessionSummary,
}

impl<S: FrameSource> Session<S> {
    pub fn new(
        source: S,
        sink: Arc<dyn AudioSink>,
        backends: Backends,
        settings: SessionSettings,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self {
            summary: SessionSummary {
                session_id: id.clone(),
                ..SessionSummary::default()
            },
            id,
            segmenter: UtteranceSegmenter::from_settings(&settings),
            controller: TurnController::new(settings.barge_in_frames),
            pipeline: TurnPipeline::new(backends.clone(), sink.clone(), &settings),
            classifier: backends.classifier,
            generator: backends.generator,
            settings,
            source,
            sink,
            active: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Close the session when `shutdown` is cancelled, as if the channel closed.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until the channel closes or shutdown is requested.
    pub async fn run(mut self) -> SessionSummary {
        metrics::record_session_open();
        info!(session_id = %self.id, "Session started");

        loop {
            tokio::select! {
                biased;
                (turn_id, joined) = join_active(&mut self.active) => {
                    self.finish_turn(turn_id, joined);
                }
                _ = self.shutdown.cancelled() => {
                    info!(session_id = %self.id, "Session shutdown requested");
                    break;
                }
                received = self.source.recv_frame() => match received {
                    Ok(Some(frame)) => self.ingest(frame),
                    Ok(None) => {
                        info!(session_id = %self.id, "Channel closed");
                        break;
                    }
                    Err(e) => {
                        warn!(session_id = %self.id, error = %e, "Channel failed");
                        break;
                    }
                },
            }
        }

        self.close().await
    }

    /// Process one inbound frame. Never awaits.
    fn ingest(&mut self, frame: AudioFrame) {
        self.summary.frames += 1;
        if !frame.is_well_formed() || frame.format != self.settings.format {
            trace!(session_id = %self.id, bytes = frame.len(), "Dropping malformed frame");
            self.summary.dropped_frames += 1;
            metrics::record_malformed_frame();
            return;
        }

        let is_speech = self.classifier.classify(&frame, self.settings.vad_threshold);

        if let Some(barge_in) = self.controller.on_frame(is_speech) {
            self.on_barge_in(barge_in);
        }

        match self.segmenter.push(frame, is_speech) {
            Some(SegmentEvent::Flushed(utterance)) => self.on_utterance(utterance),
            Some(SegmentEvent::Discarded { bytes }) => {
                debug!(session_id = %self.id, bytes, "Short utterance discarded");
                metrics::record_utterance_discarded("too_short");
            }
            None => {}
        }
    }

    fn on_barge_in(&mut self, barge_in: BargeIn) {
        self.summary.barge_ins += 1;
        metrics::record_barge_in();
        info!(
            session_id = %self.id,
            turn_id = %barge_in.turn_id,
            speech_run = barge_in.speech_run,
            "Barge-in, cancelling turn"
        );
        // The token is already signaled; the notice is best-effort.
        if let Err(e) = self.sink.send_event(&ServerEvent::Interrupt) {
            debug!(session_id = %self.id, error = %e, "Failed to send interrupt notice");
        }
    }

    fn on_utterance(&mut self, utterance: Utterance) {
        let Some(turn) = self.controller.on_utterance() else {
            debug!(
                session_id = %self.id,
                bytes = utterance.audio.len(),
                "Utterance flushed while a turn is active, discarded"
            );
            metrics::record_utterance_discarded("turn_active");
            return;
        };
        debug_assert!(self.active.is_none());

        info!(
            session_id = %self.id,
            turn_id = %turn.turn_id,
            duration_ms = utterance.duration_ms(),
            "Starting turn"
        );
        metrics::record_turn_start();

        let context = SessionContext {
            session_id: self.id.clone(),
            turn_id: turn.turn_id,
        };
        let pipeline = self.pipeline.clone();
        let token = turn.token;
        let handle = tokio::spawn(async move { pipeline.run(utterance, context, token).await });

        self.active = Some(ActiveTurn {
            turn_id: turn.turn_id,
            handle,
            started: Instant::now(),
        });
    }

    fn finish_turn(&mut self, turn_id: TurnId, joined: Result<TurnStatus, JoinError>) {
        let started = self.active.take().map(|t| t.started);
        let status = status_from_join(joined);
        self.controller.on_turn_finished(turn_id);
        self.summary.turns += 1;

        let elapsed = started.map(|s| s.elapsed()).unwrap_or_default();
        metrics::record_turn_end(&status, elapsed.as_secs_f64());

        match &status {
            TurnStatus::Failed { stage, reason } => {
                warn!(session_id = %self.id, %turn_id, %stage, %reason, "Turn failed");
            }
            TurnStatus::AbortedEmpty => {
                debug!(session_id = %self.id, %turn_id, "Turn aborted on empty transcript");
            }
            other => {
                info!(
                    session_id = %self.id,
                    %turn_id,
                    status = %other,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Turn ended"
                );
            }
        }

        if status != TurnStatus::Disconnected {
            let _ = self.sink.send_event(&ServerEvent::turn_end(turn_id, &status));
        }
    }

    async fn close(mut self) -> SessionSummary {
        if let Some(mut active) = self.active.take() {
            self.controller.cancel_active();
            let joined = match tokio::time::timeout(SHUTDOWN_GRACE, &mut active.handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(session_id = %self.id, turn_id = %active.turn_id, "Pipeline did not stop, aborting");
                    active.handle.abort();
                    (&mut active.handle).await
                }
            };
            let status = status_from_join(joined);
            self.controller.on_turn_finished(active.turn_id);
            self.summary.turns += 1;
            metrics::record_turn_end(&status, active.started.elapsed().as_secs_f64());
            debug!(session_id = %self.id, turn_id = %active.turn_id, %status, "Active turn closed with session");
        }

        self.generator.end_session(&self.id).await;
        metrics::record_session_close();
        info!(
            session_id = %self.id,
            frames = self.summary.frames,
            turns = self.summary.turns,
            barge_ins = self.summary.barge_ins,
            "Session ended"
        );
        self.summary
    }
}

/// Resolve when the active turn's task finishes; pending forever when idle.
/// Cancel-safe.
async fn join_active(active: &mut Option<ActiveTurn>) -> (TurnId, Result<TurnStatus, JoinError>) {
    match active {
        Some(turn) => {
            let joined = (&mut turn.handle).await;
            (turn.turn_id, joined)
        }
        None => std::future::pending().await,
    }
}

fn status_from_join(joined: Result<TurnStatus, JoinError>) -> TurnStatus {
    match joined {
        Ok(status) => status,
        Err(e) if e.is_panic() => TurnStatus::Failed {
            stage: TurnStage::Task,
            reason: "pipeline panicked".into(),
        },
        Err(e) => TurnStatus::Failed {
            stage: TurnStage::Task,
            reason: e.to_string(),
        },
    }
}
