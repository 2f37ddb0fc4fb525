//! Turn state machine: starts turns from flushed utterances and detects barge-in.
//!
//! The controller is synchronous and owned by the session's ingest task, which
//! makes it the single writer of turn state. The only state it shares with a
//! running pipeline is that turn's [`CancelToken`]: the pipeline arms it once
//! the transcript is accepted, which moves the turn from `Transcribing` to
//! `Responding` on the next frame.

use tracing::debug;

use parley_core::types::TurnId;

use crate::cancel::CancelToken;

#[derive(Debug, Clone, Default)]
pub enum TurnState {
    #[default]
    Idle,
    /// A pipeline is running but has not accepted its transcript yet. Speech
    /// here is the user still talking, not barge-in.
    Transcribing { turn_id: TurnId, token: CancelToken },
    Responding { turn_id: TurnId, token: CancelToken },
}

impl TurnState {
    fn active(&self) -> Option<(TurnId, &CancelToken)> {
        match self {
            TurnState::Idle => None,
            TurnState::Transcribing { turn_id, token } | TurnState::Responding { turn_id, token } => {
                Some((*turn_id, token))
            }
        }
    }
}

/// A turn the controller just committed to. The caller must start exactly one
/// pipeline for it.
#[derive(Debug, Clone)]
pub struct StartedTurn {
    pub turn_id: TurnId,
    pub token: CancelToken,
}

/// Barge-in fired for the active turn. Its token has already been signaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BargeIn {
    pub turn_id: TurnId,
    /// Consecutive speech frames observed when it fired.
    pub speech_run: u32,
}

#[derive(Debug)]
pub struct TurnController {
    state: TurnState,
    barge_in_frames: u32,
    speech_run: u32,
    next_turn_id: u64,
}

impl TurnController {
    /// `barge_in_frames`: barge-in fires once the consecutive speech run
    /// exceeds this count.
    pub fn new(barge_in_frames: u32) -> Self {
        Self {
            state: TurnState::Idle,
            barge_in_frames,
            speech_run: 0,
            next_turn_id: 0,
        }
    }

    pub fn state(&self) -> &TurnState {
        &self.state
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, TurnState::Idle)
    }

    pub fn active_turn(&self) -> Option<TurnId> {
        self.state.active().map(|(turn_id, _)| turn_id)
    }

    pub fn speech_run(&self) -> u32 {
        self.speech_run
    }

    /// An utterance was flushed. Starts a turn when idle; ignored while a
    /// turn is active.
    pub fn on_utterance(&mut self) -> Option<StartedTurn> {
        if !self.is_idle() {
            return None;
        }
        let turn_id = TurnId(self.next_turn_id);
        self.next_turn_id += 1;
        let token = CancelToken::new();
        self.speech_run = 0;
        self.state = TurnState::Transcribing {
            turn_id,
            token: token.clone(),
        };
        debug!(%turn_id, "Turn started");
        Some(StartedTurn { turn_id, token })
    }

    /// Feed one classified frame. Only counts while responding.
    pub fn on_frame(&mut self, is_speech: bool) -> Option<BargeIn> {
        if let TurnState::Transcribing { turn_id, token } = &self.state {
            if !token.is_armed() {
                return None;
            }
            debug!(%turn_id, "Transcript accepted, barge-in armed");
            self.state = TurnState::Responding {
                turn_id: *turn_id,
                token: token.clone(),
            };
            self.speech_run = 0;
        }
        let TurnState::Responding { turn_id, token } = &self.state else {
            return None;
        };
        if !is_speech {
            self.speech_run = 0;
            return None;
        }
        self.speech_run = self.speech_run.saturating_add(1);
        if self.speech_run > self.barge_in_frames && token.signal() {
            return Some(BargeIn {
                turn_id: *turn_id,
                speech_run: self.speech_run,
            });
        }
        None
    }

    /// The pipeline for `turn_id` terminated. Stale ids are ignored.
    pub fn on_turn_finished(&mut self, turn_id: TurnId) -> bool {
        match self.state.active() {
            Some((active, _)) if active == turn_id => {
                self.state = TurnState::Idle;
                self.speech_run = 0;
                debug!(%turn_id, "Turn finished, controller idle");
                true
            }
            _ => false,
        }
    }

    /// Signal the active turn's token without counting as barge-in.
    /// Used when the session is closing.
    pub fn cancel_active(&self) -> bool {
        self.state
            .active()
            .is_some_and(|(_, token)| token.signal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_turn_only_when_idle() {
        let mut controller = TurnController::new(5);
        let first = controller.on_utterance().expect("idle controller starts a turn");
        assert_eq!(first.turn_id, TurnId(0));
        assert!(controller.on_utterance().is_none());
        assert_eq!(controller.active_turn(), Some(TurnId(0)));

        assert!(controller.on_turn_finished(TurnId(0)));
        let second = controller.on_utterance().unwrap();
        assert_eq!(second.turn_id, TurnId(1));
    }

    #[test]
    fn test_frames_ignored_while_idle() {
        let mut controller = TurnController::new(2);
        for _ in 0..10 {
            assert!(controller.on_frame(true).is_none());
        }
        assert_eq!(controller.speech_run(), 0);
    }

    #[test]
    fn test_barge_in_fires_after_threshold_exceeded() {
        let mut controller = TurnController::new(5);
        let turn = controller.on_utterance().unwrap();
        turn.token.arm();
        for _ in 0..5 {
            assert!(controller.on_frame(true).is_none());
        }
        assert!(!turn.token.is_cancelled());
        let barge_in = controller.on_frame(true).expect("sixth speech frame fires");
        assert_eq!(barge_in.turn_id, turn.turn_id);
        assert_eq!(barge_in.speech_run, 6);
        assert!(turn.token.is_cancelled());
    }

    #[test]
    fn test_barge_in_fires_once_per_turn() {
        let mut controller = TurnController::new(1);
        controller.on_utterance().unwrap().token.arm();
        let fired = (0..20).filter_map(|_| controller.on_frame(true)).count();
        assert_eq!(fired, 1);

        // Silence then speech again within the same turn does not refire
        controller.on_frame(false);
        let fired = (0..20).filter_map(|_| controller.on_frame(true)).count();
        assert_eq!(fired, 0);
    }

    #[test]
    fn test_silence_resets_speech_run() {
        let mut controller = TurnController::new(3);
        let turn = controller.on_utterance().unwrap();
        turn.token.arm();
        for _ in 0..3 {
            controller.on_frame(true);
        }
        controller.on_frame(false);
        assert_eq!(controller.speech_run(), 0);
        for _ in 0..3 {
            assert!(controller.on_frame(true).is_none());
        }
        assert!(!turn.token.is_cancelled());
        assert!(controller.on_frame(true).is_some());
    }

    #[test]
    fn test_speech_while_transcribing_is_not_barge_in() {
        let mut controller = TurnController::new(2);
        let turn = controller.on_utterance().unwrap();
        assert!(matches!(controller.state(), TurnState::Transcribing { .. }));

        for _ in 0..20 {
            assert!(controller.on_frame(true).is_none());
        }
        assert!(!turn.token.is_cancelled());
        assert_eq!(controller.speech_run(), 0);
        assert_eq!(controller.active_turn(), Some(TurnId(0)));
        // Still one turn at a time
        assert!(controller.on_utterance().is_none());
    }

    #[test]
    fn test_arming_starts_barge_in_count_from_zero() {
        let mut controller = TurnController::new(2);
        let turn = controller.on_utterance().unwrap();
        controller.on_frame(true);
        controller.on_frame(true);

        turn.token.arm();
        assert!(controller.on_frame(true).is_none());
        assert!(matches!(controller.state(), TurnState::Responding { .. }));
        assert!(controller.on_frame(true).is_none());
        assert!(controller.on_frame(true).is_some());
    }

    #[test]
    fn test_finish_while_transcribing_returns_to_idle() {
        let mut controller = TurnController::new(5);
        controller.on_utterance().unwrap();
        assert!(controller.on_turn_finished(TurnId(0)));
        assert!(controller.is_idle());
    }

    #[test]
    fn test_stale_finish_is_ignored() {
        let mut controller = TurnController::new(5);
        controller.on_utterance().unwrap();
        assert!(!controller.on_turn_finished(TurnId(7)));
        assert!(!controller.is_idle());
    }

    #[test]
    fn test_counter_does_not_leak_into_next_turn() {
        let mut controller = TurnController::new(3);
        controller.on_utterance().unwrap().token.arm();
        controller.on_frame(true);
        controller.on_frame(true);
        controller.on_turn_finished(TurnId(0));

        let turn = controller.on_utterance().unwrap();
        turn.token.arm();
        controller.on_frame(true);
        controller.on_frame(true);
        assert!(!turn.token.is_cancelled());
    }

    #[test]
    fn test_cancel_active_signals_token() {
        let mut controller = TurnController::new(5);
        assert!(!controller.cancel_active());
        let turn = controller.on_utterance().unwrap();
        assert!(controller.cancel_active());
        assert!(turn.token.is_cancelled());
        // Barge-in cannot fire on an already-signaled token
        let fired = (0..10).filter_map(|_| controller.on_frame(true)).count();
        assert_eq!(fired, 0);
    }
}
