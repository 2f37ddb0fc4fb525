//! Turn-taking metrics.
//!
//! Recorded through the `metrics` facade; without an installed recorder every
//! call is a no-op.

use parley_core::types::TurnStatus;

/// Record a session opening.
pub fn record_session_open() {
    metrics::gauge!("sessions_active").increment(1.0);
}

/// Record a session closing.
pub fn record_session_close() {
    metrics::gauge!("sessions_active").decrement(1.0);
}

/// Record a turn pipeline starting.
pub fn record_turn_start() {
    metrics::gauge!("turns_active").increment(1.0);
}

/// Record a turn ending with its status and duration.
pub fn record_turn_end(status: &TurnStatus, duration_secs: f64) {
    let labels = [("status", status.as_str().to_string())];
    metrics::gauge!("turns_active").decrement(1.0);
    metrics::counter!("turns_total", &labels).increment(1);
    metrics::histogram!("turn_duration_seconds", &labels).record(duration_secs);
}

/// Record the delay between turn start and its first emitted audio chunk.
pub fn record_first_audio(latency_secs: f64) {
    metrics::histogram!("turn_first_audio_seconds").record(latency_secs);
}

pub fn record_barge_in() {
    metrics::counter!("barge_in_total").increment(1);
}

/// Record an utterance dropped for being too short or arriving mid-turn.
pub fn record_utterance_discarded(reason: &'static str) {
    let labels = [("reason", reason)];
    metrics::counter!("utterances_discarded_total", &labels).increment(1);
}

/// Record an inbound frame dropped as malformed.
pub fn record_malformed_frame() {
    metrics::counter!("frames_malformed_total").increment(1);
}
