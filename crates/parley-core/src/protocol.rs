//! Parley voice wire protocol.
//!
//! Audio travels as binary WebSocket messages in both directions. Out-of-band
//! signaling from server to client uses JSON text messages tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::types::{AudioFormat, TurnId, TurnStatus};

/// Server -> Client out-of-band event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Session is set up and accepting audio. `audio` is the format of the
    /// binary messages the server will send.
    Ready {
        session_id: String,
        audio: AudioFormat,
    },

    /// The user barged in; the client should drop any queued playback.
    Interrupt,

    /// Transcript of the utterance that opened a turn.
    Transcript { turn_id: TurnId, text: String },

    /// A turn terminated.
    TurnEnd { turn_id: TurnId, status: String },
}

impl ServerEvent {
    pub fn turn_end(turn_id: TurnId, status: &TurnStatus) -> Self {
        ServerEvent::TurnEnd {
            turn_id,
            status: status.as_str().to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
