//! Turn-taking core for full-duplex spoken dialogue.
//!
//! A [`Session`] ingests classified audio frames, segments them into
//! utterances, and runs at most one cancellable [`TurnPipeline`] at a time.
//! Speech detected while a reply is playing cancels it (barge-in).

pub mod cancel;
pub mod chunker;
pub mod controller;
pub mod metrics;
pub mod pipeline;
pub mod session;

pub use cancel::CancelToken;
pub use chunker::PhraseChunker;
pub use controller::{BargeIn, StartedTurn, TurnController, TurnState};
pub use pipeline::TurnPipeline;
pub use session::{Session, SessionSummary};
