//! Text-generation providers.
//!
//! Each provider implements [`parley_core::backend::Generator`], yielding the
//! reply as a lazy stream of text fragments so synthesis can start before the
//! reply is complete.

pub mod memory;
pub mod openai;
pub mod sse;

pub use memory::{ChatMessage, ConversationMemory};
pub use openai::OpenAiGenerator;
