//! In-memory conversation history, one bounded transcript per session.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// A chat message in OpenAI wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Per-session conversation memory.
///
/// Only completed exchanges are recorded; an interrupted reply never enters
/// the history. Memory for a session is dropped when the session ends.
#[derive(Debug, Default)]
pub struct ConversationMemory {
    max_messages: usize,
    sessions: RwLock<HashMap<String, Vec<ChatMessage>>>,
}

impl ConversationMemory {
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_messages > 0
    }

    /// History for a session, oldest first.
    pub async fn history(&self, session_id: &str) -> Vec<ChatMessage> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Append one completed user/assistant exchange.
    pub async fn record(&self, session_id: &str, user: &str, assistant: &str) {
        if !self.is_enabled() {
            return;
        }
        let mut sessions = self.sessions.write().await;
        let history = sessions.entry(session_id.to_string()).or_default();
        history.push(ChatMessage::user(user));
        history.push(ChatMessage::assistant(assistant));

        // Trim whole exchanges so the history always opens with a user turn
        let keep = (self.max_messages / 2).max(1) * 2;
        if history.len() > keep {
            let excess = history.len() - keep;
            history.drain(..excess);
        }
    }

    pub async fn forget(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_odd_limit_keeps_whole_exchanges() {
        let memory = ConversationMemory::new(3);
        memory.record("s1", "one", "1").await;
        memory.record("s1", "two", "2").await;
        let history = memory.history("s1").await;
        assert_eq!(
            history,
            vec![ChatMessage::user("two"), ChatMessage::assistant("2")]
        );

        let tiny = ConversationMemory::new(1);
        tiny.record("s1", "hi", "hello").await;
        assert_eq!(tiny.history("s1").await[0].role, "user");
    }

    #[tokio::test]
    async fn test_record_and_read_back() {
        let memory = ConversationMemory::new(10);
        memory.record("s1", "hi", "hello!").await;
        let history = memory.history("s1").await;
        assert_eq!(
            history,
            vec![ChatMessage::user("hi"), ChatMessage::assistant("hello!")]
        );
        assert!(memory.history("s2").await.is_empty());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let memory = ConversationMemory::new(4);
        for i in 0..5 {
            memory.record("s1", &format!("q{i}"), &format!("a{i}")).await;
        }
        let history = memory.history("s1").await;
        assert_eq!(history.len(), 4);
        assert_eq!(history[0], ChatMessage::user("q3"));
        assert_eq!(history[3], ChatMessage::assistant("a4"));
    }

    #[tokio::test]
    async fn test_disabled_memory_records_nothing() {
        let memory = ConversationMemory::new(0);
        memory.record("s1", "hi", "hello").await;
        assert!(memory.history("s1").await.is_empty());
        assert_eq!(memory.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_forget_releases_session() {
        let memory = ConversationMemory::new(10);
        memory.record("s1", "hi", "hello").await;
        memory.record("s2", "yo", "hey").await;
        memory.forget("s1").await;
        assert_eq!(memory.session_count().await, 1);
        assert!(memory.history("s1").await.is_empty());
    }
}
