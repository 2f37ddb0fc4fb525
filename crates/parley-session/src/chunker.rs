//! Groups generated text fragments into speakable phrases.

const SENTENCE_TERMINALS: [char; 3] = ['.', '!', '?'];

/// Accumulates text fragments and decides when a phrase is ready for
/// synthesis.
///
/// A phrase is flushed when a fragment carries sentence-terminal punctuation
/// or the buffer grows past `max_chars`. Flushed phrases are trimmed and never
/// empty.
#[derive(Debug)]
pub struct PhraseChunker {
    buffer: String,
    max_chars: usize,
}

impl PhraseChunker {
    pub fn new(max_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            max_chars,
        }
    }

    /// Append a fragment, returning a phrase if this fragment completes one.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        self.buffer.push_str(fragment);
        let terminal = fragment.contains(SENTENCE_TERMINALS);
        if terminal || self.buffer.chars().count() > self.max_chars {
            return self.take();
        }
        None
    }

    /// Flush whatever remains once generation has ended.
    pub fn finish(&mut self) -> Option<String> {
        self.take()
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn take(&mut self) -> Option<String> {
        let phrase = self.buffer.trim().to_string();
        self.buffer.clear();
        (!phrase.is_empty()).then_some(phrase)
    }
}
