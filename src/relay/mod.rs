//! # Completion Relay
//!
//! Turns one prompt into a lazy sequence of [`ContentFragment`]s.
//!
//! ## Contract:
//! - Zero or more `Delta` fragments, then exactly one terminal fragment
//!   (`End` or `Failure`), then nothing.
//! - Failures never escape as errors: a provider status error becomes a
//!   `Failure` naming the status code, anything else becomes the configured
//!   technical-incident message.
//! - Dropping the stream releases the upstream request.

pub mod openai;
pub mod sse;

pub use openai::OpenAiRelay;

use crate::prompt::ChatMessage;
use futures_util::stream::BoxStream;

/// One unit of provider output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentFragment {
    /// Partial reply text
    Delta(String),
    /// Provider finished; carries no text
    End,
    /// The turn failed; the text is what the caller should hear
    Failure(String),
}

impl ContentFragment {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContentFragment::End | ContentFragment::Failure(_))
    }

    pub fn content(&self) -> &str {
        match self {
            ContentFragment::Delta(text) | ContentFragment::Failure(text) => text,
            ContentFragment::End => "",
        }
    }
}

pub type FragmentStream = BoxStream<'static, ContentFragment>;

/// Anything that can answer a prompt with a fragment stream.
pub trait CompletionProvider: Send + Sync {
    /// Start one completion. Not restartable: call again for a new attempt.
    fn stream(&self, messages: Vec<ChatMessage>) -> FragmentStream;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_fragments() {
        assert!(!ContentFragment::Delta("hi".to_string()).is_terminal());
        assert!(ContentFragment::End.is_terminal());
        assert!(ContentFragment::Failure("oops".to_string()).is_terminal());
        assert_eq!(ContentFragment::End.content(), "");
        assert_eq!(ContentFragment::Delta("hi".to_string()).content(), "hi");
    }
}
