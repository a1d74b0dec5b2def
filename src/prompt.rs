//! Builds the message list sent to the model provider for one turn.

use crate::config::PromptConfig;
use crate::protocol::{Transcript, TurnRequest};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Turns a [`TurnRequest`] into `[system, ...conversation]`.
///
/// Content is taken from the first source that yields something:
/// transcript, then `content`, then `delta`, then the fallback message.
#[derive(Debug, Clone)]
pub struct PromptAssembler {
    system_prompt: String,
    fallback_user_message: String,
}

impl PromptAssembler {
    pub fn new(system_prompt: impl Into<String>, fallback_user_message: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            fallback_user_message: fallback_user_message.into(),
        }
    }

    pub fn from_config(config: &PromptConfig) -> Self {
        Self::new(&config.system_prompt, &config.fallback_user_message)
    }

    pub fn build(&self, request: &TurnRequest) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::new(Role::System, &self.system_prompt)];
        messages.extend(self.conversation(request));
        messages
    }

    fn conversation(&self, request: &TurnRequest) -> Vec<ChatMessage> {
        if let Some(turns) = request.transcript.as_ref().map(transcript_messages) {
            if !turns.is_empty() {
                return turns;
            }
        }

        let direct = [request.content.as_deref(), request.delta.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|text| !text.is_empty());

        match direct {
            Some(text) => vec![ChatMessage::new(Role::User, text)],
            None => vec![ChatMessage::new(Role::User, &self.fallback_user_message)],
        }
    }
}

fn transcript_messages(transcript: &Transcript) -> Vec<ChatMessage> {
    match transcript {
        Transcript::Text(text) if !text.trim().is_empty() => {
            vec![ChatMessage::new(Role::User, text.trim())]
        }
        Transcript::Text(_) => Vec::new(),
        Transcript::Turns(turns) => turns
            .iter()
            .filter_map(|turn| {
                let content = turn.content.as_deref()?.trim();
                if content.is_empty() {
                    return None;
                }
                let role = if turn.is_assistant() {
                    Role::Assistant
                } else {
                    Role::User
                };
                Some(ChatMessage::new(role, content))
            })
            .collect(),
    }
}
