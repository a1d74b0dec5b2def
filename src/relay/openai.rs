//! OpenAI-compatible chat-completion relay.
//!
//! `POST {base_url}/chat/completions` with bearer auth, one attempt per turn.
//! Streaming mode reads SSE deltas; non-streaming mode reads one message.

use super::sse::{SseDecoder, SseEvent};
use super::{CompletionProvider, ContentFragment, FragmentStream};
use crate::config::ProviderConfig;
use crate::error::RelayError;
use crate::prompt::ChatMessage;
use async_stream::stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

pub struct OpenAiRelay {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    temperature: f32,
    streaming: bool,
    incident_message: String,
}

impl OpenAiRelay {
    pub fn new(config: &ProviderConfig, incident_message: impl Into<String>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            url: config.completions_url(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            streaming: config.stream,
            incident_message: incident_message.into(),
        })
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<MessageContent>,
}

#[derive(Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

impl CompletionProvider for OpenAiRelay {
    fn stream(&self, messages: Vec<ChatMessage>) -> FragmentStream {
        let request = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&CompletionRequest {
                model: &self.model,
                messages: &messages,
                temperature: self.temperature,
                stream: self.streaming,
            });
        let streaming = self.streaming;
        let incident = self.incident_message.clone();

        debug!(model = %self.model, messages = messages.len(), streaming, "Opening completion request");

        Box::pin(stream! {
            let response = match open(request).await {
                Ok(response) => response,
                Err(err) => {
                    yield failure(&err, &incident);
                    return;
                }
            };

            if !streaming {
                match read_completion(response).await {
                    Ok(text) => {
                        if !text.is_empty() {
                            yield ContentFragment::Delta(text);
                        }
                        yield ContentFragment::End;
                    }
                    Err(err) => {
                        yield failure(&err, &incident);
                    }
                }
                return;
            }

            let mut decoder = SseDecoder::new();
            let mut body = response.bytes_stream();
            let mut body_done = false;

            while !body_done {
                let events = match body.next().await {
                    Some(Ok(chunk)) => decoder.push(&chunk),
                    Some(Err(err)) => {
                        yield failure(&RelayError::from(err), &incident);
                        return;
                    }
                    None => {
                        body_done = true;
                        decoder.finish().into_iter().collect()
                    }
                };

                for event in events {
                    match event {
                        SseEvent::Done => {
                            yield ContentFragment::End;
                            return;
                        }
                        SseEvent::Data(data) => match parse_delta(&data) {
                            Ok(Some(text)) => {
                                yield ContentFragment::Delta(text);
                            }
                            Ok(None) => {}
                            Err(err) => {
                                yield failure(&err, &incident);
                                return;
                            }
                        },
                    }
                }
            }

            // Body closed without [DONE]; everything received was delivered
            yield ContentFragment::End;
        })
    }
}

async fn open(request: reqwest::RequestBuilder) -> Result<reqwest::Response, RelayError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(RelayError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn read_completion(response: reqwest::Response) -> Result<String, RelayError> {
    let completion: Completion = response.json().await?;
    Ok(completion
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .unwrap_or_default())
}

fn parse_delta(data: &str) -> Result<Option<String>, RelayError> {
    let chunk: StreamChunk = serde_json::from_str(data)?;

    if let Some(error) = chunk.error {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(RelayError::Provider(message));
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)
        .filter(|text| !text.is_empty()))
}

fn failure(err: &RelayError, incident: &str) -> ContentFragment {
    warn!(error = %err, "Completion relay failed");
    match err {
        RelayError::Status { status, .. } => ContentFragment::Failure(status_message(*status)),
        _ => ContentFragment::Failure(incident.to_string()),
    }
}

/// Spoken text for a provider status error. Always names the status code.
pub fn status_message(status: u16) -> String {
    let hint = match status {
        401 | 403 => "la clé d'accès au service est refusée",
        402 => "le crédit du compte est épuisé",
        429 => "la limite de requêtes ou le quota est atteint",
        500..=599 => "le service est momentanément indisponible",
        _ => "la requête a été refusée",
    };
    format!(
        "Désolé, je ne peux pas répondre pour le moment (erreur {}) : {}.",
        status, hint
    )
}
