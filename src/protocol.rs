//! # Caller Wire Protocol
//!
//! Every frame on the call socket is a JSON text frame shaped as
//! `{"type": <kind>, "data": {...}}`.
//!
//! ## Inbound (caller → bridge):
//! - `start_call {stream_id}`: call is live, greet immediately
//! - `stream_request` / `turn_request {stream_id, transcript | content | delta}`:
//!   the user finished speaking, produce a reply
//! - `partial_transcript`, `playback_finished`, `interrupt`: informational
//! - anything else: ignored
//!
//! ## Outbound (bridge → caller):
//! - `stream_response {stream_id, content, flush, end_of_stream}`
//!
//! Decoding happens in two steps: the envelope first (`type` + raw `data`),
//! then the payload for the kinds we act on. Unknown kinds never fail.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const START_CALL: &str = "start_call";
pub const STREAM_REQUEST: &str = "stream_request";
pub const TURN_REQUEST: &str = "turn_request";
pub const STREAM_RESPONSE: &str = "stream_response";

/// A decoded inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    StartCall { stream_id: i64 },
    TurnRequest(TurnRequest),
    /// Known informational kinds; observed and logged only
    Observed(ObservedKind),
    /// Any kind this bridge does not know about
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedKind {
    PartialTranscript,
    PlaybackFinished,
    Interrupt,
}

impl ObservedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservedKind::PartialTranscript => "partial_transcript",
            ObservedKind::PlaybackFinished => "playback_finished",
            ObservedKind::Interrupt => "interrupt",
        }
    }
}

/// Payload of a `stream_request`.
///
/// The caller platform has populated different fields over time, so all
/// three content fields are optional; [`PromptAssembler`](crate::prompt::PromptAssembler)
/// decides which one wins.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TurnRequest {
    pub stream_id: i64,
    #[serde(default)]
    pub transcript: Option<Transcript>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub delta: Option<String>,
}

/// Conversation so far, as sent by the caller.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Transcript {
    Turns(Vec<TranscriptTurn>),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TranscriptTurn {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

impl TranscriptTurn {
    /// Only an explicit `assistant` (or the platform's `agent`) counts as the assistant.
    pub fn is_assistant(&self) -> bool {
        self.role
            .as_deref()
            .map(|role| {
                let role = role.trim();
                role.eq_ignore_ascii_case("assistant") || role.eq_ignore_ascii_case("agent")
            })
            .unwrap_or(false)
    }
}

/// One outbound fragment of a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamResponse {
    pub stream_id: i64,
    pub content: String,
    /// Tells the caller's synthesizer to speak now instead of buffering
    pub flush: bool,
    pub end_of_stream: bool,
}

impl StreamResponse {
    pub fn partial(stream_id: i64, content: impl Into<String>) -> Self {
        Self {
            stream_id,
            content: content.into(),
            flush: true,
            end_of_stream: false,
        }
    }

    pub fn terminal(stream_id: i64, content: impl Into<String>) -> Self {
        Self {
            stream_id,
            content: content.into(),
            flush: true,
            end_of_stream: true,
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a StreamResponse,
}

#[derive(Deserialize)]
struct InboundResponse {
    #[serde(rename = "type")]
    kind: String,
    data: StreamResponse,
}

/// Decode one inbound text frame.
pub fn decode(raw: &str) -> Result<InboundEvent, DecodeError> {
    let envelope: Envelope = serde_json::from_str(raw)?;

    match envelope.kind.as_str() {
        START_CALL => {
            let stream_id = stream_id_of(&envelope.kind, &envelope.data)?;
            Ok(InboundEvent::StartCall { stream_id })
        }
        STREAM_REQUEST | TURN_REQUEST => {
            // Check the id first so a missing one is reported as such
            stream_id_of(&envelope.kind, &envelope.data)?;
            let request = serde_json::from_value::<TurnRequest>(envelope.data).map_err(|err| {
                DecodeError::InvalidField {
                    kind: envelope.kind.clone(),
                    field: "data",
                    reason: err.to_string(),
                }
            })?;
            Ok(InboundEvent::TurnRequest(request))
        }
        "partial_transcript" => Ok(InboundEvent::Observed(ObservedKind::PartialTranscript)),
        "playback_finished" => Ok(InboundEvent::Observed(ObservedKind::PlaybackFinished)),
        "interrupt" => Ok(InboundEvent::Observed(ObservedKind::Interrupt)),
        _ => Ok(InboundEvent::Unknown(envelope.kind)),
    }
}

fn stream_id_of(kind: &str, data: &Value) -> Result<i64, DecodeError> {
    let value = data.get("stream_id").ok_or_else(|| DecodeError::MissingField {
        kind: kind.to_string(),
        field: "stream_id",
    })?;

    value.as_i64().ok_or_else(|| DecodeError::InvalidField {
        kind: kind.to_string(),
        field: "stream_id",
        reason: format!("expected an integer, got {}", value),
    })
}

/// Encode one outbound fragment as a text frame.
pub fn encode(response: &StreamResponse) -> String {
    let envelope = OutboundEnvelope {
        kind: STREAM_RESPONSE,
        data: response,
    };
    // A struct of strings, integers and booleans always serializes
    serde_json::to_string(&envelope).unwrap_or_default()
}

/// Decode an outbound frame, as a caller would.
pub fn decode_response(raw: &str) -> Result<StreamResponse, DecodeError> {
    let frame: InboundResponse = serde_json::from_str(raw)?;
    if frame.kind != STREAM_RESPONSE {
        return Err(DecodeError::InvalidField {
            kind: frame.kind,
            field: "type",
            reason: format!("expected '{}'", STREAM_RESPONSE),
        });
    }
    Ok(frame.data)
}
