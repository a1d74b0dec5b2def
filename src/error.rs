//! # Error Handling
//!
//! Error types for the two places where a call can go wrong locally:
//! decoding a frame from the caller, and talking to the model provider.
//!
//! ## Scope of each error:
//! - **DecodeError**: one inbound frame. The frame is logged and dropped,
//!   the connection keeps reading.
//! - **RelayError**: one turn. It never reaches the caller as-is; the relay
//!   turns it into a single terminal fragment so the line is never silent.
//!
//! Nothing in here is fatal to the process. Startup failures (bad config,
//! port already bound) go through `anyhow` in `main` instead.

use std::fmt;

/// Failure to turn a raw text frame into an [`InboundEvent`](crate::protocol::InboundEvent).
#[derive(Debug)]
pub enum DecodeError {
    /// The frame is not valid JSON, or not a JSON object with a string `type`
    InvalidJson(String),

    /// A field required by this event kind is absent
    MissingField {
        kind: String,
        field: &'static str,
    },

    /// A field is present but has the wrong shape (e.g. a non-integer `stream_id`)
    InvalidField {
        kind: String,
        field: &'static str,
        reason: String,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidJson(msg) => write!(f, "Invalid JSON frame: {}", msg),
            DecodeError::MissingField { kind, field } => {
                write!(f, "Event '{}' is missing required field '{}'", kind, field)
            }
            DecodeError::InvalidField { kind, field, reason } => {
                write!(f, "Event '{}' has invalid field '{}': {}", kind, field, reason)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        DecodeError::InvalidJson(err.to_string())
    }
}

/// Failure of one upstream completion attempt.
///
/// ## Variants:
/// - **Status**: the provider answered with a non-success HTTP status
///   (bad key, no credit, quota). The caller hears the status code.
/// - **Transport**: connect/read failure, timeout.
/// - **Decode**: the provider answered 2xx but the body was not what we expect.
/// - **Provider**: the provider reported an error inside an otherwise valid stream.
#[derive(Debug)]
pub enum RelayError {
    Status { status: u16, body: String },
    Transport(String),
    Decode(String),
    Provider(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Status { status, body } => {
                write!(f, "Provider returned status {}: {}", status, body)
            }
            RelayError::Transport(msg) => write!(f, "Provider transport error: {}", msg),
            RelayError::Decode(msg) => write!(f, "Provider response decode error: {}", msg),
            RelayError::Provider(msg) => write!(f, "Provider stream error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RelayError::Decode(err.to_string())
        } else {
            RelayError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Decode(err.to_string())
    }
}
