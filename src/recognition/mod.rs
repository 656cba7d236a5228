//! Streaming speech recognition against the iFlytek IAT WebSocket API
//!
//! One call to [`Recognizer::recognize`] runs one session: resolve
//! credentials, sign the endpoint, open a WebSocket, pace audio frames at
//! real-time cadence and assemble the transcript from inbound fragments.
//!
//! # Architecture
//!
//! ```text
//! PCM buffer ──▶ AudioFramer ──▶ Session (reducer) ──effects──▶ driver ──▶ Transport
//!                                      ▲                                     │
//!                                      └──────── inbound fragments ◀─────────┘
//!                                                     │
//!                                                     ▼
//!                                           TranscriptAssembler
//! ```
//!
//! # Failure Policy
//!
//! - Missing credentials fail before any connection is attempted
//! - A malformed inbound message is logged and skipped (bounded)
//! - Every other failure ends the session; no partial transcript is returned

mod auth;
mod batch;
mod driver;
mod framer;
mod protocol;
mod session;
mod transcript;
mod transport;

use std::time::Duration;

use crate::credentials::CredentialField;

pub use auth::{sign_endpoint, Clock, ConnectionAuthenticator, FixedClock, SignedEndpoint, SystemClock};
pub use batch::{RecognitionHandle, Recognizer};
pub use framer::{AudioFrame, AudioFramer, FramePosition, SEQUENCE_ORIGIN};
pub use protocol::{
    decode_inbound, FrameEncoder, Inbound, MalformedMessage, MalformedSite, RecognitionParams,
    ServerEnvelope,
};
pub use session::{Effect, Session, SessionEvent, SessionState, TransitionError};
pub use transcript::{apply, TranscriptAssembler, TranscriptFragment};
pub use transport::{Connector, Transport, TransportEvent, WsConnector, WsTransport, NORMAL_CLOSURE};

/// Errors that end a recognition session
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecognitionError {
    /// One or more credentials are not configured for the account
    #[error("Credentials not configured for account {account}: missing {}", field_list(.missing))]
    MissingCredentials {
        account: String,
        missing: Vec<CredentialField>,
    },

    /// The service rejected the signed connection
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The WebSocket could not be established
    #[error("Failed to connect to recognition service: {0}")]
    ConnectionFailed(String),

    /// Transport failure after the connection was open
    #[error("WebSocket error: {0}")]
    Transport(String),

    /// The service reported a nonzero status code
    #[error("Recognition service error {code}: {message}")]
    ProviderError {
        code: i64,
        message: String,
        sid: Option<String>,
    },

    /// The connection closed before a final fragment arrived
    #[error("Connection closed before recognition finished (code: {}, reason: {reason})", close_code(.code))]
    IncompleteRecognition { code: Option<u16>, reason: String },

    /// Nothing arrived within the silence window after the last audio frame
    #[error("No response from recognition service within {0:?}")]
    Timeout(Duration),

    /// Too many inbound messages could not be decoded
    #[error("Gave up after {limit} malformed messages")]
    TooManyMalformedMessages { limit: u32 },

    /// The recognizer settings cannot produce a valid session
    #[error("Invalid recognizer settings: {0}")]
    InvalidSettings(String),

    /// The caller cancelled the request
    #[error("Recognition cancelled")]
    Cancelled,

    /// An event arrived that the current session state cannot accept
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
}

impl RecognitionError {
    /// Whether a fresh connection attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RecognitionError::ConnectionFailed(_))
    }
}

fn field_list(fields: &[CredentialField]) -> String {
    fields
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn close_code(code: &Option<u16>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recognition_error_display() {
        let err = RecognitionError::MissingCredentials {
            account: "alice".to_string(),
            missing: vec![CredentialField::ApiKey, CredentialField::ApiSecret],
        };
        assert!(err.to_string().contains("xfyunApiKey, xfyunApiSecret"));

        let err = RecognitionError::ProviderError {
            code: 10165,
            message: "invalid handle".to_string(),
            sid: None,
        };
        assert!(err.to_string().contains("10165"));
        assert!(err.to_string().contains("invalid handle"));

        let err = RecognitionError::IncompleteRecognition {
            code: Some(1006),
            reason: String::new(),
        };
        assert!(err.to_string().contains("1006"));

        let err = RecognitionError::IncompleteRecognition {
            code: None,
            reason: "stream ended".to_string(),
        };
        assert!(err.to_string().contains("none"));
    }

    #[test]
    fn test_only_connection_failures_are_retryable() {
        assert!(RecognitionError::ConnectionFailed("reset".to_string()).is_retryable());
        assert!(!RecognitionError::AuthenticationFailed("401".to_string()).is_retryable());
        assert!(!RecognitionError::Cancelled.is_retryable());
    }
}
