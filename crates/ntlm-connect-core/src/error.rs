//! Error taxonomy for tunnel establishment.

use crate::proxy::ntlm::HandshakeState;
use http::StatusCode;
use std::fmt;
use thiserror::Error;

/// Error type returned by security providers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum TunnelError {
    /// Dial, write or read failure on the proxy connection.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unable to acquire NTLM credentials: {0}")]
    Credentials(#[source] BoxError),

    #[error("unable to create NTLM client context: {0}")]
    Context(#[source] BoxError),

    #[error("unable to compute NTLM authenticate token: {0}")]
    Token(#[source] BoxError),

    /// The negotiate leg was answered with something other than 407.
    #[error("Unexpected HTTP status code")]
    UnexpectedStatus(StatusCode),

    #[error("did not receive a challenge from the server")]
    MissingChallenge,

    #[error("received malformed challenge from the server")]
    MalformedChallenge,

    #[error("could not decode NTLM challenge: {0}")]
    ChallengeDecode(#[from] base64::DecodeError),

    #[error("request body cannot be replayed for the authenticate message")]
    BodyNotReplayable,

    #[error("malformed HTTP response: {0}")]
    MalformedResponse(String),

    #[error("HTTP response exceeds {0} bytes")]
    ResponseTooLarge(usize),

    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    /// The authenticate leg was answered with something other than 200.
    /// Displays as the status's standard reason phrase.
    #[error("{}", .0.canonical_reason().unwrap_or(""))]
    Rejected(StatusCode),
}

impl TunnelError {
    /// HTTP status that caused the failure, if the proxy answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            TunnelError::UnexpectedStatus(code) | TunnelError::Rejected(code) => Some(*code),
            _ => None,
        }
    }

    /// True when the proxy broke the handshake contract.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TunnelError::UnexpectedStatus(_)
                | TunnelError::MissingChallenge
                | TunnelError::MalformedChallenge
                | TunnelError::ChallengeDecode(_)
                | TunnelError::MalformedResponse(_)
                | TunnelError::ResponseTooLarge(_)
        )
    }
}

// ---------------------------------------------------------------------------
// HandshakeFailure
// ---------------------------------------------------------------------------

/// A failed handshake.
///
/// The connection is handed back so the caller decides whether to close it.
/// Its NTLM state is indeterminate: never start another handshake on it.
pub struct HandshakeFailure<S> {
    stream: Option<S>,
    state: HandshakeState,
    error: TunnelError,
}

impl<S> HandshakeFailure<S> {
    pub(crate) fn new(stream: Option<S>, state: HandshakeState, error: TunnelError) -> Self {
        HandshakeFailure { stream, state, error }
    }

    pub fn error(&self) -> &TunnelError {
        &self.error
    }

    /// Last state reached before the failure.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The connection, or `None` when dialing itself failed.
    pub fn stream(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    pub fn into_stream(self) -> Option<S> {
        self.stream
    }

    pub fn into_parts(self) -> (Option<S>, TunnelError) {
        (self.stream, self.error)
    }
}

impl<S> fmt::Debug for HandshakeFailure<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeFailure")
            .field("state", &self.state)
            .field("error", &self.error)
            .field("has_stream", &self.stream.is_some())
            .finish()
    }
}

impl<S> fmt::Display for HandshakeFailure<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NTLM handshake failed after {}", self.state)
    }
}

impl<S> std::error::Error for HandshakeFailure<S> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
