//! Error types shared across the relay.
//!
//! Each layer owns a `thiserror` enum; `anyhow` is only used at the binary edge.

use thiserror::Error;

/// Failures reported by a [`Transport`](crate::whatsapp::Transport) or the session wrapping it.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The session is not `open`; nothing was written to the transport.
    #[error("WhatsApp session is not connected")]
    NotConnected,

    /// The transport did not answer within the configured bound.
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: &'static str, seconds: u64 },

    /// The transport answered but refused the request.
    #[error("transport rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("transport HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid transport response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

/// Credential store failures.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential blob is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// A single processor endpoint failed; the fallback chain advances.
#[derive(Debug, Error)]
pub enum ProcessorFailure {
    #[error("processor timed out")]
    Timeout,

    #[error("processor request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("processor returned HTTP {0}")]
    Status(u16),

    #[error("processor response was malformed: {0}")]
    Malformed(String),

    #[error("processor returned an empty reply")]
    EmptyReply,
}

impl From<reqwest::Error> for ProcessorFailure {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProcessorFailure::Timeout
        } else if e.is_decode() {
            ProcessorFailure::Malformed(e.to_string())
        } else {
            ProcessorFailure::Http(e)
        }
    }
}

/// Recipient canonicalization failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("recipient is empty")]
    Empty,

    #[error("'{0}' is not a phone number or WhatsApp address")]
    InvalidRecipient(String),

    #[error("'{0}' is a group or broadcast address")]
    NotDirect(String),
}

/// Configuration loading/validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

