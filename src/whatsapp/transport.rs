//! Transport abstraction
//!
//! A `Transport` owns the provider-specific connection (Evolution API today).
//! It pushes [`TransportEvent`]s into the session's event channel and accepts
//! connect/send calls; everything above it is provider-agnostic.

use super::address::Jid;
use super::credentials::Credentials;
use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Connection state of the process-wide session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    LoggedOut,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::LoggedOut => "loggedOut",
        }
    }
}

/// Connection transitions reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionUpdate {
    Connecting,
    Open,
    /// Recoverable drop (network churn, server restart, ...).
    Closed { reason: Option<String> },
    /// The device was unlinked; stored credentials are useless now.
    LoggedOut,
}

/// Something the user scans to link this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingArtifact {
    /// Raw QR payload, renderable as a terminal QR.
    pub code: Option<String>,
    /// `data:image/png;base64,...` image as served by the provider.
    pub image: Option<String>,
}

impl PairingArtifact {
    pub fn is_empty(&self) -> bool {
        self.code.as_deref().is_none_or(str::is_empty)
            && self.image.as_deref().is_none_or(str::is_empty)
    }
}

/// Kinds of media the provider can deliver from a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            "audio" => Some(MediaKind::Audio),
            "document" => Some(MediaKind::Document),
            _ => None,
        }
    }
}

/// An outbound media message. The provider fetches `url` itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMedia {
    pub kind: MediaKind,
    pub url: String,
    pub caption: Option<String>,
    /// Shown to the recipient for documents.
    pub file_name: Option<String>,
}

/// Raw inbound message event, as the provider shaped it.
pub type RawMessage = serde_json::Value;

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connection(ConnectionUpdate),
    PairingCode(PairingArtifact),
    CredentialsUpdated(Credentials),
    Message(RawMessage),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Result of a `connect()` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Session is live.
    Open,
    /// Handshake in progress; an `Open` connection event will follow.
    Connecting,
    /// First run or wiped credentials: the artifact must be scanned.
    PairingRequired(PairingArtifact),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish or resume the session.
    async fn connect(
        &self,
        credentials: Option<Credentials>,
    ) -> Result<ConnectOutcome, TransportError>;

    /// Resolves once the provider acknowledged the message.
    async fn send(&self, to: &Jid, text: &str) -> Result<(), TransportError>;

    async fn send_media(&self, to: &Jid, media: &OutboundMedia) -> Result<(), TransportError>;

    /// Best-effort unlink used when credentials are wiped.
    async fn logout(&self) -> Result<(), TransportError>;
}

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
