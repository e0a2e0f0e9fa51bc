//! Transport Session
//!
//! The process-wide session handle. Owns the transport and the credential
//! store, publishes the connection state, and funnels every outbound message
//! (replies and Control API sends alike) through one serialized send path.

use super::address::Jid;
use super::credentials::{CredentialStore, Credentials};
use super::transport::{
    ConnectOutcome, ConnectionState, OutboundMedia, PairingArtifact, Transport,
};
use crate::error::{CredentialError, TransportError};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, RwLock, watch};

/// Tunables for [`Session`].
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    /// How long a connect may sit in `connecting` (waiting for a scan or the
    /// provider's open event) before it counts as a failed attempt.
    pub handshake_timeout: Duration,
    /// Longer texts are split before sending.
    pub max_message_chars: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(120),
            max_message_chars: 4000,
        }
    }
}

/// Latest pairing artifact with the time it was issued.
#[derive(Debug, Clone)]
pub struct PendingPairing {
    pub artifact: PairingArtifact,
    pub issued_at: DateTime<Utc>,
}

pub struct Session {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    state: watch::Sender<ConnectionState>,
    pairing: RwLock<Option<PendingPairing>>,
    /// Held for the whole duration of a transport write.
    send_lock: Mutex<()>,
    limits: SessionLimits,
}

impl Session {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        limits: SessionLimits,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            credentials,
            state,
            pairing: RwLock::new(None),
            send_lock: Mutex::new(()),
            limits,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Watch connection-state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(
                "WhatsApp: session state {} -> {}",
                previous.as_str(),
                state.as_str()
            );
        }
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    /// Establish or resume the session with whatever credentials are stored.
    pub async fn connect(&self) -> Result<ConnectOutcome, TransportError> {
        let stored = self.credentials.load().await?;
        if stored.is_none() {
            tracing::info!("WhatsApp: no stored credentials, pairing will be required");
        }
        bounded(
            "connect",
            self.limits.connect_timeout,
            self.transport.connect(stored),
        )
        .await
    }

    /// Send one message. Fails fast with `NotConnected` unless the session is open.
    pub async fn send(&self, to: &Jid, text: &str) -> Result<(), TransportError> {
        let _guard = self.lock_open().await?;
        self.write_text(to, text).await
    }

    /// Send `text`, split into chunks that fit `max_message_chars`, in order.
    ///
    /// The send lock is held across all chunks, so two replies to the same
    /// chat never interleave.
    pub async fn send_chunked(&self, to: &Jid, text: &str) -> Result<usize, TransportError> {
        let chunks = split_message(text, self.limits.max_message_chars);
        let _guard = self.lock_open().await?;
        for chunk in &chunks {
            if !self.is_open() {
                return Err(TransportError::NotConnected);
            }
            self.write_text(to, chunk).await?;
        }
        Ok(chunks.len())
    }

    /// Send one media message through the same serialized path as text.
    pub async fn send_media(&self, to: &Jid, media: &OutboundMedia) -> Result<(), TransportError> {
        let _guard = self.lock_open().await?;
        bounded(
            "send",
            self.limits.send_timeout,
            self.transport.send_media(to, media),
        )
        .await
    }

    /// Take the send lock, checking the state on both sides of the wait.
    async fn lock_open(&self) -> Result<MutexGuard<'_, ()>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let guard = self.send_lock.lock().await;
        // State may have flipped while we waited for the lock
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        Ok(guard)
    }

    async fn write_text(&self, to: &Jid, text: &str) -> Result<(), TransportError> {
        bounded("send", self.limits.send_timeout, self.transport.send(to, text)).await
    }

    /// Stored credentials, if any.
    pub async fn stored_credentials(&self) -> Result<Option<Credentials>, CredentialError> {
        self.credentials.load().await
    }

    pub(crate) async fn persist_credentials(
        &self,
        credentials: &Credentials,
    ) -> Result<(), TransportError> {
        self.credentials.save(credentials).await?;
        Ok(())
    }

    /// Wipe stored credentials and unlink the device (best effort).
    ///
    /// The logout is bounded by `connect_timeout`; the store is cleared
    /// whether or not the provider answered.
    pub(crate) async fn wipe_credentials(&self) {
        let logout = bounded("logout", self.limits.connect_timeout, self.transport.logout());
        if let Err(e) = logout.await {
            tracing::warn!("WhatsApp: logout during credential wipe failed: {}", e);
        }
        if let Err(e) = self.credentials.clear().await {
            tracing::error!("WhatsApp: failed to clear credentials: {}", e);
        }
        *self.pairing.write().await = None;
    }

    pub(crate) async fn set_pairing(&self, artifact: Option<PairingArtifact>) {
        *self.pairing.write().await = artifact.map(|artifact| PendingPairing {
            artifact,
            issued_at: Utc::now(),
        });
    }

    pub async fn pairing(&self) -> Option<PendingPairing> {
        self.pairing.read().await.clone()
    }
}

async fn bounded<T>(
    operation: &'static str,
    limit: Duration,
    call: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| TransportError::Timeout {
            operation,
            seconds: limit.as_secs(),
        })?
}

/// Split a message into chunks of at most `max_len` bytes, preferring newline breaks.
pub fn split_message(text: &str, max_len: usize) -> Vec<&str> {
    let max_len = max_len.max(1);
    if text.len() <= max_len {
        return vec![text];
    }
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // A single char wider than max_len; take it whole
            end = start + text[start..].chars().next().map_or(1, char::len_utf8);
        }
        let break_at = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .filter(|&pos| pos > (end - start).saturating_sub(200))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };
        chunks.push(&text[start..break_at]);
        start = break_at;
    }
    chunks
}
