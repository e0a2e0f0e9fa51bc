//! Evolution API Transport
//!
//! Drives a WhatsApp-Web session hosted by an Evolution API server. Outbound
//! calls go over its REST API; inbound events arrive as webhooks on the
//! relay's own HTTP listener and are translated by [`parse_webhook`].

use super::address::Jid;
use super::credentials::Credentials;
use super::transport::{
    ConnectOutcome, ConnectionUpdate, EventSender, OutboundMedia, PairingArtifact, Transport,
    TransportEvent,
};
use crate::error::TransportError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::RwLock;

/// Evolution status code for an unlinked device.
const LOGGED_OUT_STATUS: u64 = 401;

const WEBHOOK_EVENTS: &[&str] = &[
    "QRCODE_UPDATED",
    "CONNECTION_UPDATE",
    "MESSAGES_UPSERT",
    "LOGOUT_INSTANCE",
];

#[derive(Debug, Clone)]
pub struct EvolutionOptions {
    pub api_url: String,
    /// Global key; used for instance management and as fallback auth.
    pub api_key: String,
    pub instance_name: String,
    /// Where Evolution should post webhooks (this relay's `/webhook/whatsapp`).
    pub webhook_url: Option<String>,
    /// Upper bound on any single HTTP exchange with the server.
    pub request_timeout: Duration,
}

/// What the credential blob holds for this provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceCredentials {
    instance_name: String,
    token: String,
}

pub struct EvolutionTransport {
    client: reqwest::Client,
    options: EvolutionOptions,
    instance_token: RwLock<Option<String>>,
    events: EventSender,
}

impl EvolutionTransport {
    pub fn new(mut options: EvolutionOptions, events: EventSender) -> Result<Self, TransportError> {
        options.api_url = options.api_url.trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()?;
        Ok(Self {
            client,
            options,
            instance_token: RwLock::new(None),
            events,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.options.api_url, path)
    }

    async fn auth_key(&self) -> String {
        match self.instance_token.read().await.as_ref() {
            Some(token) if !token.is_empty() => token.clone(),
            _ => self.options.api_key.clone(),
        }
    }

    /// `Ok(None)` when the instance does not exist.
    async fn connection_state(&self) -> Result<Option<String>, TransportError> {
        let url = self.url(&format!("/instance/connectionState/{}", self.options.instance_name));
        let resp = self
            .client
            .get(&url)
            .header("apikey", self.auth_key().await)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body: truncate(&text, 300),
            });
        }

        let body: Value = serde_json::from_str(&text)
            .map_err(|e| TransportError::InvalidResponse(format!("connectionState: {}", e)))?;
        let state = body["instance"]["state"]
            .as_str()
            .or_else(|| body["state"].as_str())
            .unwrap_or("")
            .to_string();
        Ok(Some(state))
    }

    /// Ask an existing instance to (re)connect; returns a QR when unpaired.
    async fn request_connect(&self) -> Result<ConnectOutcome, TransportError> {
        let url = self.url(&format!("/instance/connect/{}", self.options.instance_name));
        let resp = self
            .client
            .get(&url)
            .header("apikey", self.auth_key().await)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body: truncate(&text, 300),
            });
        }
        let body: Value = serde_json::from_str(&text).unwrap_or_default();

        if is_open_state(&body) {
            return Ok(ConnectOutcome::Open);
        }
        let artifact = extract_pairing(&body);
        if artifact.is_empty() {
            Ok(ConnectOutcome::Connecting)
        } else {
            Ok(ConnectOutcome::PairingRequired(artifact))
        }
    }

    fn create_body(&self, token: &str) -> Value {
        let mut body = json!({
            "instanceName": self.options.instance_name,
            "token": token,
            "qrcode": true,
            "integration": "WHATSAPP-BAILEYS",
        });
        if let Some(url) = &self.options.webhook_url {
            body["webhook"] = json!({
                "url": url,
                "byEvents": false,
                "base64": true,
                "events": WEBHOOK_EVENTS,
            });
        }
        body
    }

    async fn post_create(&self, token: &str) -> Result<(StatusCode, String), TransportError> {
        let resp = self
            .client
            .post(self.url("/instance/create"))
            .header("apikey", &self.options.api_key)
            .json(&self.create_body(token))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        tracing::debug!(
            "WhatsApp: instance create [{}]: {}",
            status,
            truncate(&text, 300)
        );
        Ok((status, text))
    }

    /// First-run path: create a fresh instance and hand back its QR.
    async fn create_instance(&self) -> Result<ConnectOutcome, TransportError> {
        let mut token = new_instance_token();
        let (mut status, mut text) = self.post_create(&token).await?;

        if !status.is_success() && is_conflict(status, &text) {
            tracing::info!(
                "WhatsApp: instance '{}' already exists, recreating",
                self.options.instance_name
            );
            self.delete_instance().await;
            token = new_instance_token();
            (status, text) = self.post_create(&token).await?;
        }

        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body: truncate(&text, 300),
            });
        }

        let body: Value = serde_json::from_str(&text)
            .map_err(|e| TransportError::InvalidResponse(format!("instance/create: {}", e)))?;

        // v2 returns the issued token under "hash"; older builds echo ours back
        let issued = body["hash"]["apikey"]
            .as_str()
            .or_else(|| body["hash"].as_str())
            .map(str::to_string)
            .unwrap_or(token);
        *self.instance_token.write().await = Some(issued.clone());

        let blob = InstanceCredentials {
            instance_name: self.options.instance_name.clone(),
            token: issued,
        };
        let blob = serde_json::to_value(&blob)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        if self
            .events
            .send(TransportEvent::CredentialsUpdated(Credentials(blob)))
            .is_err()
        {
            tracing::warn!("WhatsApp: session event loop gone, credentials not persisted");
        }

        let artifact = extract_pairing(&body);
        if artifact.is_empty() {
            Ok(ConnectOutcome::Connecting)
        } else {
            Ok(ConnectOutcome::PairingRequired(artifact))
        }
    }

    async fn delete_instance(&self) {
        let url = self.url(&format!("/instance/delete/{}", self.options.instance_name));
        match self
            .client
            .delete(&url)
            .header("apikey", &self.options.api_key)
            .send()
            .await
        {
            Ok(resp) => tracing::debug!("WhatsApp: instance delete [{}]", resp.status()),
            Err(e) => tracing::warn!("WhatsApp: instance delete failed: {}", e),
        }
    }
}

#[async_trait]
impl Transport for EvolutionTransport {
    async fn connect(
        &self,
        credentials: Option<Credentials>,
    ) -> Result<ConnectOutcome, TransportError> {
        let stored = credentials
            .and_then(|c| serde_json::from_value::<InstanceCredentials>(c.0).ok())
            .filter(|c| c.instance_name == self.options.instance_name);

        let Some(stored) = stored else {
            *self.instance_token.write().await = None;
            return self.create_instance().await;
        };

        *self.instance_token.write().await = Some(stored.token);
        match self.connection_state().await? {
            Some(state) if state == "open" => Ok(ConnectOutcome::Open),
            Some(state) => {
                tracing::debug!("WhatsApp: instance state '{}', requesting connect", state);
                self.request_connect().await
            }
            None => {
                tracing::warn!(
                    "WhatsApp: instance '{}' vanished, stored credentials are stale",
                    self.options.instance_name
                );
                *self.instance_token.write().await = None;
                self.create_instance().await
            }
        }
    }

    async fn send(&self, to: &Jid, text: &str) -> Result<(), TransportError> {
        let url = self.url(&format!("/message/sendText/{}", self.options.instance_name));
        let resp = self
            .client
            .post(&url)
            .header("apikey", self.auth_key().await)
            .json(&json!({
                "number": to.as_str(),
                "text": text,
            }))
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            tracing::debug!("WhatsApp: sendText to {} acknowledged", to);
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(TransportError::Rejected {
            status: status.as_u16(),
            body: truncate(&body, 300),
        })
    }

    async fn send_media(&self, to: &Jid, media: &OutboundMedia) -> Result<(), TransportError> {
        let url = self.url(&format!("/message/sendMedia/{}", self.options.instance_name));
        let mut body = json!({
            "number": to.as_str(),
            "mediatype": media.kind.as_str(),
            "media": media.url,
        });
        if let Some(caption) = &media.caption {
            body["caption"] = json!(caption);
        }
        if let Some(file_name) = &media.file_name {
            body["fileName"] = json!(file_name);
        }

        let resp = self
            .client
            .post(&url)
            .header("apikey", self.auth_key().await)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            tracing::debug!("WhatsApp: sendMedia ({}) to {} acknowledged", media.kind.as_str(), to);
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(TransportError::Rejected {
            status: status.as_u16(),
            body: truncate(&body, 300),
        })
    }

    async fn logout(&self) -> Result<(), TransportError> {
        let url = self.url(&format!("/instance/logout/{}", self.options.instance_name));
        let resp = self
            .client
            .delete(&url)
            .header("apikey", self.auth_key().await)
            .send()
            .await?;
        *self.instance_token.write().await = None;

        let status = resp.status();
        // Already logged out / gone is fine
        if status.is_success() || status == StatusCode::NOT_FOUND || status == StatusCode::BAD_REQUEST {
            return Ok(());
        }
        Err(TransportError::Rejected {
            status: status.as_u16(),
            body: truncate(&resp.text().await.unwrap_or_default(), 300),
        })
    }
}

/// The per-instance token held in a stored credential blob.
///
/// Evolution echoes it as the `apikey` field of every webhook it posts.
pub fn instance_token(credentials: &Credentials) -> Option<&str> {
    credentials.0["token"].as_str().filter(|t| !t.is_empty())
}

/// Translate one Evolution webhook payload into transport events.
///
/// Payloads for another instance yield nothing. Unknown events are ignored.
pub fn parse_webhook(payload: &Value, instance_name: &str) -> Vec<TransportEvent> {
    if let Some(instance) = payload["instance"].as_str()
        && instance != instance_name
    {
        tracing::debug!("WhatsApp: ignoring webhook for instance '{}'", instance);
        return Vec::new();
    }

    let event = payload["event"]
        .as_str()
        .unwrap_or("")
        .to_ascii_lowercase()
        .replace('_', ".");
    let data = &payload["data"];

    match event.as_str() {
        "qrcode.updated" => {
            let artifact = extract_pairing(&data["qrcode"]);
            let artifact = if artifact.is_empty() {
                extract_pairing(data)
            } else {
                artifact
            };
            if artifact.is_empty() {
                Vec::new()
            } else {
                vec![TransportEvent::PairingCode(artifact)]
            }
        }
        "connection.update" => connection_update(data)
            .map(TransportEvent::Connection)
            .into_iter()
            .collect(),
        "logout.instance" => vec![TransportEvent::Connection(ConnectionUpdate::LoggedOut)],
        "messages.upsert" => match data {
            Value::Array(items) => items.iter().cloned().map(TransportEvent::Message).collect(),
            Value::Object(_) => vec![TransportEvent::Message(data.clone())],
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn connection_update(data: &Value) -> Option<ConnectionUpdate> {
    let state = data["state"].as_str().unwrap_or("");
    let reason = data["statusReason"]
        .as_u64()
        .or_else(|| data["statusReason"].as_str().and_then(|s| s.parse().ok()));

    match state {
        "open" | "connected" => Some(ConnectionUpdate::Open),
        "connecting" => Some(ConnectionUpdate::Connecting),
        "close" | "closed" => {
            if reason == Some(LOGGED_OUT_STATUS) {
                Some(ConnectionUpdate::LoggedOut)
            } else {
                Some(ConnectionUpdate::Closed {
                    reason: reason.map(|r| format!("statusReason {}", r)),
                })
            }
        }
        _ => None,
    }
}

fn is_open_state(body: &Value) -> bool {
    matches!(
        body["instance"]["state"].as_str().or_else(|| body["state"].as_str()),
        Some("open") | Some("connected")
    )
}

/// QR formats seen across Evolution versions:
/// `{qrcode: {code, base64}}`, `{code, base64}`, `{qrcode: "data:image/..."}`.
fn extract_pairing(body: &Value) -> PairingArtifact {
    let nested = &body["qrcode"];
    let image = nested["base64"]
        .as_str()
        .or_else(|| body["base64"].as_str())
        .or_else(|| nested.as_str().filter(|s| s.starts_with("data:")))
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let code = nested["code"]
        .as_str()
        .or_else(|| body["code"].as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    PairingArtifact { code, image }
}

fn is_conflict(status: StatusCode, body: &str) -> bool {
    let lower = body.to_lowercase();
    status == StatusCode::CONFLICT
        || (lower.contains("already") && (lower.contains("instance") || lower.contains("token") || lower.contains("name")))
}

fn new_instance_token() -> String {
    format!("viya-{}", &uuid::Uuid::new_v4().simple().to_string()[..16])
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
