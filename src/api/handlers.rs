use super::{API_KEY_HEADER, ApiError, ApiState};
use crate::whatsapp::{
    ConnectionState, MediaKind, OutboundMedia, SessionCommand, instance_token, parse_webhook,
    resolve_recipient,
};
use axum::Json;
use axum::extract::{Query, State};
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::{Value, json};

/// Header Evolution uses for its own keys; accepted on webhooks too.
const PROVIDER_KEY_HEADER: &str = "apikey";

fn status_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Open => "ok",
        ConnectionState::LoggedOut => "logged_out",
        ConnectionState::Connecting | ConnectionState::Disconnected => "degraded",
    }
}

fn authorize(state: &ApiState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.api_key.as_deref().filter(|k| !k.is_empty()) else {
        return Ok(());
    };
    match headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        Some(given) if given == expected => Ok(()),
        _ => Err(ApiError::new(StatusCode::UNAUTHORIZED, "missing or invalid API key")),
    }
}

pub(super) async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let session_state = state.session.state();
    let endpoints: Vec<Value> = state
        .endpoints
        .iter()
        .map(|e| {
            json!({
                "name": e.name,
                "url": e.url,
                "priority": e.priority,
                "timeoutMs": e.timeout_ms,
            })
        })
        .collect();

    Json(json!({
        "status": status_label(session_state),
        "connected": session_state == ConnectionState::Open,
        "state": session_state.as_str(),
        "pairing": state.session.pairing().await.is_some(),
        "endpoints": endpoints,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(super) struct SendRequest {
    recipient_id: Option<String>,
    text: Option<String>,
    media_url: Option<String>,
    media_type: Option<String>,
    caption: Option<String>,
    file_name: Option<String>,
}

impl SendRequest {
    /// The media part of the request, if a `mediaUrl` was given.
    /// `text` doubles as the caption when no `caption` is set.
    fn media(&self) -> Result<Option<OutboundMedia>, ApiError> {
        let Some(url) = non_blank(&self.media_url) else {
            return Ok(None);
        };
        let kind = match non_blank(&self.media_type) {
            None => MediaKind::Image,
            Some(raw) => MediaKind::parse(raw).ok_or_else(|| {
                ApiError::bad_request(format!(
                    "mediaType '{}' is not one of image, video, audio, document",
                    raw
                ))
            })?,
        };
        Ok(Some(OutboundMedia {
            kind,
            url: url.to_string(),
            caption: non_blank(&self.caption)
                .or_else(|| non_blank(&self.text))
                .map(str::to_string),
            file_name: non_blank(&self.file_name).map(str::to_string),
        }))
    }
}

enum Outbound<'a> {
    Text(&'a str),
    Media(OutboundMedia),
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

pub(super) async fn send(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let recipient = non_blank(&request.recipient_id)
        .ok_or_else(|| ApiError::bad_request("recipientId is required"))?;
    let outbound = match request.media()? {
        Some(media) => Outbound::Media(media),
        None => Outbound::Text(
            request
                .text
                .as_deref()
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| ApiError::bad_request("text or mediaUrl is required"))?,
        ),
    };

    let address = resolve_recipient(recipient, &state.default_country_code)?;
    if !state.session.is_open() {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            format!(
                "WhatsApp session is {}, retry later",
                state.session.state().as_str()
            ),
        ));
    }

    let sent = match &outbound {
        Outbound::Text(text) => state.session.send_chunked(&address, text).await.map(|_| ()),
        Outbound::Media(media) => state.session.send_media(&address, media).await,
    };
    sent.map_err(|e| {
        tracing::warn!("Control API: send to {} failed: {}", address, e);
        ApiError::from(e)
    })?;

    match &outbound {
        Outbound::Text(text) => {
            tracing::info!("Control API: sent {} chars to {}", text.len(), address)
        }
        Outbound::Media(media) => {
            tracing::info!("Control API: sent {} to {}", media.kind.as_str(), address)
        }
    }
    Ok(Json(json!({
        "success": true,
        "resolvedAddress": address.as_str(),
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct WebhookQuery {
    token: Option<String>,
}

/// A webhook is trusted only if it presents a known key, in the payload's
/// `apikey` field, an `apikey`/`x-api-key` header or a `?token=` query.
async fn webhook_authorized(
    state: &ApiState,
    headers: &HeaderMap,
    query: &WebhookQuery,
    payload: &Value,
) -> bool {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let presented: Vec<&str> = [
        payload["apikey"].as_str(),
        header(PROVIDER_KEY_HEADER),
        header(API_KEY_HEADER),
        query.token.as_deref(),
    ]
    .into_iter()
    .flatten()
    .filter(|key| !key.is_empty())
    .collect();
    if presented.is_empty() {
        return false;
    }
    if state
        .webhook_keys
        .iter()
        .any(|key| presented.contains(&key.as_str()))
    {
        return true;
    }

    match state.session.stored_credentials().await {
        Ok(Some(credentials)) => {
            instance_token(&credentials).is_some_and(|token| presented.contains(&token))
        }
        Ok(None) => false,
        Err(e) => {
            tracing::warn!("Control API: cannot read credentials to check webhook: {}", e);
            false
        }
    }
}

pub(super) async fn webhook(
    State(state): State<ApiState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<StatusCode, ApiError> {
    if !webhook_authorized(&state, &headers, &query, &payload).await {
        tracing::warn!("Control API: rejected unauthenticated webhook");
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "missing or invalid webhook key"));
    }

    let events = parse_webhook(&payload, &state.instance_name);
    for event in events {
        if state.events.send(event).is_err() {
            tracing::error!("Control API: session event loop is gone, dropping webhook");
            return Ok(StatusCode::SERVICE_UNAVAILABLE);
        }
    }
    Ok(StatusCode::OK)
}

pub(super) async fn pairing(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    Ok(match state.session.pairing().await {
        Some(pending) => Json(json!({
            "pairing": true,
            "qr": pending.artifact.code,
            "image": pending.artifact.image,
            "issuedAt": pending.issued_at.to_rfc3339(),
        })),
        None => Json(json!({"pairing": false, "qr": null})),
    })
}

pub(super) async fn reconnect(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    state
        .commands
        .send(SessionCommand::Restart)
        .map_err(|_| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "session agent is not running"))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "accepted": true,
            "state": state.session.state().as_str(),
        })),
    ))
}
