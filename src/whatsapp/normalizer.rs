//! Message Normalizer
//!
//! Turns a raw `messages.upsert` entry into one canonical [`InboundMessage`],
//! or drops it. Pure: no I/O, no session access.

use super::address::{canonical_id, is_anonymized, is_broadcast, is_group};
use serde::Deserialize;
use serde_json::Value;

/// Name used when the sender has no push name.
pub const DEFAULT_DISPLAY_NAME: &str = "Friend";

pub const VOICE_PLACEHOLDER: &str = "[Voice message]";
pub const IMAGE_PLACEHOLDER: &str = "[Image]";
pub const VIDEO_PLACEHOLDER: &str = "[Video]";
pub const DOCUMENT_PLACEHOLDER: &str = "[Document]";
pub const STICKER_PLACEHOLDER: &str = "[Sticker]";
pub const UNSUPPORTED_PLACEHOLDER: &str = "[Unsupported message]";

/// Canonical inbound message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Canonical sender id, no transport suffix.
    pub sender_id: String,
    pub display_name: String,
    /// Never empty.
    pub text: String,
    /// Always `false` today; groups are dropped before this is built.
    pub is_group: bool,
    /// Original chat JID; replies are addressed here.
    pub raw_ref: String,
}

/// Why an event did not produce a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NoPayload,
    FromSelf,
    Broadcast,
    Group,
    /// `remoteJid` missing or unusable.
    NoSender,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawKey {
    remote_jid: Option<String>,
    from_me: bool,
    participant: Option<String>,
    sender_pn: Option<String>,
    remote_jid_alt: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawEnvelope {
    key: RawKey,
    push_name: Option<String>,
    message: Option<Value>,
}

/// Normalize one raw event, returning why it was dropped otherwise.
pub fn normalize(raw: &Value) -> Result<InboundMessage, DropReason> {
    let envelope: RawEnvelope =
        serde_json::from_value(raw.clone()).map_err(|_| DropReason::NoPayload)?;

    let content = match envelope.message.as_ref().map(unwrap_wrappers) {
        Some(content) if has_payload(content) => content,
        _ => return Err(DropReason::NoPayload),
    };

    if envelope.key.from_me {
        return Err(DropReason::FromSelf);
    }

    let remote_jid = envelope
        .key
        .remote_jid
        .as_deref()
        .map(str::trim)
        .filter(|j| !j.is_empty())
        .ok_or(DropReason::NoSender)?;

    if is_broadcast(remote_jid) {
        return Err(DropReason::Broadcast);
    }
    if is_group(remote_jid) {
        return Err(DropReason::Group);
    }

    let sender_id = sender_id(remote_jid, &envelope.key);
    if sender_id.is_empty() {
        return Err(DropReason::NoSender);
    }

    let display_name = envelope
        .push_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(DEFAULT_DISPLAY_NAME)
        .to_string();

    Ok(InboundMessage {
        sender_id,
        display_name,
        text: extract_text(content),
        is_group: false,
        raw_ref: remote_jid.to_string(),
    })
}

/// Best-effort phone recovery for anonymized (`@lid`) chats.
fn sender_id(remote_jid: &str, key: &RawKey) -> String {
    if !is_anonymized(remote_jid) {
        return canonical_id(remote_jid);
    }

    [&key.sender_pn, &key.participant, &key.remote_jid_alt]
        .into_iter()
        .filter_map(|f| f.as_deref())
        .map(str::trim)
        .find(|jid| !jid.is_empty() && !is_anonymized(jid))
        .map(canonical_id)
        .unwrap_or_else(|| canonical_id(remote_jid))
}

/// Peel `ephemeralMessage` / `viewOnceMessage` wrappers.
fn unwrap_wrappers(message: &Value) -> &Value {
    let mut current = message;
    for _ in 0..4 {
        let inner = ["ephemeralMessage", "viewOnceMessage", "viewOnceMessageV2"]
            .iter()
            .find_map(|w| current.get(*w).and_then(|m| m.get("message")));
        match inner {
            Some(next) => current = next,
            None => break,
        }
    }
    current
}

fn has_payload(content: &Value) -> bool {
    let Some(fields) = content.as_object() else {
        return false;
    };
    fields.iter().any(|(name, value)| {
        !value.is_null()
            && !matches!(
                name.as_str(),
                "protocolMessage" | "reactionMessage" | "messageContextInfo" | "senderKeyDistributionMessage"
            )
    })
}

fn non_empty<'a>(content: &'a Value, pointer: &str) -> Option<&'a str> {
    content
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// direct text > extended text > media caption > placeholder.
fn extract_text(content: &Value) -> String {
    let text = non_empty(content, "/conversation")
        .or_else(|| non_empty(content, "/extendedTextMessage/text"))
        .or_else(|| non_empty(content, "/imageMessage/caption"))
        .or_else(|| non_empty(content, "/videoMessage/caption"))
        .or_else(|| non_empty(content, "/documentMessage/caption"));
    if let Some(text) = text {
        return text.to_string();
    }

    let placeholder = if content.get("audioMessage").is_some() {
        VOICE_PLACEHOLDER
    } else if content.get("imageMessage").is_some() {
        IMAGE_PLACEHOLDER
    } else if content.get("videoMessage").is_some() {
        VIDEO_PLACEHOLDER
    } else if content.get("documentMessage").is_some() {
        DOCUMENT_PLACEHOLDER
    } else if content.get("stickerMessage").is_some() {
        STICKER_PLACEHOLDER
    } else {
        UNSUPPORTED_PLACEHOLDER
    };
    placeholder.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn direct(message: Value) -> Value {
        json!({
            "key": {"remoteJid": "911234567890@s.whatsapp.net", "fromMe": false, "id": "ABC"},
            "pushName": "Asha",
            "message": message,
        })
    }

    #[test]
    fn test_plain_text() {
        let msg = normalize(&direct(json!({"conversation": "hi"}))).unwrap();
        assert_eq!(msg.sender_id, "911234567890");
        assert_eq!(msg.display_name, "Asha");
        assert_eq!(msg.text, "hi");
        assert_eq!(msg.raw_ref, "911234567890@s.whatsapp.net");
        assert!(!msg.is_group);
    }

    #[test]
    fn test_drop_rules() {
        let no_payload = json!({"key": {"remoteJid": "911234567890@s.whatsapp.net"}});
        assert_eq!(normalize(&no_payload), Err(DropReason::NoPayload));

        let reaction = direct(json!({"reactionMessage": {"text": "👍"}}));
        assert_eq!(normalize(&reaction), Err(DropReason::NoPayload));

        let own = json!({
            "key": {"remoteJid": "911234567890@s.whatsapp.net", "fromMe": true},
            "message": {"conversation": "echo"},
        });
        assert_eq!(normalize(&own), Err(DropReason::FromSelf));

        let status = json!({
            "key": {"remoteJid": "status@broadcast", "participant": "911234567890@s.whatsapp.net"},
            "message": {"conversation": "story"},
        });
        assert_eq!(normalize(&status), Err(DropReason::Broadcast));

        let channel_post = json!({
            "key": {"remoteJid": "120363144038483540@newsletter", "fromMe": false},
            "message": {"conversation": "weekly digest"},
        });
        assert_eq!(normalize(&channel_post), Err(DropReason::Broadcast));

        let group = json!({
            "key": {"remoteJid": "120363025246125888@g.us", "participant": "911234567890@s.whatsapp.net"},
            "message": {"conversation": "hello group"},
        });
        assert_eq!(normalize(&group), Err(DropReason::Group));
    }

    #[test]
    fn test_drop_order_payload_before_self() {
        let own_empty = json!({"key": {"remoteJid": "status@broadcast", "fromMe": true}});
        assert_eq!(normalize(&own_empty), Err(DropReason::NoPayload));
    }

    #[test]
    fn test_text_precedence() {
        let both = direct(json!({
            "conversation": "direct",
            "extendedTextMessage": {"text": "extended"},
        }));
        assert_eq!(normalize(&both).unwrap().text, "direct");

        let extended = direct(json!({"extendedTextMessage": {"text": "quoted reply"}}));
        assert_eq!(normalize(&extended).unwrap().text, "quoted reply");

        let caption = direct(json!({"imageMessage": {"caption": "my receipt", "mimetype": "image/jpeg"}}));
        assert_eq!(normalize(&caption).unwrap().text, "my receipt");

        let empty_conversation = direct(json!({
            "conversation": "",
            "videoMessage": {"caption": "clip"},
        }));
        assert_eq!(normalize(&empty_conversation).unwrap().text, "clip");
    }

    #[test]
    fn test_placeholders_are_never_empty() {
        let voice = direct(json!({"audioMessage": {"seconds": 4, "ptt": true}}));
        assert_eq!(normalize(&voice).unwrap().text, VOICE_PLACEHOLDER);

        let photo = direct(json!({"imageMessage": {"mimetype": "image/jpeg"}}));
        assert_eq!(normalize(&photo).unwrap().text, IMAGE_PLACEHOLDER);

        let sticker = direct(json!({"stickerMessage": {}}));
        assert_eq!(normalize(&sticker).unwrap().text, STICKER_PLACEHOLDER);

        let location = direct(json!({"locationMessage": {"degreesLatitude": 12.9}}));
        assert_eq!(normalize(&location).unwrap().text, UNSUPPORTED_PLACEHOLDER);
    }

    #[test]
    fn test_ephemeral_wrapper_unwrapped() {
        let wrapped = direct(json!({
            "ephemeralMessage": {"message": {"extendedTextMessage": {"text": "disappearing"}}}
        }));
        assert_eq!(normalize(&wrapped).unwrap().text, "disappearing");
    }

    #[test]
    fn test_missing_push_name_defaults() {
        let raw = json!({
            "key": {"remoteJid": "911234567890@s.whatsapp.net", "fromMe": false},
            "message": {"conversation": "hi"},
        });
        assert_eq!(normalize(&raw).unwrap().display_name, DEFAULT_DISPLAY_NAME);
    }

    #[test]
    fn test_anonymized_sender_prefers_phone_field() {
        let raw = json!({
            "key": {
                "remoteJid": "178263519263@lid",
                "fromMe": false,
                "senderPn": "919876543210@s.whatsapp.net",
            },
            "message": {"conversation": "hello"},
        });
        let msg = normalize(&raw).unwrap();
        assert_eq!(msg.sender_id, "919876543210");
        // Reply still goes to the chat the message came from
        assert_eq!(msg.raw_ref, "178263519263@lid");
    }

    #[test]
    fn test_anonymized_sender_falls_back_to_lid() {
        let raw = json!({
            "key": {
                "remoteJid": "178263519263@lid",
                "fromMe": false,
                "participant": "55501@lid",
            },
            "message": {"conversation": "hello"},
        });
        assert_eq!(normalize(&raw).unwrap().sender_id, "178263519263");
    }
}
