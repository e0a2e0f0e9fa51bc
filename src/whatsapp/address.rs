//! WhatsApp Addressing
//!
//! Every ingress point (webhook events, Control API) canonicalizes identifiers
//! through this module so the relay only ever sees one form.

use crate::error::AddressError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Server part of a direct (phone-number) chat.
pub const USER_SERVER: &str = "s.whatsapp.net";
/// Legacy whatsapp-web.js spelling of [`USER_SERVER`].
const LEGACY_USER_SERVER: &str = "c.us";
const GROUP_SERVER: &str = "g.us";
const BROADCAST_SERVER: &str = "broadcast";
/// Channel (newsletter) posts; one-to-many like status broadcasts.
const NEWSLETTER_SERVER: &str = "newsletter";
/// Anonymized internal ids ("linked ids").
const LID_SERVER: &str = "lid";

/// Separators people type into phone numbers.
static PHONE_NOISE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s\-().+]").expect("static regex is valid"));

/// A transport address (`user@server`), kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid(String);

impl Jid {
    /// Wrap a raw JID. Returns `None` for strings without a `user@server` shape.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (user, server) = raw.split_once('@')?;
        if user.is_empty() || server.is_empty() {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    /// Direct-chat address for a bare phone number.
    pub fn for_phone(digits: &str) -> Self {
        Self(format!("{}@{}", digits, USER_SERVER))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn user(&self) -> &str {
        self.0.split_once('@').map(|(u, _)| u).unwrap_or(&self.0)
    }

    pub fn server(&self) -> &str {
        self.0.split_once('@').map(|(_, s)| s).unwrap_or("")
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn server_of(jid: &str) -> &str {
    jid.split_once('@').map(|(_, s)| s).unwrap_or("")
}

pub fn is_group(jid: &str) -> bool {
    server_of(jid) == GROUP_SERVER
}

pub fn is_broadcast(jid: &str) -> bool {
    matches!(server_of(jid), BROADCAST_SERVER | NEWSLETTER_SERVER)
}

pub fn is_anonymized(jid: &str) -> bool {
    server_of(jid) == LID_SERVER
}

/// Strip transport suffixes: `911234567890:3@s.whatsapp.net` → `911234567890`.
pub fn canonical_id(jid: &str) -> String {
    let user = jid.split_once('@').map(|(u, _)| u).unwrap_or(jid);
    let user = user.split_once(':').map(|(u, _)| u).unwrap_or(user);
    user.trim().to_string()
}

/// Resolve a Control API `recipientId` to a direct-chat address.
///
/// Accepts a full JID or a phone number in local or international format.
/// A 10-digit local number gets `default_country_code` prefixed; an 11-digit
/// number with a leading trunk `0` loses the `0` first.
pub fn resolve_recipient(raw: &str, default_country_code: &str) -> Result<Jid, AddressError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AddressError::Empty);
    }

    if raw.contains('@') {
        let jid = Jid::parse(raw).ok_or_else(|| AddressError::InvalidRecipient(raw.to_string()))?;
        return match jid.server() {
            USER_SERVER => normalize_digits(jid.user(), default_country_code, raw),
            LEGACY_USER_SERVER => normalize_digits(jid.user(), default_country_code, raw),
            GROUP_SERVER | BROADCAST_SERVER | NEWSLETTER_SERVER => {
                Err(AddressError::NotDirect(raw.to_string()))
            }
            _ => Err(AddressError::InvalidRecipient(raw.to_string())),
        };
    }

    normalize_digits(raw, default_country_code, raw)
}

fn normalize_digits(
    number: &str,
    default_country_code: &str,
    original: &str,
) -> Result<Jid, AddressError> {
    let cleaned = PHONE_NOISE.replace_all(number, "");
    if cleaned.is_empty() || !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return Err(AddressError::InvalidRecipient(original.to_string()));
    }

    let digits = match cleaned.len() {
        10 => format!("{}{}", default_country_code, cleaned),
        11 if cleaned.starts_with('0') => format!("{}{}", default_country_code, &cleaned[1..]),
        11..=15 => cleaned.into_owned(),
        _ => return Err(AddressError::InvalidRecipient(original.to_string())),
    };

    Ok(Jid::for_phone(&digits))
}
