//! WhatsApp Message Handler
//!
//! One raw inbound event in, at most one reply out: normalize, route through
//! the processor chain, send the reply back to the chat it came from.

use super::address::Jid;
use super::normalizer::{self, DropReason};
use super::session::Session;
use crate::error::TransportError;
use crate::router::{FallbackRouter, ReplySource};
use serde_json::Value;

#[derive(Debug)]
pub enum HandleOutcome {
    Dropped(DropReason),
    Replied {
        source: ReplySource,
        /// Chunks actually sent, or why the send failed.
        sent: Result<usize, TransportError>,
    },
}

pub(crate) async fn handle_message(
    raw: &Value,
    session: &Session,
    router: &FallbackRouter,
) -> HandleOutcome {
    let message = match normalizer::normalize(raw) {
        Ok(message) => message,
        Err(reason) => {
            tracing::debug!("WhatsApp: dropping inbound event ({:?})", reason);
            return HandleOutcome::Dropped(reason);
        }
    };

    tracing::info!(
        "WhatsApp: message from {} ({}): {}",
        message.sender_id,
        message.display_name,
        preview(&message.text)
    );

    let reply = router.route(&message).await;

    let sent = match Jid::parse(&message.raw_ref) {
        Some(to) => session.send_chunked(&to, &reply.text).await,
        None => Err(TransportError::InvalidResponse(format!(
            "unroutable chat address '{}'",
            message.raw_ref
        ))),
    };

    // Lost replies are not retried
    match &sent {
        Ok(chunks) => tracing::debug!(
            "WhatsApp: replied to {} in {} chunk(s)",
            message.sender_id,
            chunks
        ),
        Err(e) => tracing::error!(
            "WhatsApp: failed to deliver reply to {}: {}",
            message.sender_id,
            e
        ),
    }

    HandleOutcome::Replied {
        source: reply.source,
        sent,
    }
}

fn preview(text: &str) -> String {
    match text.char_indices().nth(60) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
