//! Viya Relay
//!
//! Keeps one WhatsApp session alive, forwards inbound messages to backend
//! processors with ordered fallback, and exposes a small HTTP control API.

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod router;
pub mod whatsapp;

#[cfg(test)]
mod tests;
