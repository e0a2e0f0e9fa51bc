//! WhatsApp Integration
//!
//! Keeps one WhatsApp session alive, turns inbound chat messages into
//! processor requests and sends the replies back.

pub mod address;
mod agent;
pub mod credentials;
pub mod evolution;
mod handler;
pub mod normalizer;
pub mod pairing;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use address::{Jid, resolve_recipient};
pub use agent::{CommandReceiver, CommandSender, SessionCommand, WhatsAppAgent, command_channel};
pub use credentials::{CredentialStore, Credentials, FileCredentialStore, MemoryCredentialStore};
pub use evolution::{EvolutionOptions, EvolutionTransport, instance_token, parse_webhook};
pub use handler::HandleOutcome;
pub use normalizer::{DropReason, InboundMessage, normalize};
pub use session::{Session, SessionLimits};
pub use supervisor::{ReconnectPolicy, ReconnectSupervisor, SupervisorAction};
pub use transport::{
    ConnectOutcome, ConnectionState, ConnectionUpdate, EventSender, MediaKind, OutboundMedia,
    PairingArtifact, Transport, TransportEvent, event_channel,
};
