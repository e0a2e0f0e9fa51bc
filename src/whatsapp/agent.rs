//! WhatsApp Agent
//!
//! Background task that owns the session lifecycle: the initial connect,
//! every transport event, reconnect timers and operator commands all pass
//! through one loop, so the supervisor is never touched concurrently.

use super::handler;
use super::pairing;
use super::session::Session;
use super::supervisor::{ReconnectPolicy, ReconnectSupervisor, SupervisorAction};
use super::transport::{
    ConnectOutcome, ConnectionState, ConnectionUpdate, EventReceiver, TransportEvent,
};
use crate::router::FallbackRouter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};

/// Inbound messages processed at once; the rest wait for a permit.
const MAX_CONCURRENT_HANDLERS: usize = 32;

/// Operator requests accepted by a running agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Reset backoff and connect afresh, from any state.
    Restart,
}

pub type CommandSender = mpsc::UnboundedSender<SessionCommand>;
pub type CommandReceiver = mpsc::UnboundedReceiver<SessionCommand>;

pub fn command_channel() -> (CommandSender, CommandReceiver) {
    mpsc::unbounded_channel()
}

/// Deadlines armed by the agent, tagged with the supervisor generation.
#[derive(Debug, Clone, Copy)]
enum Timer {
    Reconnect(u64),
    Handshake(u64),
}

pub struct WhatsAppAgent {
    session: Arc<Session>,
    router: Arc<FallbackRouter>,
    supervisor: ReconnectSupervisor,
    events: EventReceiver,
    commands: CommandReceiver,
    timer_tx: mpsc::UnboundedSender<Timer>,
    timer_rx: mpsc::UnboundedReceiver<Timer>,
    handlers: Arc<Semaphore>,
    data_dir: PathBuf,
}

impl WhatsAppAgent {
    pub fn new(
        session: Arc<Session>,
        router: Arc<FallbackRouter>,
        policy: ReconnectPolicy,
        events: EventReceiver,
        commands: CommandReceiver,
        data_dir: PathBuf,
    ) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        Self {
            session,
            router,
            supervisor: ReconnectSupervisor::new(policy),
            events,
            commands,
            timer_tx,
            timer_rx,
            handlers: Arc::new(Semaphore::new(MAX_CONCURRENT_HANDLERS)),
            data_dir,
        }
    }

    /// Start as a background task. Connects immediately, then serves events
    /// until the command channel closes.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::info!(
            "WhatsApp agent running ({} processor endpoint(s))",
            self.router.endpoints().len()
        );
        self.connect().await;

        loop {
            tokio::select! {
                Some(event) = self.events.recv() => self.on_event(event).await,
                Some(timer) = self.timer_rx.recv() => self.on_timer(timer).await,
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Restart) => {
                        tracing::info!("WhatsApp: operator requested reconnect");
                        self.supervisor.restart();
                        self.sync_state();
                        self.connect().await;
                    }
                    None => break,
                },
            }
        }
        tracing::info!("WhatsApp agent stopped");
    }

    async fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Reconnect(generation) if self.supervisor.should_reconnect(generation) => {
                tracing::info!(
                    "WhatsApp: reconnecting (attempt {})",
                    self.supervisor.attempt()
                );
                self.connect().await;
            }
            Timer::Handshake(generation) if self.supervisor.handshake_expired(generation) => {
                tracing::warn!("WhatsApp: no open event within the handshake deadline");
                self.apply(ConnectionUpdate::Closed {
                    reason: Some("handshake timed out".into()),
                })
                .await;
            }
            other => tracing::debug!("WhatsApp: {:?} superseded", other),
        }
    }

    fn arm(&self, timer: Timer, delay: Duration) {
        let timer_tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timer_tx.send(timer);
        });
    }

    async fn connect(&mut self) {
        self.apply(ConnectionUpdate::Connecting).await;

        let outcome = self.session.connect().await;
        // Credentials issued during connect must hit disk before we can go open
        self.drain_events().await;

        match outcome {
            Ok(ConnectOutcome::Open) => self.apply(ConnectionUpdate::Open).await,
            // The handshake deadline armed by `Connecting` covers both of these
            Ok(ConnectOutcome::Connecting) => {
                tracing::debug!("WhatsApp: handshake in progress");
            }
            Ok(ConnectOutcome::PairingRequired(artifact)) => {
                self.on_event(TransportEvent::PairingCode(artifact)).await;
            }
            Err(e) => {
                tracing::warn!("WhatsApp: connect failed: {}", e);
                self.apply(ConnectionUpdate::Closed {
                    reason: Some(e.to_string()),
                })
                .await;
            }
        }
    }

    async fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.on_event(event).await;
        }
    }

    async fn on_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connection(update) => self.apply(update).await,
            TransportEvent::PairingCode(artifact) => {
                pairing::present(&artifact, &self.data_dir).await;
                self.session.set_pairing(Some(artifact)).await;
            }
            TransportEvent::CredentialsUpdated(credentials) => {
                match self.session.persist_credentials(&credentials).await {
                    Ok(()) => tracing::debug!("WhatsApp: credentials persisted"),
                    Err(e) => tracing::error!("WhatsApp: failed to persist credentials: {}", e),
                }
            }
            TransportEvent::Message(raw) => {
                let session = self.session.clone();
                let router = self.router.clone();
                let handlers = self.handlers.clone();
                tokio::spawn(async move {
                    let Ok(_permit) = handlers.acquire_owned().await else {
                        return;
                    };
                    handler::handle_message(&raw, &session, &router).await;
                });
            }
        }
    }

    /// Feed the supervisor and carry out what it decides.
    async fn apply(&mut self, update: ConnectionUpdate) {
        match &update {
            ConnectionUpdate::Open => {
                tracing::info!("WhatsApp: connected successfully");
                self.session.set_pairing(None).await;
            }
            ConnectionUpdate::Closed { reason } => tracing::warn!(
                "WhatsApp: disconnected ({})",
                reason.as_deref().unwrap_or("no reason given")
            ),
            _ => {}
        }

        let action = self.supervisor.on_update(update);
        self.sync_state();

        if self.supervisor.state() == ConnectionState::Connecting {
            // Every fresh `connecting` gets a deadline; any later update supersedes it
            let deadline = self.session.limits().handshake_timeout;
            self.arm(Timer::Handshake(self.supervisor.generation()), deadline);
        }

        match action {
            SupervisorAction::Nothing => {}
            SupervisorAction::ScheduleReconnect { delay, generation } => {
                tracing::info!("WhatsApp: reconnecting in {:?}", delay);
                self.arm(Timer::Reconnect(generation), delay);
            }
            SupervisorAction::ResetCredentials { generation } => {
                tracing::warn!("WhatsApp: reconnect attempts exhausted, resetting credentials");
                self.session.wipe_credentials().await;
                // Fresh pairing right away, through the timer path
                let _ = self.timer_tx.send(Timer::Reconnect(generation));
            }
            SupervisorAction::Halt => {
                tracing::error!(
                    "WhatsApp: logged out, device was unlinked. Credentials wiped; \
                     re-pair with POST /session/reconnect"
                );
                self.session.wipe_credentials().await;
            }
        }
    }

    fn sync_state(&self) {
        self.session.set_state(self.supervisor.state());
    }
}
