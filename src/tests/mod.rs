//! Cross-module scenario tests.

mod agent_lifecycle_test;

use crate::error::TransportError;
use crate::whatsapp::{
    ConnectOutcome, ConnectionState, Credentials, EventSender, Jid, OutboundMedia, Session,
    Transport,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Transport fake that records every call and replays scripted connect results.
pub(crate) struct ScriptedTransport {
    events: Option<EventSender>,
    connects: Mutex<VecDeque<Result<ConnectOutcome, TransportError>>>,
    /// Emitted as `CredentialsUpdated` on the next connect without credentials.
    issue_credentials: Option<Credentials>,
    pub connect_calls: Mutex<Vec<Option<Credentials>>>,
    pub sent: Mutex<Vec<(String, String)>>,
    pub media: Mutex<Vec<(String, OutboundMedia)>>,
    pub logouts: Mutex<usize>,
    hang_logout: bool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            events: None,
            connects: Mutex::new(VecDeque::new()),
            issue_credentials: None,
            connect_calls: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            media: Mutex::new(Vec::new()),
            logouts: Mutex::new(0),
            hang_logout: false,
        }
    }

    /// Logout calls are recorded and then never answered.
    pub fn with_hanging_logout(mut self) -> Self {
        self.hang_logout = true;
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn issuing(mut self, credentials: Credentials) -> Self {
        self.issue_credentials = Some(credentials);
        self
    }

    pub fn then_connect(self, outcome: Result<ConnectOutcome, TransportError>) -> Self {
        self.connects.lock().unwrap().push_back(outcome);
        self
    }

    pub fn connect_count(&self) -> usize {
        self.connect_calls.lock().unwrap().len()
    }

    pub fn logout_count(&self) -> usize {
        *self.logouts.lock().unwrap()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(
        &self,
        credentials: Option<Credentials>,
    ) -> Result<ConnectOutcome, TransportError> {
        let fresh = credentials.is_none();
        self.connect_calls.lock().unwrap().push(credentials);

        if fresh
            && let (Some(events), Some(creds)) = (&self.events, &self.issue_credentials)
        {
            let _ = events.send(crate::whatsapp::TransportEvent::CredentialsUpdated(creds.clone()));
        }

        // Script exhausted: keep failing like a dead provider
        self.connects
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(TransportError::Rejected {
                status: 503,
                body: "provider down".into(),
            }))
    }

    async fn send(&self, to: &Jid, text: &str) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((to.as_str().to_string(), text.to_string()));
        Ok(())
    }

    async fn send_media(&self, to: &Jid, media: &OutboundMedia) -> Result<(), TransportError> {
        self.media
            .lock()
            .unwrap()
            .push((to.as_str().to_string(), media.clone()));
        Ok(())
    }

    async fn logout(&self) -> Result<(), TransportError> {
        *self.logouts.lock().unwrap() += 1;
        if self.hang_logout {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Wait (bounded) until the session reaches `state`.
pub(crate) async fn wait_for_state(session: &Session, state: ConnectionState) {
    let mut rx = session.subscribe();
    tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("session never reached {:?}, stuck at {:?}", state, session.state()))
        .unwrap();
}

/// Poll `check` until it holds or a few seconds pass.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
