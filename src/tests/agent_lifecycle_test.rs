//! Session lifecycle driven by the agent: pairing, reconnects, logout.

use super::{ScriptedTransport, eventually, wait_for_state};
use crate::error::TransportError;
use crate::router::{DEFAULT_APOLOGY, FallbackRouter, ProcessorEndpoint};
use crate::whatsapp::{
    CommandSender, ConnectOutcome, ConnectionState, ConnectionUpdate, CredentialStore,
    Credentials, EventSender, MemoryCredentialStore, PairingArtifact, ReconnectPolicy, Session,
    SessionCommand, SessionLimits, TransportEvent, WhatsAppAgent, command_channel, event_channel,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        base: Duration::from_millis(10),
        cap: Duration::from_millis(40),
        max_attempts,
    }
}

fn router() -> Arc<FallbackRouter> {
    Arc::new(FallbackRouter::new(
        vec![ProcessorEndpoint {
            name: "unused".into(),
            url: "http://127.0.0.1:1/process".into(),
            timeout_ms: 500,
            priority: 0,
        }],
        DEFAULT_APOLOGY,
    ))
}

fn rejected() -> Result<ConnectOutcome, TransportError> {
    Err(TransportError::Rejected {
        status: 503,
        body: "unavailable".into(),
    })
}

struct Running {
    session: Arc<Session>,
    store: Arc<MemoryCredentialStore>,
    events: EventSender,
    commands: CommandSender,
    _data_dir: tempfile::TempDir,
}

fn start(
    transport: Arc<ScriptedTransport>,
    store: Arc<MemoryCredentialStore>,
    events: (EventSender, crate::whatsapp::transport::EventReceiver),
    policy: ReconnectPolicy,
) -> Running {
    start_with_limits(transport, store, events, policy, SessionLimits::default())
}

fn start_with_limits(
    transport: Arc<ScriptedTransport>,
    store: Arc<MemoryCredentialStore>,
    events: (EventSender, crate::whatsapp::transport::EventReceiver),
    policy: ReconnectPolicy,
    limits: SessionLimits,
) -> Running {
    let (commands_tx, commands_rx) = command_channel();
    let session = Arc::new(Session::new(transport, store.clone(), limits));
    let data_dir = tempfile::tempdir().unwrap();
    WhatsAppAgent::new(
        session.clone(),
        router(),
        policy,
        events.1,
        commands_rx,
        data_dir.path().to_path_buf(),
    )
    .start();
    Running {
        session,
        store,
        events: events.0,
        commands: commands_tx,
        _data_dir: data_dir,
    }
}

#[tokio::test]
async fn test_first_run_pairs_and_persists_before_open() {
    let (events_tx, events_rx) = event_channel();
    let issued = Credentials(json!({"instanceName": "viya", "token": "fresh"}));
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_events(events_tx.clone())
            .issuing(issued.clone())
            .then_connect(Ok(ConnectOutcome::PairingRequired(PairingArtifact {
                code: Some("2@pairme".into()),
                image: None,
            }))),
    );
    let store = Arc::new(MemoryCredentialStore::default());
    let relay = start(transport.clone(), store, (events_tx, events_rx), fast_policy(5));

    // Waiting for a scan: not open, artifact available, creds already durable
    let session = relay.session.clone();
    let mut pairing_seen = false;
    for _ in 0..300 {
        if session.pairing().await.is_some() {
            pairing_seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(pairing_seen);
    assert!(!relay.session.is_open());
    assert_eq!(relay.store.load().await.unwrap(), Some(issued));

    // User scans; provider reports open
    relay
        .events
        .send(TransportEvent::Connection(ConnectionUpdate::Open))
        .unwrap();
    wait_for_state(&relay.session, ConnectionState::Open).await;
    assert!(relay.session.pairing().await.is_none());
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test]
async fn test_transient_disconnect_reconnects() {
    let (events_tx, events_rx) = event_channel();
    let transport = Arc::new(
        ScriptedTransport::new()
            .then_connect(Ok(ConnectOutcome::Open))
            .then_connect(rejected())
            .then_connect(Ok(ConnectOutcome::Open)),
    );
    let store = Arc::new(MemoryCredentialStore::with(Credentials(json!({"token": "t"}))));
    let relay = start(transport.clone(), store, (events_tx, events_rx), fast_policy(5));
    wait_for_state(&relay.session, ConnectionState::Open).await;

    relay
        .events
        .send(TransportEvent::Connection(ConnectionUpdate::Closed {
            reason: Some("statusReason 428".into()),
        }))
        .unwrap();

    // First retry fails, second opens again
    eventually(|| transport.connect_count() == 3 && relay.session.is_open()).await;
    assert_eq!(transport.logout_count(), 0);
    // Stored credentials were reused on every attempt
    assert!(transport.connect_calls.lock().unwrap().iter().all(Option::is_some));
}

#[tokio::test]
async fn test_logged_out_halts_until_operator_restart() {
    let (events_tx, events_rx) = event_channel();
    let transport = Arc::new(
        ScriptedTransport::new()
            .then_connect(Ok(ConnectOutcome::Open))
            .then_connect(Ok(ConnectOutcome::PairingRequired(PairingArtifact {
                code: Some("2@again".into()),
                image: None,
            }))),
    );
    let store = Arc::new(MemoryCredentialStore::with(Credentials(json!({"token": "t"}))));
    let relay = start(transport.clone(), store, (events_tx, events_rx), fast_policy(5));
    wait_for_state(&relay.session, ConnectionState::Open).await;

    relay
        .events
        .send(TransportEvent::Connection(ConnectionUpdate::LoggedOut))
        .unwrap();
    wait_for_state(&relay.session, ConnectionState::LoggedOut).await;
    eventually(|| transport.logout_count() == 1).await;
    assert!(relay.store.load().await.unwrap().is_none());

    // Later drops do not trigger retries
    relay
        .events
        .send(TransportEvent::Connection(ConnectionUpdate::Closed { reason: None }))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(transport.connect_count(), 1);
    assert_eq!(relay.session.state(), ConnectionState::LoggedOut);

    // Operator re-initiates: fresh connect without credentials
    relay.commands.send(SessionCommand::Restart).unwrap();
    eventually(|| transport.connect_count() == 2).await;
    assert!(transport.connect_calls.lock().unwrap()[1].is_none());
}

#[tokio::test]
async fn test_exhausted_retries_wipe_credentials() {
    let (events_tx, events_rx) = event_channel();
    // Every connect fails
    let transport = Arc::new(ScriptedTransport::new());
    let store = Arc::new(MemoryCredentialStore::with(Credentials(json!({"token": "stale"}))));
    let relay = start(transport.clone(), store, (events_tx, events_rx), fast_policy(2));

    eventually(|| transport.logout_count() >= 1).await;
    // After the wipe the next attempt starts from scratch
    eventually(|| {
        transport
            .connect_calls
            .lock()
            .unwrap()
            .iter()
            .skip(1)
            .any(Option::is_none)
    })
    .await;
    assert!(!relay.session.is_open());
}

#[tokio::test]
async fn test_hung_logout_still_clears_credentials_and_keeps_serving() {
    let (events_tx, events_rx) = event_channel();
    // Provider accepts the socket but never answers a logout; connects all fail
    let transport = Arc::new(ScriptedTransport::new().with_hanging_logout());
    let store = Arc::new(MemoryCredentialStore::with(Credentials(json!({"token": "stale"}))));
    let limits = SessionLimits {
        connect_timeout: Duration::from_millis(50),
        ..SessionLimits::default()
    };
    let relay = start_with_limits(
        transport.clone(),
        store,
        (events_tx, events_rx),
        fast_policy(1),
        limits,
    );

    eventually(|| transport.logout_count() >= 1).await;
    let mut cleared = false;
    for _ in 0..300 {
        if relay.store.load().await.unwrap().is_none() {
            cleared = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(cleared, "credentials survived the reset");

    // The loop is still alive: an operator restart leads to another connect
    let before = transport.connect_count();
    relay.commands.send(SessionCommand::Restart).unwrap();
    eventually(|| transport.connect_count() > before).await;
}

#[tokio::test]
async fn test_silent_handshake_times_out_and_retries() {
    let (events_tx, events_rx) = event_channel();
    // Provider says "connecting" and then never reports open
    let transport = Arc::new(
        ScriptedTransport::new()
            .then_connect(Ok(ConnectOutcome::Connecting))
            .then_connect(Ok(ConnectOutcome::Open)),
    );
    let store = Arc::new(MemoryCredentialStore::with(Credentials(json!({"token": "t"}))));
    let limits = SessionLimits {
        handshake_timeout: Duration::from_millis(60),
        ..SessionLimits::default()
    };
    let relay = start_with_limits(
        transport.clone(),
        store,
        (events_tx, events_rx),
        fast_policy(5),
        limits,
    );

    wait_for_state(&relay.session, ConnectionState::Open).await;
    assert_eq!(transport.connect_count(), 2);
}

#[tokio::test]
async fn test_open_event_beats_handshake_deadline() {
    let (events_tx, events_rx) = event_channel();
    let transport = Arc::new(ScriptedTransport::new().then_connect(Ok(ConnectOutcome::Connecting)));
    let store = Arc::new(MemoryCredentialStore::with(Credentials(json!({"token": "t"}))));
    let limits = SessionLimits {
        handshake_timeout: Duration::from_millis(60),
        ..SessionLimits::default()
    };
    let relay = start_with_limits(
        transport.clone(),
        store,
        (events_tx, events_rx),
        fast_policy(5),
        limits,
    );
    wait_for_state(&relay.session, ConnectionState::Connecting).await;

    relay
        .events
        .send(TransportEvent::Connection(ConnectionUpdate::Open))
        .unwrap();
    wait_for_state(&relay.session, ConnectionState::Open).await;

    // The stale deadline must not knock an open session down
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(relay.session.is_open());
    assert_eq!(transport.connect_count(), 1);
}
