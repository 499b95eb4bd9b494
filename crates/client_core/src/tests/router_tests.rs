use super::*;
use crate::{
    supervisor::SupervisorConfig,
    testing::{settle, Harness},
};
use chrono::Utc;
use shared::domain::{
    ConnectionState, InboundMessage, Jid, MessageContent, MessageKey, SessionCredentials,
    UpsertKind,
};

const CHAT: &str = "51922222222@s.whatsapp.net";

fn upsert(ids: &[&str]) -> ConnectionEvent {
    ConnectionEvent::MessagesUpserted(MessagesUpsert {
        kind: UpsertKind::Notify,
        messages: ids
            .iter()
            .map(|id| InboundMessage {
                key: MessageKey {
                    remote_jid: Jid::new(CHAT),
                    id: (*id).to_string(),
                    from_me: false,
                    participant: None,
                },
                push_name: Some("alice".into()),
                timestamp: Utc::now(),
                content: Some(MessageContent::text(format!(".ping {id}"))),
            })
            .collect(),
    })
}

fn supervisor(harness: &Harness) -> ConnectionSupervisor {
    ConnectionSupervisor::new(
        harness.connector.clone(),
        harness.handlers(),
        SupervisorConfig::default(),
    )
}

#[tokio::test(start_paused = true)]
async fn upserts_reach_the_handler_once_in_arrival_order() {
    let harness = Harness::new();
    let supervisor = supervisor(&harness);
    let session = supervisor.establish().await.expect("connect");
    let link = harness.connector.link(0);

    link.emit(upsert(&["m1", "m2"]));
    link.emit(upsert(&["m3"]));
    settle().await;

    assert_eq!(harness.messages.message_ids(), vec!["m1", "m2", "m3"]);
    assert_eq!(harness.messages.generations(), vec![session.generation(); 2]);
    assert_eq!(harness.store.len(&Jid::new(CHAT)), 3);
}

#[tokio::test(start_paused = true)]
async fn events_from_a_replaced_generation_are_inert() {
    let harness = Harness::new();
    let supervisor = supervisor(&harness);
    let first = supervisor.establish().await.expect("first connect");
    let second = supervisor.establish().await.expect("second connect");
    assert!(first.is_retired());
    assert_eq!(second.generation(), first.generation() + 1);

    let stale = harness.connector.link(0);
    stale.emit(upsert(&["late"]));
    stale.emit(ConnectionEvent::ConnectionUpdate(ConnectionUpdate::close(Some(408))));
    settle().await;

    assert!(harness.messages.message_ids().is_empty());
    assert!(!supervisor.is_reconnecting());
    assert_eq!(supervisor.session().map(|s| s.generation()), Some(second.generation()));

    harness.connector.link(1).emit(upsert(&["fresh"]));
    settle().await;
    assert_eq!(harness.messages.message_ids(), vec!["fresh"]);
    assert_eq!(harness.messages.generations(), vec![second.generation()]);
}

#[tokio::test(start_paused = true)]
async fn rotated_credentials_are_persisted() {
    let harness = Harness::new();
    let supervisor = supervisor(&harness);
    supervisor.establish().await.expect("connect");

    let credentials = SessionCredentials(serde_json::json!({ "noiseKey": "k1", "registered": true }));
    harness
        .connector
        .link(0)
        .emit(ConnectionEvent::CredentialsUpdated(credentials.clone()));
    settle().await;

    assert_eq!(
        harness.credentials.stored.lock().expect("credentials").clone(),
        Some(credentials)
    );
}

#[tokio::test(start_paused = true)]
async fn open_update_marks_the_connection_ready() {
    let harness = Harness::new();
    let supervisor = supervisor(&harness);
    supervisor.establish().await.expect("connect");
    assert_eq!(supervisor.state(), ConnectionState::Connecting);

    harness
        .connector
        .link(0)
        .emit(ConnectionEvent::ConnectionUpdate(ConnectionUpdate::open(None)));
    settle().await;

    assert_eq!(supervisor.state(), ConnectionState::Open);
    assert_eq!(supervisor.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn ended_stream_counts_as_a_lost_connection() {
    let harness = Harness::new();
    let supervisor = supervisor(&harness);
    let session = supervisor.establish().await.expect("connect");

    harness.connector.link(0).hang_up();
    settle().await;

    assert!(session.is_retired());
    assert!(supervisor.session().is_none());
    assert_eq!(supervisor.state(), ConnectionState::Closed);
    assert!(supervisor.is_reconnecting());
    assert_eq!(supervisor.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn router_stops_after_its_own_close() {
    let harness = Harness::new();
    let supervisor = supervisor(&harness);
    let session = supervisor.establish().await.expect("connect");
    let link = harness.connector.link(0);

    link.emit(upsert(&["before"]));
    link.emit(ConnectionEvent::ConnectionUpdate(ConnectionUpdate::close(Some(408))));
    link.emit(upsert(&["after"]));
    settle().await;

    assert!(session.is_retired());
    assert!(link.connection.is_closed());
    assert_eq!(harness.messages.message_ids(), vec!["before"]);
    assert_eq!(harness.store.len(&Jid::new(CHAT)), 1);
}
