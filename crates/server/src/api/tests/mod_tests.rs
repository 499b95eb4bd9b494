use super::*;
use std::sync::Mutex;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::Request,
};
use client_core::{
    Connection, Connector, Established, Handlers, IgnoreUpdates, MessageStore, SupervisorConfig,
};
use futures::{channel::mpsc, StreamExt};
use shared::{
    domain::{
        AccountInfo, ConnectionState, GroupMetadata, Jid, MessageContent, OutgoingMessage,
        RelayOptions, SendReceipt, SessionCredentials,
    },
    protocol::{ConnectOptions, ConnectionEvent, ConnectionUpdate},
};
use tower::ServiceExt;

use crate::handlers::InboundLog;

struct PairingConnection {
    code: Result<String, TransportError>,
}

#[async_trait]
impl Connection for PairingConnection {
    fn account(&self) -> Option<AccountInfo> {
        Some(AccountInfo {
            id: Jid::new("51900000001@s.whatsapp.net"),
            name: Some("Hady".into()),
        })
    }

    fn close(&self) {}

    async fn send_message(
        &self,
        recipient: &Jid,
        _message: &OutgoingMessage,
    ) -> Result<SendReceipt, TransportError> {
        Ok(SendReceipt {
            message_id: "1".into(),
            recipient: recipient.clone(),
        })
    }

    async fn relay_message(
        &self,
        _recipient: &Jid,
        _content: &MessageContent,
        _options: &RelayOptions,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn fetch_group_metadata(&self, group: &Jid) -> Result<GroupMetadata, TransportError> {
        Ok(GroupMetadata::placeholder(group))
    }

    async fn request_pairing_code(&self, _phone_number: &str) -> Result<String, TransportError> {
        self.code.clone()
    }
}

struct PairingConnector {
    code: Result<String, TransportError>,
    events: Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
}

impl PairingConnector {
    fn new(code: Result<String, TransportError>) -> Arc<Self> {
        Arc::new(Self {
            code,
            events: Mutex::new(Vec::new()),
        })
    }

    fn emit(&self, event: ConnectionEvent) {
        for events in self.events.lock().expect("events").iter() {
            let _ = events.unbounded_send(event.clone());
        }
    }
}

#[async_trait]
impl Connector for PairingConnector {
    async fn connect(
        &self,
        _options: &ConnectOptions,
        _credentials: Option<SessionCredentials>,
    ) -> Result<Established, TransportError> {
        let (events, events_rx) = mpsc::unbounded();
        self.events.lock().expect("events").push(events);
        Ok(Established {
            connection: Arc::new(PairingConnection {
                code: self.code.clone(),
            }),
            events: events_rx.boxed(),
        })
    }
}

async fn test_app(code: Result<String, TransportError>) -> (Router, ConnectionSupervisor, Arc<PairingConnector>) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let connector = PairingConnector::new(code);
    let supervisor = ConnectionSupervisor::new(
        connector.clone(),
        Handlers {
            messages: Arc::new(InboundLog),
            updates: Arc::new(IgnoreUpdates),
            credentials: Arc::new(storage.clone()),
            store: Arc::new(MessageStore::default()),
        },
        SupervisorConfig::default(),
    );
    let app = build_router(Arc::new(AppState {
        bot_name: "Test Bot".into(),
        supervisor: supervisor.clone(),
        storage,
    }));
    (app, supervisor, connector)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::get(uri).body(Body::empty()).expect("request");
    let response = app.oneshot(request).await.expect("response");
    let status = response.status();
    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, serde_json::from_slice(&body).expect("json"))
}

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let (app, _supervisor, _connector) = test_app(Ok("ABCD-1234".into())).await;
    let request = Request::get("/healthz").body(Body::empty()).expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn root_and_status_report_a_disconnected_bot() {
    let (app, _supervisor, _connector) = test_app(Ok("ABCD-1234".into())).await;

    let (status, root) = get_json(app.clone(), "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(root["status"], "online");
    assert_eq!(root["bot"], "Test Bot");
    assert_eq!(root["connected"], false);
    assert_eq!(root["user"], "Not connected");
    assert_eq!(root["endpoints"]["status"], "/status");

    let (status, body) = get_json(app, "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connected"], false);
    assert_eq!(body["state"], "connecting");
    assert!(body["jid"].is_null());
}

#[tokio::test]
async fn status_reports_the_account_once_open() {
    let (app, supervisor, connector) = test_app(Ok("ABCD-1234".into())).await;
    supervisor.establish().await.expect("connect");
    connector.emit(ConnectionEvent::ConnectionUpdate(ConnectionUpdate::open(None)));
    settle().await;
    assert_eq!(supervisor.state(), ConnectionState::Open);

    let (_, body) = get_json(app.clone(), "/status").await;
    assert_eq!(body["connected"], true);
    assert_eq!(body["state"], "open");
    assert_eq!(body["user"], "Hady");
    assert_eq!(body["jid"], "51900000001@s.whatsapp.net");

    let (_, root) = get_json(app, "/").await;
    assert_eq!(root["connected"], true);
    assert_eq!(root["user"], "Hady");
}

#[tokio::test]
async fn pair_validates_the_number() {
    let (app, _supervisor, _connector) = test_app(Ok("ABCD-1234".into())).await;

    let (status, body) = get_json(app.clone(), "/pair").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "validation");

    let (status, body) = get_json(app, "/pair?number=%2B51-929").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation");
    assert!(body["message"].as_str().expect("message").contains("51929"));
}

#[tokio::test]
async fn pair_without_a_connection_asks_to_retry() {
    let (app, _supervisor, _connector) = test_app(Ok("ABCD-1234".into())).await;

    let (status, body) = get_json(app, "/pair?number=51929264225").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "not_ready");
    assert_eq!(body["retry"], true);
}

#[tokio::test]
async fn pair_returns_the_code_for_a_cleaned_number() {
    let (app, supervisor, _connector) = test_app(Ok("ABCD-1234".into())).await;
    supervisor.establish().await.expect("connect");

    let (status, body) = get_json(app, "/pair?number=%2B51%20929-264-225").await;
    assert_eq!(status, StatusCode::OK);
    let response: PairResponse = serde_json::from_value(body).expect("pair response");
    assert!(response.success);
    assert_eq!(response.pairing_code, "ABCD-1234");
    assert_eq!(response.number, "51929264225");
    assert_eq!(response.instructions.len(), 4);
    assert!(response.instructions[3].ends_with("ABCD-1234"));
}

#[tokio::test]
async fn pair_reports_connector_failures() {
    let (app, supervisor, _connector) = test_app(Err(TransportError::Remote {
        status_code: Some(428),
        message: "Connection Closed".into(),
    }))
    .await;
    supervisor.establish().await.expect("connect");

    let (status, body) = get_json(app, "/pair?number=51929264225").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "internal");
    assert!(body.get("retry").is_none());
}

#[test]
fn clean_number_keeps_digits_only() {
    assert_eq!(clean_number("+51 929-264-225"), "51929264225");
    assert_eq!(clean_number("abc"), "");
}
