use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    AccountInfo, ConnectionState, GroupMetadata, Jid, MessageContent, MessageUpdate,
    MessagesUpsert, OutgoingMessage, RelayOptions, SendReceipt, SessionCredentials,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Connecting,
    Open,
    Close,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastDisconnect {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionUpdate {
    #[serde(default)]
    pub connection: Option<ConnectionPhase>,
    #[serde(default)]
    pub last_disconnect: Option<LastDisconnect>,
    #[serde(default)]
    pub qr: Option<String>,
    #[serde(default)]
    pub received_pending_notifications: bool,
    #[serde(default)]
    pub account: Option<AccountInfo>,
}

impl ConnectionUpdate {
    pub fn open(account: Option<AccountInfo>) -> Self {
        Self {
            connection: Some(ConnectionPhase::Open),
            account,
            ..Self::default()
        }
    }

    pub fn close(status_code: Option<u16>) -> Self {
        Self {
            connection: Some(ConnectionPhase::Close),
            last_disconnect: Some(LastDisconnect {
                status_code,
                message: None,
            }),
            ..Self::default()
        }
    }

    pub fn close_status(&self) -> Option<u16> {
        self.last_disconnect
            .as_ref()
            .and_then(|disconnect| disconnect.status_code)
    }
}

/// Everything a live connection reports back, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ConnectionEvent {
    ConnectionUpdate(ConnectionUpdate),
    CredentialsUpdated(SessionCredentials),
    MessagesUpserted(MessagesUpsert),
    MessagesUpdated(Vec<MessageUpdate>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub connect_timeout_ms: u64,
    pub keep_alive_interval_ms: u64,
    pub max_idle_time_ms: u64,
    pub default_query_timeout_ms: u64,
    pub emit_own_events: bool,
    pub browser: String,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 60_000,
            keep_alive_interval_ms: 25_000,
            max_idle_time_ms: 60_000,
            default_query_timeout_ms: 60_000,
            emit_own_events: true,
            browser: "Ubuntu/Chrome".to_string(),
        }
    }
}

/// Requests sent to the messaging bridge over the gateway socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum GatewayRequest {
    Connect {
        options: ConnectOptions,
        #[serde(default)]
        credentials: Option<SessionCredentials>,
    },
    SendMessage {
        recipient: Jid,
        message: OutgoingMessage,
    },
    RelayMessage {
        recipient: Jid,
        content: MessageContent,
        options: RelayOptions,
    },
    GroupMetadata {
        group: Jid,
    },
    RequestPairingCode {
        phone_number: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEnvelope {
    pub id: Uuid,
    pub request: GatewayRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayFailure {
    #[serde(default)]
    pub status_code: Option<u16>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayFrame {
    Response {
        id: Uuid,
        #[serde(default)]
        result: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<GatewayFailure>,
    },
    Event {
        event: ConnectionEvent,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAccepted {
    #[serde(default)]
    pub account: Option<AccountInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendAccepted {
    pub receipt: SendReceipt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMetadataResponse {
    pub metadata: GroupMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingCodeResponse {
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointIndex {
    pub pair: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootResponse {
    pub status: String,
    pub bot: String,
    pub connected: bool,
    pub user: String,
    pub timestamp: DateTime<Utc>,
    pub endpoints: EndpointIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub connected: bool,
    pub state: ConnectionState,
    pub user: Option<String>,
    pub jid: Option<Jid>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairResponse {
    pub success: bool,
    pub pairing_code: String,
    pub number: String,
    pub instructions: Vec<String>,
}
