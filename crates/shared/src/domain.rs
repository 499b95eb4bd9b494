use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const GROUP_SERVER: &str = "g.us";

/// Address of a user or group on the messaging network, e.g. `51929264225@s.whatsapp.net`
/// or `120363040000000000@g.us`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jid(pub String);

impl Jid {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_group(&self) -> bool {
        self.server() == Some(GROUP_SERVER)
    }

    pub fn server(&self) -> Option<&str> {
        self.0.split_once('@').map(|(_, server)| server)
    }

    /// Local part without the device suffix: `123:4@s.whatsapp.net` → `123`.
    pub fn user(&self) -> &str {
        let local = self.0.split_once('@').map_or(self.0.as_str(), |(user, _)| user);
        local.split_once(':').map_or(local, |(user, _)| user)
    }

    pub fn same_user(&self, other: &Jid) -> bool {
        self.user() == other.user() && self.server() == other.server()
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Jid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Connecting,
    Open,
    Closed,
    LoggedOut,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Close reasons reported by the messaging network, keyed by their status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ConnectionClosed,
    ConnectionLost,
    MultideviceMismatch,
    Forbidden,
    LoggedOut,
    ConnectionReplaced,
    BadSession,
    UnavailableService,
    RestartRequired,
    ConnectFailed,
    Unknown(Option<u16>),
}

impl DisconnectReason {
    pub fn from_status_code(code: Option<u16>) -> Self {
        match code {
            Some(428) => Self::ConnectionClosed,
            Some(408) => Self::ConnectionLost,
            Some(411) => Self::MultideviceMismatch,
            Some(403) => Self::Forbidden,
            Some(401) => Self::LoggedOut,
            Some(440) => Self::ConnectionReplaced,
            Some(500) => Self::BadSession,
            Some(503) => Self::UnavailableService,
            Some(515) => Self::RestartRequired,
            other => Self::Unknown(other),
        }
    }

    pub fn status_code(self) -> Option<u16> {
        match self {
            Self::ConnectionClosed => Some(428),
            Self::ConnectionLost => Some(408),
            Self::MultideviceMismatch => Some(411),
            Self::Forbidden => Some(403),
            Self::LoggedOut => Some(401),
            Self::ConnectionReplaced => Some(440),
            Self::BadSession => Some(500),
            Self::UnavailableService => Some(503),
            Self::RestartRequired => Some(515),
            Self::ConnectFailed => None,
            Self::Unknown(code) => code,
        }
    }

    pub fn is_logged_out(self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code() {
            Some(code) => write!(f, "{self:?} ({code})"),
            None => write!(f, "{self:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub id: Jid,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupParticipant {
    pub id: Jid,
    #[serde(default)]
    pub admin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub id: Jid,
    pub subject: String,
    #[serde(default)]
    pub participants: Vec<GroupParticipant>,
    #[serde(default)]
    pub owner: Option<Jid>,
}

impl GroupMetadata {
    pub const UNKNOWN_SUBJECT: &'static str = "Unknown";

    /// Stand-in returned when a group has never been fetched successfully.
    pub fn placeholder(id: &Jid) -> Self {
        Self {
            id: id.clone(),
            subject: Self::UNKNOWN_SUBJECT.to_string(),
            participants: Vec::new(),
            owner: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.subject == Self::UNKNOWN_SUBJECT && self.participants.is_empty()
    }
}

/// Opaque message body. `kind` is the network's content type tag (`conversation`,
/// `imageMessage`, ...) and `body` its payload, which this crate never interprets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    pub kind: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "conversation".to_string(),
            body: serde_json::Value::String(text.into()),
        }
    }

    /// Content type without its `Message` suffix: `imageMessage` → `image`.
    pub fn short_kind(&self) -> String {
        self.kind.replacen("Message", "", 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub remote_jid: Jid,
    pub id: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub participant: Option<Jid>,
}

impl MessageKey {
    /// Author of the message when it was not sent by the connected account.
    pub fn author(&self) -> &Jid {
        self.participant.as_ref().unwrap_or(&self.remote_jid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub key: MessageKey,
    #[serde(default)]
    pub push_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertKind {
    Notify,
    Append,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesUpsert {
    pub kind: UpsertKind,
    pub messages: Vec<InboundMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStub {
    Revoke,
    Other(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub key: MessageKey,
    #[serde(default)]
    pub stub: Option<MessageStub>,
    #[serde(default)]
    pub message: Option<MessageContent>,
}

impl MessageUpdate {
    /// A deletion for everyone arrives as a revoke stub with the body stripped.
    pub fn is_revoke(&self) -> bool {
        self.stub == Some(MessageStub::Revoke) && self.message.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingMessage {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        mentions: Vec<Jid>,
    },
    Content {
        content: MessageContent,
    },
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            mentions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: String,
    pub recipient: Jid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayOptions {
    #[serde(default)]
    pub message_id: Option<String>,
}

/// Session key material handed out by the messaging client on every rotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionCredentials(pub serde_json::Value);
