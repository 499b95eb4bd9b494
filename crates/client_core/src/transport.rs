use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use shared::{
    domain::{
        AccountInfo, GroupMetadata, Jid, MessageContent, OutgoingMessage, RelayOptions,
        SendReceipt, SessionCredentials,
    },
    protocol::{ConnectOptions, ConnectionEvent},
};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection is not established")]
    NotConnected,
    #[error("operation timed out")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("remote rejected request ({status_code:?}): {message}")]
    Remote {
        status_code: Option<u16>,
        message: String,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Remote { status_code, .. } => *status_code,
            _ => None,
        }
    }
}

/// Typed event stream of a single connection; it ends when the transport is gone.
pub type EventStream = BoxStream<'static, ConnectionEvent>;

pub struct Established {
    pub connection: Arc<dyn Connection>,
    pub events: EventStream,
}

/// Performs the messaging network handshake and hands back a live connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        options: &ConnectOptions,
        credentials: Option<SessionCredentials>,
    ) -> Result<Established, TransportError>;
}

/// Operations offered by a live connection to the messaging network.
#[async_trait]
pub trait Connection: Send + Sync {
    fn account(&self) -> Option<AccountInfo>;

    /// Tears the transport down. Pending and later requests fail; the event stream ends.
    fn close(&self);

    async fn send_message(
        &self,
        recipient: &Jid,
        message: &OutgoingMessage,
    ) -> Result<SendReceipt, TransportError>;

    async fn relay_message(
        &self,
        recipient: &Jid,
        content: &MessageContent,
        options: &RelayOptions,
    ) -> Result<(), TransportError>;

    async fn fetch_group_metadata(&self, group: &Jid) -> Result<GroupMetadata, TransportError>;

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, TransportError>;
}
