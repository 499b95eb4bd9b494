use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    domain::{
        AccountInfo, GroupMetadata, Jid, MessageContent, OutgoingMessage, RelayOptions,
        SendReceipt, SessionCredentials,
    },
    protocol::{
        ConnectAccepted, ConnectOptions, ConnectionEvent, ConnectionPhase, GatewayEnvelope,
        GatewayFrame, GatewayRequest, GroupMetadataResponse, PairingCodeResponse, SendAccepted,
    },
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::timeout,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::transport::{Connection, Connector, Established, TransportError};

type Waiter = oneshot::Sender<Result<Value, TransportError>>;

/// Connects to a messaging bridge that speaks JSON frames over a websocket: requests go
/// out as [`GatewayEnvelope`]s and come back as [`GatewayFrame::Response`] with the same
/// id, while [`GatewayFrame::Event`]s feed the connection's event stream.
#[derive(Debug, Clone)]
pub struct GatewayConnector {
    url: Url,
}

impl GatewayConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for GatewayConnector {
    async fn connect(
        &self,
        options: &ConnectOptions,
        credentials: Option<SessionCredentials>,
    ) -> Result<Established, TransportError> {
        let connect_timeout = Duration::from_millis(options.connect_timeout_ms);
        let (socket, _) = timeout(connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|err| TransportError::Protocol(format!("websocket connect failed: {err}")))?;
        let (mut writer, mut reader) = socket.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (events, events_rx) = mpsc::unbounded_channel::<ConnectionEvent>();
        let (shutdown, _) = watch::channel(false);
        let link = Arc::new(Link {
            outbound,
            pending: Mutex::new(HashMap::new()),
            account: Mutex::new(None),
            closed: AtomicBool::new(false),
            shutdown,
            query_timeout: Duration::from_millis(options.default_query_timeout_ms),
        });

        let keep_alive = Duration::from_millis(options.keep_alive_interval_ms.max(1));
        let mut writer_shutdown = link.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keep_alive);
            ticker.tick().await;
            loop {
                let message = tokio::select! {
                    message = outbound_rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                    _ = ticker.tick() => Message::Ping(Vec::new()),
                    _ = writer_shutdown.wait_for(|closed| *closed) => break,
                };
                if let Err(err) = writer.send(message).await {
                    debug!(error = %err, "gateway write failed");
                    break;
                }
            }
            let _ = writer.close().await;
        });

        let max_idle = Duration::from_millis(options.max_idle_time_ms.max(1));
        let reader_link = Arc::clone(&link);
        let mut reader_shutdown = link.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    next = timeout(max_idle, reader.next()) => match next {
                        Ok(next) => next,
                        Err(_) => {
                            warn!(idle_ms = max_idle.as_millis() as u64, "gateway went idle");
                            break;
                        }
                    },
                    _ = reader_shutdown.wait_for(|closed| *closed) => break,
                };
                match next {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<GatewayFrame>(&text) {
                        Ok(frame) => {
                            if !reader_link.dispatch(frame, &events) {
                                debug!("event consumer gone; dropping gateway link");
                                break;
                            }
                        }
                        Err(err) => warn!(error = %err, "invalid gateway frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "gateway receive failed");
                        break;
                    }
                }
            }
            reader_link.close();
        });

        let connection = GatewayConnection { link };
        let accepted: ConnectAccepted = connection
            .link
            .request(
                GatewayRequest::Connect {
                    options: options.clone(),
                    credentials,
                },
                connect_timeout,
            )
            .await?;
        if accepted.account.is_some() {
            *connection.link.lock_account() = accepted.account;
        }

        Ok(Established {
            connection: Arc::new(connection),
            events: UnboundedReceiverStream::new(events_rx).boxed(),
        })
    }
}

struct Link {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<Uuid, Waiter>>,
    account: Mutex<Option<AccountInfo>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    query_timeout: Duration,
}

impl Link {
    /// Routes one inbound frame. Returns `false` once nobody consumes events anymore.
    fn dispatch(&self, frame: GatewayFrame, events: &mpsc::UnboundedSender<ConnectionEvent>) -> bool {
        match frame {
            GatewayFrame::Response { id, result, error } => {
                let waiter = self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                let Some(waiter) = waiter else {
                    debug!(%id, "response for an abandoned request");
                    return true;
                };
                let outcome = match error {
                    Some(failure) => Err(TransportError::Remote {
                        status_code: failure.status_code,
                        message: failure.message,
                    }),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = waiter.send(outcome);
                true
            }
            GatewayFrame::Event { event } => {
                if let ConnectionEvent::ConnectionUpdate(update) = &event {
                    if update.connection == Some(ConnectionPhase::Open) && update.account.is_some() {
                        *self.lock_account() = update.account.clone();
                    }
                }
                events.send(event).is_ok()
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        let waiters: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(TransportError::Closed));
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        request: GatewayRequest,
        limit: Duration,
    ) -> Result<T, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let id = Uuid::new_v4();
        let frame = serde_json::to_string(&GatewayEnvelope { id, request })
            .map_err(|err| TransportError::Protocol(err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        if self.closed.load(Ordering::SeqCst) || self.outbound.send(Message::Text(frame)).is_err() {
            self.forget(&id);
            return Err(TransportError::NotConnected);
        }

        let value = match timeout(limit, rx).await {
            Ok(Ok(outcome)) => outcome?,
            Ok(Err(_)) => return Err(TransportError::Closed),
            Err(_) => {
                self.forget(&id);
                return Err(TransportError::Timeout);
            }
        };
        serde_json::from_value(value).map_err(|err| TransportError::Protocol(err.to_string()))
    }

    fn forget(&self, id: &Uuid) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn lock_account(&self) -> std::sync::MutexGuard<'_, Option<AccountInfo>> {
        self.account.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct GatewayConnection {
    link: Arc<Link>,
}

impl Drop for GatewayConnection {
    fn drop(&mut self) {
        self.link.close();
    }
}

#[async_trait]
impl Connection for GatewayConnection {
    fn account(&self) -> Option<AccountInfo> {
        self.link.lock_account().clone()
    }

    fn close(&self) {
        self.link.close();
    }

    async fn send_message(
        &self,
        recipient: &Jid,
        message: &OutgoingMessage,
    ) -> Result<SendReceipt, TransportError> {
        let accepted: SendAccepted = self
            .link
            .request(
                GatewayRequest::SendMessage {
                    recipient: recipient.clone(),
                    message: message.clone(),
                },
                self.link.query_timeout,
            )
            .await?;
        Ok(accepted.receipt)
    }

    async fn relay_message(
        &self,
        recipient: &Jid,
        content: &MessageContent,
        options: &RelayOptions,
    ) -> Result<(), TransportError> {
        let _: Value = self
            .link
            .request(
                GatewayRequest::RelayMessage {
                    recipient: recipient.clone(),
                    content: content.clone(),
                    options: options.clone(),
                },
                self.link.query_timeout,
            )
            .await?;
        Ok(())
    }

    async fn fetch_group_metadata(&self, group: &Jid) -> Result<GroupMetadata, TransportError> {
        let response: GroupMetadataResponse = self
            .link
            .request(
                GatewayRequest::GroupMetadata {
                    group: group.clone(),
                },
                self.link.query_timeout,
            )
            .await?;
        Ok(response.metadata)
    }

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, TransportError> {
        let response: PairingCodeResponse = self
            .link
            .request(
                GatewayRequest::RequestPairingCode {
                    phone_number: phone_number.to_string(),
                },
                self.link.query_timeout,
            )
            .await?;
        Ok(response.code)
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
