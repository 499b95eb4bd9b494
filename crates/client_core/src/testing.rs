//! Controllable transport doubles shared by the unit tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use shared::{
    domain::{
        AccountInfo, GroupMetadata, Jid, MessageContent, MessagesUpsert, OutgoingMessage,
        RelayOptions, SendReceipt, SessionCredentials,
    },
    protocol::{ConnectOptions, ConnectionEvent},
};
use storage::CredentialStore;
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    message_store::MessageStore,
    router::{Handlers, IgnoreUpdates, MessageHandler},
    session::Session,
    transport::{Connection, Connector, Established, TransportError},
};

pub(crate) enum SendBehaviour {
    Succeed,
    Fail,
    Hang,
    Delay(Duration),
    Gate(oneshot::Receiver<()>),
}

pub(crate) enum GroupBehaviour {
    Succeed(GroupMetadata),
    Fail,
    Hang,
}

#[derive(Debug, Clone)]
pub(crate) struct Delivered {
    pub recipient: Jid,
    pub message: OutgoingMessage,
    pub started: Instant,
    pub completed: Instant,
}

pub(crate) struct StubConnection {
    pub account: Option<AccountInfo>,
    pub send_script: Mutex<VecDeque<SendBehaviour>>,
    pub delivered: Mutex<Vec<Delivered>>,
    pub send_attempts: AtomicUsize,
    pub group_behaviour: Mutex<GroupBehaviour>,
    pub group_fetches: AtomicUsize,
    pub relayed: Mutex<Vec<(Jid, MessageContent, RelayOptions)>>,
    pub pairing_code: String,
    pub closed: AtomicBool,
}

impl StubConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_account(Some(AccountInfo {
            id: Jid::new("51900000001@s.whatsapp.net"),
            name: Some("bot".into()),
        })))
    }

    pub fn with_account(account: Option<AccountInfo>) -> Self {
        Self {
            account,
            send_script: Mutex::new(VecDeque::new()),
            delivered: Mutex::new(Vec::new()),
            send_attempts: AtomicUsize::new(0),
            group_behaviour: Mutex::new(GroupBehaviour::Fail),
            group_fetches: AtomicUsize::new(0),
            relayed: Mutex::new(Vec::new()),
            pairing_code: "ABCD-1234".into(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn script_send(&self, behaviour: SendBehaviour) {
        self.send_script.lock().expect("script").push_back(behaviour);
    }

    pub fn set_group_behaviour(&self, behaviour: GroupBehaviour) {
        *self.group_behaviour.lock().expect("group") = behaviour;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().expect("delivered").clone()
    }

    pub fn delivered_texts(&self) -> Vec<String> {
        self.delivered()
            .into_iter()
            .map(|delivery| match delivery.message {
                OutgoingMessage::Text { text, .. } => text,
                OutgoingMessage::Content { content } => content.kind,
            })
            .collect()
    }
}

#[async_trait]
impl Connection for StubConnection {
    fn account(&self) -> Option<AccountInfo> {
        self.account.clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn send_message(
        &self,
        recipient: &Jid,
        message: &OutgoingMessage,
    ) -> Result<SendReceipt, TransportError> {
        let attempt = self.send_attempts.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let behaviour = self
            .send_script
            .lock()
            .expect("script")
            .pop_front()
            .unwrap_or(SendBehaviour::Succeed);
        match behaviour {
            SendBehaviour::Succeed => {}
            SendBehaviour::Fail => {
                return Err(TransportError::Remote {
                    status_code: Some(500),
                    message: "rejected".into(),
                })
            }
            SendBehaviour::Hang => futures::future::pending::<()>().await,
            SendBehaviour::Delay(delay) => tokio::time::sleep(delay).await,
            SendBehaviour::Gate(gate) => {
                let _ = gate.await;
            }
        }
        self.delivered.lock().expect("delivered").push(Delivered {
            recipient: recipient.clone(),
            message: message.clone(),
            started,
            completed: Instant::now(),
        });
        Ok(SendReceipt {
            message_id: format!("MSG{attempt}"),
            recipient: recipient.clone(),
        })
    }

    async fn relay_message(
        &self,
        recipient: &Jid,
        content: &MessageContent,
        options: &RelayOptions,
    ) -> Result<(), TransportError> {
        self.relayed.lock().expect("relayed").push((
            recipient.clone(),
            content.clone(),
            options.clone(),
        ));
        Ok(())
    }

    async fn fetch_group_metadata(&self, group: &Jid) -> Result<GroupMetadata, TransportError> {
        self.group_fetches.fetch_add(1, Ordering::SeqCst);
        let outcome = match &*self.group_behaviour.lock().expect("group") {
            GroupBehaviour::Succeed(metadata) => Some(Ok(GroupMetadata {
                id: group.clone(),
                ..metadata.clone()
            })),
            GroupBehaviour::Fail => Some(Err(TransportError::Remote {
                status_code: Some(404),
                message: "item-not-found".into(),
            })),
            GroupBehaviour::Hang => None,
        };
        match outcome {
            Some(outcome) => outcome,
            None => futures::future::pending().await,
        }
    }

    async fn request_pairing_code(&self, _phone_number: &str) -> Result<String, TransportError> {
        Ok(self.pairing_code.clone())
    }
}

/// One accepted connection: the stub handed to the supervisor and the sender feeding its
/// event stream.
pub(crate) struct StubLink {
    pub connection: Arc<StubConnection>,
    events: Mutex<Option<mpsc::UnboundedSender<ConnectionEvent>>>,
}

impl StubLink {
    pub fn emit(&self, event: ConnectionEvent) {
        if let Some(events) = self.events.lock().expect("events").as_ref() {
            let _ = events.send(event);
        }
    }

    /// Ends the event stream as a dropped socket would.
    pub fn hang_up(&self) {
        self.events.lock().expect("events").take();
    }
}

#[derive(Default)]
pub(crate) struct StubConnector {
    pub attempts: AtomicUsize,
    pub failures: Mutex<VecDeque<bool>>,
    pub links: Mutex<Vec<Arc<StubLink>>>,
    pub credentials_seen: Mutex<Vec<Option<SessionCredentials>>>,
}

impl StubConnector {
    /// Queues the outcome of upcoming connect calls; `true` fails the attempt.
    pub fn fail_next(&self, fail: bool) {
        self.failures.lock().expect("failures").push_back(fail);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn link(&self, index: usize) -> Arc<StubLink> {
        Arc::clone(&self.links.lock().expect("links")[index])
    }
}

#[async_trait]
impl Connector for StubConnector {
    async fn connect(
        &self,
        _options: &ConnectOptions,
        credentials: Option<SessionCredentials>,
    ) -> Result<Established, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.credentials_seen
            .lock()
            .expect("credentials")
            .push(credentials);
        let fail = self
            .failures
            .lock()
            .expect("failures")
            .pop_front()
            .unwrap_or(false);
        if fail {
            return Err(TransportError::Closed);
        }

        let connection = StubConnection::new();
        let (events, events_rx) = mpsc::unbounded_channel();
        self.links.lock().expect("links").push(Arc::new(StubLink {
            connection: Arc::clone(&connection),
            events: Mutex::new(Some(events)),
        }));
        Ok(Established {
            connection,
            events: UnboundedReceiverStream::new(events_rx).boxed(),
        })
    }
}

#[derive(Default)]
pub(crate) struct MemoryCredentials {
    pub stored: Mutex<Option<SessionCredentials>>,
    pub saves: AtomicUsize,
}

#[async_trait]
impl CredentialStore for MemoryCredentials {
    async fn load_credentials(&self) -> anyhow::Result<Option<SessionCredentials>> {
        Ok(self.stored.lock().expect("credentials").clone())
    }

    async fn save_credentials(&self, credentials: &SessionCredentials) -> anyhow::Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.stored.lock().expect("credentials") = Some(credentials.clone());
        Ok(())
    }

    async fn clear_credentials(&self) -> anyhow::Result<()> {
        *self.stored.lock().expect("credentials") = None;
        Ok(())
    }
}

/// Records every upsert batch together with the generation it was delivered on.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    pub seen: Mutex<Vec<(u64, MessagesUpsert)>>,
}

impl RecordingHandler {
    pub fn message_ids(&self) -> Vec<String> {
        self.seen
            .lock()
            .expect("seen")
            .iter()
            .flat_map(|(_, upsert)| upsert.messages.iter().map(|m| m.key.id.clone()))
            .collect()
    }

    pub fn generations(&self) -> Vec<u64> {
        self.seen
            .lock()
            .expect("seen")
            .iter()
            .map(|(generation, _)| *generation)
            .collect()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn on_messages(
        &self,
        session: &Arc<Session>,
        upsert: &MessagesUpsert,
    ) -> anyhow::Result<()> {
        self.seen
            .lock()
            .expect("seen")
            .push((session.generation(), upsert.clone()));
        Ok(())
    }
}

pub(crate) struct Harness {
    pub connector: Arc<StubConnector>,
    pub credentials: Arc<MemoryCredentials>,
    pub messages: Arc<RecordingHandler>,
    pub store: Arc<MessageStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            connector: Arc::new(StubConnector::default()),
            credentials: Arc::new(MemoryCredentials::default()),
            messages: Arc::new(RecordingHandler::default()),
            store: Arc::new(MessageStore::default()),
        }
    }

    pub fn handlers(&self) -> Handlers {
        Handlers {
            messages: self.messages.clone(),
            updates: Arc::new(IgnoreUpdates),
            credentials: self.credentials.clone(),
            store: self.store.clone(),
        }
    }
}

/// Lets every runnable task make progress without moving the clock.
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
