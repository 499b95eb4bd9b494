use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use shared::{
    domain::{DisconnectReason, MessageUpdate, MessagesUpsert},
    protocol::{ConnectionEvent, ConnectionPhase, ConnectionUpdate},
};
use storage::CredentialStore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::{
    message_store::MessageStore, session::Session, supervisor::ConnectionSupervisor,
    transport::EventStream,
};

/// Command interpretation lives behind this seam; every inbound batch is delivered once,
/// in arrival order, together with the session it arrived on.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_messages(&self, session: &Arc<Session>, upsert: &MessagesUpsert) -> Result<()>;
}

#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn on_updates(&self, session: &Arc<Session>, updates: &[MessageUpdate]) -> Result<()>;
}

pub struct IgnoreUpdates;

#[async_trait]
impl UpdateHandler for IgnoreUpdates {
    async fn on_updates(&self, _session: &Arc<Session>, _updates: &[MessageUpdate]) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct Handlers {
    pub messages: Arc<dyn MessageHandler>,
    pub updates: Arc<dyn UpdateHandler>,
    pub credentials: Arc<dyn CredentialStore>,
    pub store: Arc<MessageStore>,
}

/// Consumes the event stream of one connection generation. It stops right after routing
/// the close of its own generation, and at the next event once a newer generation exists.
pub struct EventRouter {
    supervisor: ConnectionSupervisor,
    session: Arc<Session>,
    handlers: Handlers,
}

impl EventRouter {
    pub fn new(supervisor: ConnectionSupervisor, session: Arc<Session>) -> Self {
        let handlers = supervisor.handlers().clone();
        Self {
            supervisor,
            session,
            handlers,
        }
    }

    pub fn generation(&self) -> u64 {
        self.session.generation()
    }

    pub fn spawn(self, events: EventStream) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(events).await })
    }

    pub async fn run(self, mut events: EventStream) {
        let generation = self.generation();
        while let Some(event) = events.next().await {
            if !self.supervisor.is_current(generation) {
                debug!(generation, "connection replaced; router stopping");
                return;
            }
            self.route(event).await;
            if self.session.is_retired() {
                debug!(generation, "connection closed; router stopping");
                return;
            }
        }

        debug!(generation, "event stream ended");
        let still_live = self
            .supervisor
            .session()
            .is_some_and(|session| session.generation() == generation);
        if still_live {
            self.supervisor
                .handle_close(generation, DisconnectReason::ConnectionLost);
        }
    }

    pub async fn route(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::ConnectionUpdate(update) => self.on_connection_update(update),
            ConnectionEvent::CredentialsUpdated(credentials) => {
                if let Err(err) = self.handlers.credentials.save_credentials(&credentials).await {
                    error!(error = %format!("{err:#}"), "failed to persist rotated credentials");
                }
            }
            ConnectionEvent::MessagesUpserted(upsert) => {
                for message in &upsert.messages {
                    self.handlers.store.record(message);
                }
                if let Err(err) = self.handlers.messages.on_messages(&self.session, &upsert).await
                {
                    error!(
                        error = %format!("{err:#}"),
                        count = upsert.messages.len(),
                        "message handler failed"
                    );
                }
            }
            ConnectionEvent::MessagesUpdated(updates) => {
                if let Err(err) = self.handlers.updates.on_updates(&self.session, &updates).await {
                    error!(error = %format!("{err:#}"), "message update handler failed");
                }
            }
        }
    }

    fn on_connection_update(&self, update: ConnectionUpdate) {
        let generation = self.generation();
        if update.qr.is_some() {
            info!("pairing QR available; link the device through /pair instead");
        }
        match update.connection {
            Some(ConnectionPhase::Close) => self.supervisor.handle_close(
                generation,
                DisconnectReason::from_status_code(update.close_status()),
            ),
            Some(ConnectionPhase::Open) => self.supervisor.handle_open(generation, update.account),
            Some(ConnectionPhase::Connecting) => debug!(generation, "connection handshake in progress"),
            None => {}
        }
        if update.received_pending_notifications {
            info!(generation, "synchronising pending messages");
        }
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
