use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use anyhow::{bail, Context, Result};
use shared::{
    domain::{AccountInfo, ConnectionState, DisconnectReason},
    protocol::ConnectOptions,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    backoff::Backoff,
    dispatch::DispatchConfig,
    group_cache::GroupCacheConfig,
    router::{EventRouter, Handlers},
    session::Session,
    transport::{Connector, EventStream},
};

#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
    pub backoff: Backoff,
    pub connect: ConnectOptions,
    pub dispatch: DispatchConfig,
    pub groups: GroupCacheConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SupervisorExit {
    #[error("device logged out; the stored session is no longer valid")]
    LoggedOut,
}

#[derive(Default)]
struct SupervisorState {
    generation: u64,
    session: Option<Arc<Session>>,
    attempts: u32,
    logged_out: bool,
}

struct SupervisorInner {
    connector: Arc<dyn Connector>,
    handlers: Handlers,
    config: SupervisorConfig,
    state: Mutex<SupervisorState>,
    reconnecting: AtomicBool,
    status: watch::Sender<ConnectionState>,
}

/// Keeps exactly one live connection and brings it back after it drops.
///
/// Every successful handshake starts a new generation: a fresh [`Session`] (dispatch
/// queue and group cache) and an [`EventRouter`] bound to it. A close reported by the
/// current generation retires its session immediately and arms a single backoff-delayed
/// reconnect; further closes seen while that reconnect is armed are ignored. A logged-out
/// close is terminal.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ConnectionSupervisor {
    pub fn new(connector: Arc<dyn Connector>, handlers: Handlers, config: SupervisorConfig) -> Self {
        let (status, _) = watch::channel(ConnectionState::Connecting);
        Self {
            inner: Arc::new(SupervisorInner {
                connector,
                handlers,
                config,
                state: Mutex::new(SupervisorState::default()),
                reconnecting: AtomicBool::new(false),
                status,
            }),
        }
    }

    /// Connects and keeps reconnecting until the account is logged out.
    pub async fn run(&self) -> SupervisorExit {
        let mut status = self.subscribe();
        if let Err(err) = self.establish().await {
            warn!(error = %format!("{err:#}"), "initial connection failed");
            self.set_state(ConnectionState::Closed);
            self.schedule_reconnect(DisconnectReason::ConnectFailed);
        }
        let _ = status
            .wait_for(|state| *state == ConnectionState::LoggedOut)
            .await;
        SupervisorExit::LoggedOut
    }

    pub async fn establish(&self) -> Result<Arc<Session>> {
        let (session, events) = self.connect_generation().await?;
        self.activate(Arc::clone(&session), events);
        Ok(session)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.status.subscribe()
    }

    /// The live session, if any. `None` from the moment a close is reported until the
    /// next successful handshake.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.lock_state().session.clone()
    }

    pub fn attempts(&self) -> u32 {
        self.lock_state().attempts
    }

    pub fn generation(&self) -> u64 {
        self.lock_state().generation
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::SeqCst)
    }

    pub fn is_logged_out(&self) -> bool {
        self.lock_state().logged_out
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.lock_state().generation == generation
    }

    pub(crate) fn handle_open(&self, generation: u64, account: Option<AccountInfo>) {
        let session = {
            let mut state = self.lock_state();
            if state.generation != generation || state.logged_out {
                return;
            }
            let Some(session) = state.session.clone() else {
                debug!(generation, "ignoring open for a connection already closed");
                return;
            };
            state.attempts = 0;
            session
        };
        self.set_state(ConnectionState::Open);

        let account = account.or_else(|| session.account());
        info!(
            generation,
            user = account.as_ref().and_then(|a| a.name.as_deref()).unwrap_or("unknown"),
            jid = account.as_ref().map_or("unknown", |a| a.id.as_str()),
            "connected; ready to receive messages"
        );
    }

    pub(crate) fn handle_close(&self, generation: u64, reason: DisconnectReason) {
        {
            let mut state = self.lock_state();
            if state.generation != generation || state.logged_out {
                debug!(generation, %reason, "ignoring close from a replaced connection");
                return;
            }
            if let Some(session) = state.session.take() {
                session.retire();
            }
            if reason.is_logged_out() {
                state.logged_out = true;
            }
        }

        warn!(generation, %reason, "connection closed");
        if reason.is_logged_out() {
            error!("device logged out; stored credentials must be discarded");
            self.set_state(ConnectionState::LoggedOut);
            return;
        }
        self.set_state(ConnectionState::Closed);
        self.schedule_reconnect(reason);
    }

    pub(crate) fn handlers(&self) -> &Handlers {
        &self.inner.handlers
    }

    fn schedule_reconnect(&self, reason: DisconnectReason) {
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            debug!(%reason, "reconnect already scheduled");
            return;
        }
        let attempt = {
            let mut state = self.lock_state();
            state.attempts = state.attempts.saturating_add(1);
            state.attempts
        };
        let delay = self.inner.config.backoff.delay(attempt);
        info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            %reason,
            "scheduling reconnect"
        );

        let supervisor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            supervisor.reconnect(attempt).await;
        });
    }

    async fn reconnect(&self, attempt: u32) {
        if self.is_logged_out() {
            self.inner.reconnecting.store(false, Ordering::SeqCst);
            return;
        }
        let result = self.connect_generation().await;
        // cleared before the new generation can report anything
        self.inner.reconnecting.store(false, Ordering::SeqCst);
        match result {
            Ok((session, events)) => self.activate(session, events),
            Err(err) => {
                warn!(attempt, error = %format!("{err:#}"), "reconnect failed");
                self.set_state(ConnectionState::Closed);
                self.schedule_reconnect(DisconnectReason::ConnectFailed);
            }
        }
    }

    async fn connect_generation(&self) -> Result<(Arc<Session>, EventStream)> {
        if self.is_logged_out() {
            bail!("account is logged out");
        }
        self.set_state(ConnectionState::Connecting);

        let credentials = match self.inner.handlers.credentials.load_credentials().await {
            Ok(credentials) => credentials,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to load session credentials; connecting without them");
                None
            }
        };
        let established = self
            .inner
            .connector
            .connect(&self.inner.config.connect, credentials)
            .await
            .context("messaging handshake failed")?;

        let session = {
            let mut state = self.lock_state();
            state.generation += 1;
            let session = Arc::new(Session::new(
                state.generation,
                established.connection,
                &self.inner.config.dispatch,
                &self.inner.config.groups,
            ));
            if let Some(previous) = state.session.replace(Arc::clone(&session)) {
                previous.retire();
            }
            state.attempts = 0;
            session
        };
        info!(generation = session.generation(), "connection established");
        Ok((session, established.events))
    }

    fn activate(&self, session: Arc<Session>, events: EventStream) {
        EventRouter::new(self.clone(), session).spawn(events);
    }

    fn set_state(&self, next: ConnectionState) {
        self.inner.status.send_if_modified(|state| {
            if *state == next || *state == ConnectionState::LoggedOut {
                return false;
            }
            *state = next;
            true
        });
    }

    fn lock_state(&self) -> MutexGuard<'_, SupervisorState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests/supervisor_tests.rs"]
mod tests;
