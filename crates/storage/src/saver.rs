use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error};

use crate::{SharedState, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// Another save was running; a follow-up save was queued instead.
    Deferred,
    Failed,
}

#[derive(Debug, Default)]
struct SaveFlags {
    saving: bool,
    pending: bool,
}

/// Writes the shared application state back to its store on a fixed cadence.
///
/// At most one write runs at a time. A save requested while a write is in flight marks
/// the state as pending, and the run loop performs one follow-up write `retry_delay`
/// after the in-flight one finishes. Write failures are logged and left for the next
/// cycle. [`StateSaver::shutdown`] stops the loop between writes and saves once more.
pub struct StateSaver {
    store: Arc<dyn StateStore>,
    state: SharedState,
    flags: Mutex<SaveFlags>,
    follow_up: Notify,
    stop: watch::Sender<bool>,
    retry_delay: Duration,
}

/// Clears the in-flight flag even when the writing task is cancelled mid-write.
struct SavingFlag<'a> {
    saver: &'a StateSaver,
}

impl Drop for SavingFlag<'_> {
    fn drop(&mut self) {
        let follow_up = {
            let mut flags = self.saver.flags.lock().unwrap_or_else(PoisonError::into_inner);
            flags.saving = false;
            std::mem::take(&mut flags.pending)
        };
        if follow_up {
            self.saver.follow_up.notify_one();
        }
    }
}

impl StateSaver {
    pub fn new(store: Arc<dyn StateStore>, state: SharedState, retry_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            state,
            flags: Mutex::new(SaveFlags::default()),
            follow_up: Notify::new(),
            stop: watch::channel(false).0,
            retry_delay,
        })
    }

    pub async fn save(&self) -> SaveOutcome {
        {
            let mut flags = self.flags.lock().unwrap_or_else(PoisonError::into_inner);
            if flags.saving {
                flags.pending = true;
                debug!("state save already running; queued follow-up");
                return SaveOutcome::Deferred;
            }
            flags.saving = true;
        }
        let _saving = SavingFlag { saver: self };

        let snapshot = self.state.read().await.clone();
        match self.store.write(&snapshot).await {
            Ok(()) => SaveOutcome::Saved,
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to save application state");
                SaveOutcome::Failed
            }
        }
    }

    pub fn spawn(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let saver = Arc::clone(self);
        tokio::spawn(async move { saver.run(interval).await })
    }

    /// Stops the loop returned by [`StateSaver::spawn`], letting a write in flight finish,
    /// then writes the current state one last time.
    pub async fn shutdown(&self, save_loop: JoinHandle<()>) -> SaveOutcome {
        self.stop.send_replace(true);
        if let Err(err) = save_loop.await {
            error!(error = %err, "state save loop ended abnormally");
        }
        self.save().await
    }

    async fn run(&self, interval: Duration) {
        let mut stop = self.stop.subscribe();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            let follow_up = tokio::select! {
                _ = ticker.tick() => false,
                _ = self.follow_up.notified() => true,
                _ = stop.wait_for(|stopped| *stopped) => break,
            };
            if follow_up {
                tokio::select! {
                    _ = tokio::time::sleep(self.retry_delay) => {}
                    _ = stop.wait_for(|stopped| *stopped) => break,
                }
            }
            self.save().await;
        }
        debug!("state save loop stopped");
    }
}
