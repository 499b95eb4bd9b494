use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    task::{Context, Poll},
    time::Duration,
};

use shared::domain::{Jid, OutgoingMessage, SendReceipt};
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};
use tracing::{debug, warn};

use crate::{rate_limiter::RateLimiter, transport::Connection};

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub min_interval: Duration,
    pub send_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_interval: crate::rate_limiter::DEFAULT_MIN_SEND_INTERVAL,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

struct Tail {
    seq: u64,
    done: oneshot::Receiver<()>,
}

struct DispatchInner {
    connection: Arc<dyn Connection>,
    limiter: RateLimiter,
    send_timeout: Duration,
    tails: Mutex<HashMap<Jid, Tail>>,
    next_seq: AtomicU64,
    retired: AtomicBool,
}

/// Outbound send queue bound to one connection generation.
///
/// Sends to the same recipient run strictly one after another in call order; sends to
/// different recipients run independently. Each send is rate limited per recipient and
/// bounded by a timeout, and a failed or stuck send resolves to `None` without holding up
/// the sends queued behind it.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<DispatchInner>,
}

impl DispatchQueue {
    pub fn new(connection: Arc<dyn Connection>, config: &DispatchConfig) -> Self {
        Self {
            inner: Arc::new(DispatchInner {
                connection,
                limiter: RateLimiter::new(config.min_interval),
                send_timeout: config.send_timeout,
                tails: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
                retired: AtomicBool::new(false),
            }),
        }
    }

    /// Queues a send. The position in the recipient's queue is fixed when this is called,
    /// not when the returned handle is first polled; dropping the handle does not cancel
    /// the send.
    pub fn send(&self, recipient: Jid, message: OutgoingMessage) -> SendHandle {
        let (done_tx, done_rx) = oneshot::channel();
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .inner
            .tails
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(recipient.clone(), Tail { seq, done: done_rx });

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                // an Err means the predecessor is gone, which also frees the slot
                let _ = previous.done.await;
            }
            let outcome = inner.deliver(&recipient, &message).await;
            inner.release(&recipient, seq);
            let _ = done_tx.send(());
            outcome
        });
        SendHandle { task }
    }

    /// Marks the queue as belonging to a closed connection. Sends that reach the head
    /// of their queue afterwards resolve to `None` without touching the transport.
    pub fn retire(&self) {
        self.inner.retired.store(true, Ordering::SeqCst);
    }

    pub fn is_retired(&self) -> bool {
        self.inner.retired.load(Ordering::SeqCst)
    }

    pub fn pending_recipients(&self) -> usize {
        self.inner
            .tails
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }
}

impl DispatchInner {
    async fn deliver(&self, recipient: &Jid, message: &OutgoingMessage) -> Option<SendReceipt> {
        if self.retired.load(Ordering::SeqCst) {
            warn!(%recipient, "dropping send queued on a closed connection");
            return None;
        }

        self.limiter.wait_turn(recipient).await;

        match tokio::time::timeout(
            self.send_timeout,
            self.connection.send_message(recipient, message),
        )
        .await
        {
            Ok(Ok(receipt)) => {
                self.limiter.record(recipient, Instant::now());
                debug!(%recipient, message_id = %receipt.message_id, "message sent");
                Some(receipt)
            }
            Ok(Err(err)) => {
                warn!(%recipient, error = %err, "send failed");
                None
            }
            Err(_) => {
                warn!(
                    %recipient,
                    timeout_ms = self.send_timeout.as_millis() as u64,
                    "send timed out"
                );
                None
            }
        }
    }

    fn release(&self, recipient: &Jid, seq: u64) {
        let mut tails = self.tails.lock().unwrap_or_else(PoisonError::into_inner);
        if tails.get(recipient).is_some_and(|tail| tail.seq == seq) {
            tails.remove(recipient);
        }
    }
}

/// Completion of a queued send: `Some(receipt)` on success, `None` on failure or timeout.
pub struct SendHandle {
    task: JoinHandle<Option<SendReceipt>>,
}

impl Future for SendHandle {
    type Output = Option<SendReceipt>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.task).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(err)) => {
                warn!(error = %err, "send task ended abnormally");
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
