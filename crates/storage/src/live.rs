//! Live message queries.
//!
//! A subscription is a producer task plus a receiving handle. The task pushes a fresh
//! [`MessageSet`] whenever the store commits a message involving the subscriber, and keeps
//! doing so until the handle is cancelled or dropped.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use snafu::Snafu;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot};

use super::MessageStore;
use super::error::StorageError;
use super::ids::UserId;
use super::types::{ChangeNotice, MessageQuery, MessageSet};

pub type SubscriptionWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Exponential backoff applied while the store keeps failing a live query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl ReconnectPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
        }
    }

    /// Delay before retry number `attempt` (zero based), doubling up to `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SubscriptionError {
    #[snafu(display("live query failed on `{stage}`: {source}"))]
    Query {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("store change feed closed on `{stage}`"))]
    ChangeFeedClosed { stage: &'static str },
}

#[derive(Debug)]
pub enum SubscriptionEvent {
    /// Current window of messages involving the subscriber, newest first.
    Snapshot(MessageSet),
    /// The store stopped answering; the worker retries after `retry_in`.
    Offline {
        error: SubscriptionError,
        retry_in: Duration,
    },
    /// The store answered again after an outage. A snapshot follows immediately.
    Online,
}

pub struct MessageSubscription {
    participant: UserId,
    events: mpsc::UnboundedReceiver<SubscriptionEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct SubscriptionHandle {
    pub subscription: MessageSubscription,
    pub worker: SubscriptionWorker,
}

impl SubscriptionHandle {
    /// Spawns the worker on the current tokio runtime and returns the receiving side.
    pub fn spawn(self) -> MessageSubscription {
        tokio::spawn(self.worker);
        self.subscription
    }
}

impl MessageSubscription {
    pub fn participant(&self) -> UserId {
        self.participant
    }

    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SubscriptionEvent> {
        self.events.try_recv().ok()
    }

    /// Stops the worker. Returns false when it had already stopped.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_tx.is_none()
    }
}

impl Drop for MessageSubscription {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

impl Stream for MessageSubscription {
    type Item = SubscriptionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

/// Opens a live query over the `window` most recent messages involving `participant`.
pub fn subscribe_messages(
    store: Arc<dyn MessageStore>,
    participant: UserId,
    window: usize,
    policy: ReconnectPolicy,
) -> SubscriptionHandle {
    let (event_tx, events) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let query = MessageQuery::recent(participant).with_limit(window);

    SubscriptionHandle {
        subscription: MessageSubscription {
            participant,
            events,
            cancel_tx: Some(cancel_tx),
        },
        worker: Box::pin(run_subscription_worker(
            store, query, policy, event_tx, cancel_rx,
        )),
    }
}

async fn run_subscription_worker(
    store: Arc<dyn MessageStore>,
    query: MessageQuery,
    policy: ReconnectPolicy,
    event_tx: mpsc::UnboundedSender<SubscriptionEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    // Attach to the change feed before the first read so no append can fall between them.
    let mut changes = store.watch_changes();
    let mut failures: u32 = 0;
    let mut needs_refresh = true;

    loop {
        if needs_refresh {
            // Notices already queued are covered by the query below.
            let coalesced = drain_pending_notices(&mut changes);
            if coalesced > 0 {
                tracing::trace!(participant = %query.participant, coalesced, "coalesced notices");
            }
            match store.query_messages(query).await {
                Ok(set) => {
                    if failures > 0 {
                        tracing::info!(
                            participant = %query.participant,
                            failures,
                            "live query recovered"
                        );
                        failures = 0;
                        if event_tx.send(SubscriptionEvent::Online).is_err() {
                            return;
                        }
                    }
                    if event_tx.send(SubscriptionEvent::Snapshot(set)).is_err() {
                        return;
                    }
                    needs_refresh = false;
                }
                Err(source) => {
                    let retry_in = policy.delay_for_attempt(failures);
                    failures = failures.saturating_add(1);
                    tracing::warn!(
                        participant = %query.participant,
                        error = %source,
                        retry_in_ms = retry_in.as_millis() as u64,
                        "live query failed; retrying"
                    );
                    let event = SubscriptionEvent::Offline {
                        error: SubscriptionError::Query {
                            stage: "live-query-refresh",
                            source,
                        },
                        retry_in,
                    };
                    if event_tx.send(event).is_err() {
                        return;
                    }

                    tokio::select! {
                        _ = &mut cancel_rx => return,
                        _ = tokio::time::sleep(retry_in) => continue,
                    }
                }
            }
        }

        tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(participant = %query.participant, "live query cancelled");
                return;
            }
            notice = changes.recv() => match notice {
                Ok(notice) => {
                    if notice.participants.contains(query.participant) {
                        needs_refresh = true;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        participant = %query.participant,
                        skipped,
                        "change feed lagged"
                    );
                    needs_refresh = true;
                }
                Err(RecvError::Closed) => {
                    let _ = event_tx.send(SubscriptionEvent::Offline {
                        error: SubscriptionError::ChangeFeedClosed {
                            stage: "live-query-change-feed",
                        },
                        retry_in: Duration::ZERO,
                    });
                    return;
                }
            },
        }
    }
}

/// Empties the receiver without waiting and returns how many notices were dropped.
fn drain_pending_notices(changes: &mut broadcast::Receiver<ChangeNotice>) -> usize {
    let mut drained = 0;
    loop {
        match changes.try_recv() {
            Ok(_) => drained += 1,
            Err(TryRecvError::Lagged(skipped)) => drained += skipped as usize,
            Err(TryRecvError::Empty | TryRecvError::Closed) => return drained,
        }
    }
}
