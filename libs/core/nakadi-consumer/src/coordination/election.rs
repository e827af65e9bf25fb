//! Per-partition leader election.
//!
//! Each contested partition runs a small state machine:
//!
//! ```text
//!   Candidate ──acquire──► Leader ──key lost──► Candidate
//!       │                    │
//!       └──── relinquish ────┴──► Relinquished
//! ```
//!
//! A candidate retries `SET NX` on the leadership key; a leader refreshes it
//! three times per TTL. Relinquishing is a cancellable signal, optionally
//! notifying the listener that leadership ended.

use super::{CoordinationConfig, CoordinationStore};
use crate::error::ConsumerResult;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Candidate,
    Leader,
    Relinquished,
}

/// Receives leadership transitions for one partition.
#[async_trait]
pub trait LeadershipListener: Send + Sync + 'static {
    /// Failing here gives the key back; the election keeps contesting.
    async fn take_leadership(&self, partition: &str) -> ConsumerResult<()>;

    async fn leadership_lost(&self, partition: &str);
}

/// Cancellation signal: `None` while contesting, `Some(notify)` once relinquished.
type CancelSignal = Option<bool>;

pub struct LeaderElection {
    partition: String,
    state: Arc<Mutex<ElectionState>>,
    cancel: watch::Sender<CancelSignal>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderElection {
    /// Start contesting `key` for `partition`.
    pub fn start(
        store: Arc<dyn CoordinationStore>,
        config: &CoordinationConfig,
        key: String,
        partition: impl Into<String>,
        payload: impl Into<String>,
        listener: Arc<dyn LeadershipListener>,
    ) -> Self {
        let partition = partition.into();
        let state = Arc::new(Mutex::new(ElectionState::Candidate));
        let (cancel, cancel_rx) = watch::channel(None);

        let contest = Contest {
            store,
            key,
            partition: partition.clone(),
            payload: payload.into(),
            leader_ttl: config.leader_ttl(),
            refresh_interval: config.leader_refresh_interval(),
            retry_interval: config.election_retry(),
            state: state.clone(),
            listener,
        };
        let handle = tokio::spawn(contest.run(cancel_rx));

        Self {
            partition,
            state,
            cancel,
            task: Mutex::new(Some(handle)),
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn state(&self) -> ElectionState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ElectionState::Relinquished)
    }

    pub fn is_leader(&self) -> bool {
        self.state() == ElectionState::Leader
    }

    /// Stop contesting and release leadership if held. With `notify`, a held
    /// leadership is reported through `leadership_lost`.
    ///
    /// Must not be awaited from inside the listener callbacks.
    pub async fn relinquish(&self, notify: bool) {
        self.cancel.send_replace(Some(notify));
        let handle = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for LeaderElection {
    fn drop(&mut self) {
        self.cancel.send_replace(Some(false));
    }
}

struct Contest {
    store: Arc<dyn CoordinationStore>,
    key: String,
    partition: String,
    payload: String,
    leader_ttl: std::time::Duration,
    refresh_interval: std::time::Duration,
    retry_interval: std::time::Duration,
    state: Arc<Mutex<ElectionState>>,
    listener: Arc<dyn LeadershipListener>,
}

impl Contest {
    fn set_state(&self, next: ElectionState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    async fn run(self, mut cancel: watch::Receiver<CancelSignal>) {
        loop {
            if cancel.borrow().is_some() {
                break;
            }

            match self
                .store
                .try_acquire(&self.key, &self.payload, self.leader_ttl)
                .await
            {
                Ok(true) => {
                    if self.lead(&mut cancel).await {
                        return;
                    }
                }
                Ok(false) => debug!(partition = %self.partition, "Partition led by another member"),
                Err(e) => warn!(partition = %self.partition, error = %e, "Leader election attempt failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.retry_interval) => {}
                _ = cancel.changed() => break,
            }
        }

        self.set_state(ElectionState::Relinquished);
        debug!(partition = %self.partition, "Stopped contesting partition");
    }

    /// Hold leadership until it is lost (returns `false`) or relinquished
    /// (returns `true`).
    async fn lead(&self, cancel: &mut watch::Receiver<CancelSignal>) -> bool {
        self.set_state(ElectionState::Leader);
        info!(partition = %self.partition, "Took partition leadership");
        if let Err(e) = self.listener.take_leadership(&self.partition).await {
            warn!(partition = %self.partition, error = %e, "Could not take over partition, stepping down");
            if let Err(e) = self.store.delete_if_owner(&self.key, &self.payload).await {
                warn!(partition = %self.partition, error = %e, "Failed to release partition leadership");
            }
            self.set_state(ElectionState::Candidate);
            return false;
        }

        let mut refresh = tokio::time::interval(self.refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        refresh.tick().await;
        let mut last_refresh = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    let notify = cancel.borrow().unwrap_or(false);
                    self.release(notify).await;
                    return true;
                }
                _ = refresh.tick() => {
                    match self.store.refresh_if_owner(&self.key, &self.payload, self.leader_ttl).await {
                        Ok(true) => last_refresh = Instant::now(),
                        Ok(false) => {
                            warn!(partition = %self.partition, "Partition leadership lost");
                            break;
                        }
                        Err(e) => {
                            warn!(partition = %self.partition, error = %e, "Leadership refresh failed");
                            if last_refresh.elapsed() >= self.leader_ttl {
                                warn!(partition = %self.partition, "Partition leadership expired");
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.set_state(ElectionState::Candidate);
        self.listener.leadership_lost(&self.partition).await;
        false
    }

    async fn release(&self, notify: bool) {
        if let Err(e) = self.store.delete_if_owner(&self.key, &self.payload).await {
            warn!(partition = %self.partition, error = %e, "Failed to release partition leadership");
        }
        self.set_state(ElectionState::Relinquished);
        info!(partition = %self.partition, notify, "Relinquished partition leadership");
        if notify {
            self.listener.leadership_lost(&self.partition).await;
        }
    }
}
