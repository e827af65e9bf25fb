//! Ephemeral group membership scoped to (event type, consumer name).
//!
//! A member writes `{memberId, host, created}` under a TTL key and keeps it
//! alive with heartbeats. Peers notice a crashed member when its key
//! expires. The member list is polled and every change is published as a
//! [`MembershipEvent::Changed`].
//!
//! Losing the local session (the key vanished, or the store has been
//! unreachable for longer than the TTL) is published as
//! [`MembershipEvent::SessionLost`]; the member then rejoins and a fresh
//! `Changed` follows once it is visible again.

use super::{CoordinationConfig, CoordinationStore, KeySpace};
use crate::error::{ConsumerError, ConsumerResult};
use crate::model::{ConsumerName, EventType, GroupMember};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// Current member ids, sent whenever the set changes
    Changed(BTreeSet<String>),
    /// This process lost its own membership
    SessionLost,
}

pub struct GroupMembership {
    store: Arc<dyn CoordinationStore>,
    config: CoordinationConfig,
    event_type: EventType,
    member: GroupMember,
    member_key: String,
    members_prefix: String,
    payload: String,
    snapshot: Arc<RwLock<BTreeSet<String>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    joined: AtomicBool,
}

impl GroupMembership {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        config: CoordinationConfig,
        event_type: EventType,
        consumer: &ConsumerName,
        member: GroupMember,
    ) -> ConsumerResult<Self> {
        let keys: KeySpace = config.key_space();
        let payload = serde_json::to_string(&member)?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            member_key: keys.member(&event_type, consumer, &member.member_id),
            members_prefix: keys.members_prefix(&event_type, consumer),
            store,
            config,
            event_type,
            member,
            payload,
            snapshot: Arc::new(RwLock::new(BTreeSet::new())),
            shutdown,
            task: Mutex::new(None),
            joined: AtomicBool::new(false),
        })
    }

    pub fn member(&self) -> &GroupMember {
        &self.member
    }

    pub fn member_id(&self) -> &str {
        &self.member.member_id
    }

    /// JSON document stored under this member's keys.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Last observed member ids.
    pub fn members(&self) -> BTreeSet<String> {
        self.snapshot
            .read()
            .map(|members| members.clone())
            .unwrap_or_default()
    }

    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    /// Register in the group and start heartbeat and membership polling.
    ///
    /// The first event on the returned receiver is the initial membership.
    pub async fn join(&self) -> ConsumerResult<mpsc::UnboundedReceiver<MembershipEvent>> {
        if self.joined.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::registration(format!(
                "member {} already joined {}",
                self.member.member_id, self.event_type
            )));
        }

        let joined = async {
            self.store
                .put_ephemeral(&self.member_key, &self.payload, self.config.member_ttl())
                .await?;
            list_members(self.store.as_ref(), &self.members_prefix).await
        }
        .await;

        let initial = match joined {
            Ok(initial) => initial,
            Err(e) => {
                self.joined.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        if let Ok(mut snapshot) = self.snapshot.write() {
            *snapshot = initial.clone();
        }

        let (events, receiver) = mpsc::unbounded_channel();
        let _ = events.send(MembershipEvent::Changed(initial.clone()));

        let worker = MembershipWorker {
            store: self.store.clone(),
            config: self.config.clone(),
            member_id: self.member.member_id.clone(),
            member_key: self.member_key.clone(),
            members_prefix: self.members_prefix.clone(),
            payload: self.payload.clone(),
            snapshot: self.snapshot.clone(),
            events,
            last_known: initial,
        };
        let handle = tokio::spawn(worker.run(self.shutdown.subscribe()));
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }

        info!(
            event_type = %self.event_type,
            member_id = %self.member.member_id,
            host = %self.member.host,
            "Joined consumer group"
        );
        Ok(receiver)
    }

    /// Stop heartbeats and remove this member from the group.
    pub async fn leave(&self) -> ConsumerResult<()> {
        if !self.joined.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown.send_replace(true);
        let handle = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.store
            .delete_if_owner(&self.member_key, &self.payload)
            .await?;

        info!(
            event_type = %self.event_type,
            member_id = %self.member.member_id,
            "Left consumer group"
        );
        Ok(())
    }
}

impl Drop for GroupMembership {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn list_members(store: &dyn CoordinationStore, prefix: &str) -> ConsumerResult<BTreeSet<String>> {
    Ok(store
        .list(prefix)
        .await?
        .into_iter()
        .filter_map(|(key, _)| key.strip_prefix(prefix).map(str::to_string))
        .collect())
}

struct MembershipWorker {
    store: Arc<dyn CoordinationStore>,
    config: CoordinationConfig,
    member_id: String,
    member_key: String,
    members_prefix: String,
    payload: String,
    snapshot: Arc<RwLock<BTreeSet<String>>>,
    events: mpsc::UnboundedSender<MembershipEvent>,
    last_known: BTreeSet<String>,
}

impl MembershipWorker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll = tokio::time::interval(self.config.membership_poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_heartbeat = Instant::now();
        let mut session_lost = false;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = heartbeat.tick() => {
                    match self.store.refresh_if_owner(&self.member_key, &self.payload, self.config.member_ttl()).await {
                        Ok(true) => {
                            last_heartbeat = Instant::now();
                            if session_lost {
                                info!(member_id = %self.member_id, "Coordination session restored");
                                session_lost = false;
                                self.forget_members();
                            }
                        }
                        Ok(false) => {
                            if !session_lost {
                                self.report_session_lost("membership key expired");
                            }
                            session_lost = true;
                            match self.store.put_ephemeral(&self.member_key, &self.payload, self.config.member_ttl()).await {
                                Ok(()) => {
                                    info!(member_id = %self.member_id, "Rejoined consumer group");
                                    last_heartbeat = Instant::now();
                                    session_lost = false;
                                    self.forget_members();
                                }
                                Err(e) => warn!(member_id = %self.member_id, error = %e, "Failed to rejoin consumer group"),
                            }
                        }
                        Err(e) => {
                            warn!(member_id = %self.member_id, error = %e, "Membership heartbeat failed");
                            if !session_lost && last_heartbeat.elapsed() >= self.config.member_ttl() {
                                self.report_session_lost("coordination store unreachable");
                                session_lost = true;
                            }
                        }
                    }
                }
                _ = poll.tick() => {
                    match list_members(self.store.as_ref(), &self.members_prefix).await {
                        Ok(members) if members != self.last_known => {
                            debug!(member_id = %self.member_id, members = ?members, "Membership changed");
                            if let Ok(mut snapshot) = self.snapshot.write() {
                                *snapshot = members.clone();
                            }
                            self.last_known = members.clone();
                            if self.events.send(MembershipEvent::Changed(members)).is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!(member_id = %self.member_id, error = %e, "Failed to list group members"),
                    }
                }
            }
        }

        debug!(member_id = %self.member_id, "Membership worker stopped");
    }

    fn report_session_lost(&self, reason: &str) {
        warn!(member_id = %self.member_id, reason, "Coordination session lost");
        let _ = self.events.send(MembershipEvent::SessionLost);
    }

    /// Force the next poll to publish the membership again.
    fn forget_members(&mut self) {
        self.last_known.clear();
        if let Ok(mut snapshot) = self.snapshot.write() {
            snapshot.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinationStore;
    use std::time::Duration;

    fn config() -> CoordinationConfig {
        CoordinationConfig::default()
            .with_member_ttl_ms(300)
            .with_heartbeat_interval_ms(50)
            .with_membership_poll_interval_ms(20)
    }

    fn membership(store: &Arc<MemoryCoordinationStore>, id: &str) -> GroupMembership {
        GroupMembership::new(
            store.clone(),
            config(),
            EventType::new("order.created"),
            &ConsumerName::new("billing"),
            GroupMember::new(id, "localhost"),
        )
        .unwrap()
    }

    async fn next_change(rx: &mut mpsc::UnboundedReceiver<MembershipEvent>) -> MembershipEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("membership event")
            .expect("channel open")
    }

    fn ids(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_join_publishes_initial_membership() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let a = membership(&store, "a");

        let mut events = a.join().await.unwrap();
        assert_eq!(next_change(&mut events).await, MembershipEvent::Changed(ids(&["a"])));
        assert_eq!(a.members(), ids(&["a"]));

        let stored = store
            .get("nakadi:members:order.created:billing:a")
            .await
            .unwrap()
            .unwrap();
        assert!(stored.contains("\"memberId\":\"a\""));

        a.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_peers_see_join_and_leave() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let a = membership(&store, "a");
        let b = membership(&store, "b");

        let mut events = a.join().await.unwrap();
        next_change(&mut events).await;

        let _b_events = b.join().await.unwrap();
        assert_eq!(next_change(&mut events).await, MembershipEvent::Changed(ids(&["a", "b"])));

        b.leave().await.unwrap();
        assert_eq!(next_change(&mut events).await, MembershipEvent::Changed(ids(&["a"])));

        a.leave().await.unwrap();
        assert!(store.list("nakadi:members:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_loss_then_rejoin() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let a = membership(&store, "a");

        let mut events = a.join().await.unwrap();
        next_change(&mut events).await;

        // Evicted by the coordination service
        store
            .delete("nakadi:members:order.created:billing:a")
            .await
            .unwrap();

        let mut saw_loss = false;
        loop {
            match next_change(&mut events).await {
                MembershipEvent::SessionLost => saw_loss = true,
                MembershipEvent::Changed(members) if saw_loss && members == ids(&["a"]) => break,
                MembershipEvent::Changed(_) => {}
            }
        }
        assert!(saw_loss);

        a.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_join_fails() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let a = membership(&store, "a");

        let _events = a.join().await.unwrap();
        assert!(matches!(a.join().await, Err(ConsumerError::Registration(_))));
        a.leave().await.unwrap();
    }
}
